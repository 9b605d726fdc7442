//! Host/proxy binding: the junction row with per-host health counters.
//!
//! Counters here are independent from the proxy's global counters. The same
//! proxy can be healthy against host A and disabled against host B.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::{db_id, OrchestratorError};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct HostProxyBinding {
    #[builder(default = db_id())]
    pub id: Uuid,

    pub host_id: Uuid,
    pub proxy_id: Uuid,

    #[builder(default = true)]
    pub active: bool,
    #[builder(default = 5)]
    pub priority: i32,

    /// Advanced atomically at acquire time; the LRU key.
    #[builder(default, setter(strip_option))]
    pub last_used_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub success_count: i64,
    /// Consecutive failures against this host only.
    #[builder(default = 0)]
    pub failure_count: i32,
    #[builder(default, setter(strip_option))]
    pub avg_latency_ms: Option<i32>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

pub(crate) const BINDING_COLUMNS: &str = "id, host_id, proxy_id, active, priority, last_used_at, \
     success_count, failure_count, avg_latency_ms, created_at, updated_at";

impl HostProxyBinding {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count as i64;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }

    pub async fn find_pair(
        host_id: Uuid,
        proxy_id: Uuid,
        db: &PgPool,
    ) -> Result<Option<Self>, OrchestratorError> {
        let binding = sqlx::query_as::<_, Self>(&format!(
            "SELECT {BINDING_COLUMNS} FROM host_proxy_bindings \
             WHERE host_id = $1 AND proxy_id = $2"
        ))
        .bind(host_id)
        .bind(proxy_id)
        .fetch_optional(db)
        .await?;
        Ok(binding)
    }

    pub async fn list_for_host(
        host_id: Uuid,
        db: &PgPool,
    ) -> Result<Vec<Self>, OrchestratorError> {
        let bindings = sqlx::query_as::<_, Self>(&format!(
            "SELECT {BINDING_COLUMNS} FROM host_proxy_bindings \
             WHERE host_id = $1 ORDER BY priority ASC, created_at ASC"
        ))
        .bind(host_id)
        .fetch_all(db)
        .await?;
        Ok(bindings)
    }

    pub async fn insert(&self, db: &PgPool) -> Result<Self, OrchestratorError> {
        let binding = sqlx::query_as::<_, Self>(&format!(
            "INSERT INTO host_proxy_bindings (
                id, host_id, proxy_id, active, priority, last_used_at,
                success_count, failure_count, avg_latency_ms, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {BINDING_COLUMNS}"
        ))
        .bind(self.id)
        .bind(self.host_id)
        .bind(self.proxy_id)
        .bind(self.active)
        .bind(self.priority)
        .bind(self.last_used_at)
        .bind(self.success_count)
        .bind(self.failure_count)
        .bind(self.avg_latency_ms)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;
        Ok(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_is_per_binding() {
        let binding = HostProxyBinding::builder()
            .host_id(Uuid::now_v7())
            .proxy_id(Uuid::now_v7())
            .success_count(9_i64)
            .failure_count(1)
            .build();
        assert_eq!(binding.success_rate(), 0.9);
    }

    #[test]
    fn fresh_binding_has_no_usage() {
        let binding = HostProxyBinding::builder()
            .host_id(Uuid::now_v7())
            .proxy_id(Uuid::now_v7())
            .build();
        assert!(binding.last_used_at.is_none());
        assert_eq!(binding.success_rate(), 0.0);
    }
}
