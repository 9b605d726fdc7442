//! Proxy model: an outbound identity with global health accounting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::{db_id, OrchestratorError};
use crate::kernel::record::Record;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Proxy {
    #[builder(default = db_id())]
    pub id: Uuid,

    pub endpoint_host: String,
    pub endpoint_port: i32,
    #[builder(default = "http".to_string())]
    pub protocol: String,
    #[builder(default, setter(strip_option))]
    pub username: Option<String>,
    #[builder(default, setter(strip_option))]
    pub password: Option<String>,

    #[builder(default = true)]
    pub active: bool,

    /// Total successful requests through this proxy.
    #[builder(default = 0)]
    pub success_count: i64,
    /// Consecutive failures; reset on success, auto-disables at the global
    /// threshold.
    #[builder(default = 0)]
    pub failure_count: i32,
    #[builder(default, setter(strip_option))]
    pub last_used_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_success_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub avg_latency_ms: Option<i32>,

    #[builder(default, setter(strip_option))]
    pub country_code: Option<String>,
    #[builder(default, setter(strip_option))]
    pub city: Option<String>,
    #[builder(default, setter(strip_option))]
    pub provider: Option<String>,
    #[builder(default = 1000)]
    pub per_hour_cap: i32,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const PROXY_COLUMNS: &str = "id, endpoint_host, endpoint_port, protocol, username, password, \
     active, success_count, failure_count, last_used_at, last_success_at, last_failure_at, \
     avg_latency_ms, country_code, city, provider, per_hour_cap, created_at, updated_at";

impl Proxy {
    /// Connection string: `protocol://[user:pass@]host:port`.
    pub fn connection_string(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol, user, pass, self.endpoint_host, self.endpoint_port
            ),
            _ => format!(
                "{}://{}:{}",
                self.protocol, self.endpoint_host, self.endpoint_port
            ),
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count as i64;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }

    pub async fn find_by_endpoint(
        host: &str,
        port: i32,
        db: &PgPool,
    ) -> Result<Option<Self>, OrchestratorError> {
        let proxy = sqlx::query_as::<_, Self>(&format!(
            "SELECT {PROXY_COLUMNS} FROM proxies WHERE endpoint_host = $1 AND endpoint_port = $2"
        ))
        .bind(host)
        .bind(port)
        .fetch_optional(db)
        .await?;
        Ok(proxy)
    }

    /// Global success accounting: reset consecutive failures, fold the new
    /// latency into the rolling average, and re-enable a proxy that had been
    /// auto-disabled.
    pub async fn record_success(
        id: Uuid,
        latency_ms: i32,
        now: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<(), OrchestratorError> {
        sqlx::query(
            "UPDATE proxies SET
                success_count = success_count + 1,
                failure_count = 0,
                last_used_at = $1,
                last_success_at = $1,
                avg_latency_ms = (COALESCE(avg_latency_ms, $2) + $2) / 2,
                active = TRUE,
                updated_at = NOW()
            WHERE id = $3",
        )
        .bind(now)
        .bind(latency_ms)
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Global failure accounting; auto-disables at `global_threshold`
    /// consecutive failures.
    pub async fn record_failure(
        id: Uuid,
        global_threshold: i32,
        now: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<(), OrchestratorError> {
        sqlx::query(
            "UPDATE proxies SET
                failure_count = failure_count + 1,
                last_used_at = $1,
                last_failure_at = $1,
                active = CASE WHEN failure_count + 1 >= $2 THEN FALSE ELSE active END,
                updated_at = NOW()
            WHERE id = $3",
        )
        .bind(now)
        .bind(global_threshold)
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Record for Proxy {
    const TABLE: &'static str = "proxies";

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self, OrchestratorError> {
        let proxy = sqlx::query_as::<_, Self>(&format!(
            "SELECT {PROXY_COLUMNS} FROM proxies WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("proxy {id}")))?;
        Ok(proxy)
    }

    async fn insert(&self, db: &PgPool) -> Result<Self, OrchestratorError> {
        let proxy = sqlx::query_as::<_, Self>(&format!(
            "INSERT INTO proxies (
                id, endpoint_host, endpoint_port, protocol, username, password, active,
                success_count, failure_count, last_used_at, last_success_at, last_failure_at,
                avg_latency_ms, country_code, city, provider, per_hour_cap, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19)
            RETURNING {PROXY_COLUMNS}"
        ))
        .bind(self.id)
        .bind(&self.endpoint_host)
        .bind(self.endpoint_port)
        .bind(&self.protocol)
        .bind(&self.username)
        .bind(&self.password)
        .bind(self.active)
        .bind(self.success_count)
        .bind(self.failure_count)
        .bind(self.last_used_at)
        .bind(self.last_success_at)
        .bind(self.last_failure_at)
        .bind(self.avg_latency_ms)
        .bind(&self.country_code)
        .bind(&self.city)
        .bind(&self.provider)
        .bind(self.per_hour_cap)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;
        Ok(proxy)
    }

    async fn update(&self, db: &PgPool) -> Result<Self, OrchestratorError> {
        let proxy = sqlx::query_as::<_, Self>(&format!(
            "UPDATE proxies SET
                endpoint_host = $1, endpoint_port = $2, protocol = $3, username = $4,
                password = $5, active = $6, success_count = $7, failure_count = $8,
                last_used_at = $9, last_success_at = $10, last_failure_at = $11,
                avg_latency_ms = $12, country_code = $13, city = $14, provider = $15,
                per_hour_cap = $16, updated_at = NOW()
            WHERE id = $17
            RETURNING {PROXY_COLUMNS}"
        ))
        .bind(&self.endpoint_host)
        .bind(self.endpoint_port)
        .bind(&self.protocol)
        .bind(&self.username)
        .bind(&self.password)
        .bind(self.active)
        .bind(self.success_count)
        .bind(self.failure_count)
        .bind(self.last_used_at)
        .bind(self.last_success_at)
        .bind(self.last_failure_at)
        .bind(self.avg_latency_ms)
        .bind(&self.country_code)
        .bind(&self.city)
        .bind(&self.provider)
        .bind(self.per_hour_cap)
        .bind(self.id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("proxy {}", self.id)))?;
        Ok(proxy)
    }

    async fn delete(&self, db: &PgPool) -> Result<(), OrchestratorError> {
        sqlx::query("DELETE FROM proxies WHERE id = $1")
            .bind(self.id)
            .execute(db)
            .await?;
        Ok(())
    }
}
