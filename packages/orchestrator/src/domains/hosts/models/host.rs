//! Host model: a crawled website with its settings and parser assignment.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::{db_id, OrchestratorError};
use crate::kernel::record::Record;

/// A target website. Hosts are soft-disabled via `active`, never deleted
/// while tasks reference them; the dispatcher only hands out work for
/// active hosts.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Host {
    #[builder(default = db_id())]
    pub id: Uuid,

    pub name: String,
    pub base_url: String,
    /// Tag resolved against the parser registry by the parse worker.
    pub parser_tag: String,

    /// Minimum spacing between requests to this host, in seconds.
    #[builder(default = 1)]
    pub min_spacing_secs: i32,
    /// Cap on tasks simultaneously queued or crawling for this host.
    #[builder(default = 5)]
    pub max_in_flight: i32,
    /// Recurrence interval applied to tasks that do not override it.
    #[builder(default = 86_400)]
    pub default_interval_secs: i64,

    #[builder(default = true)]
    pub active: bool,

    #[builder(default, setter(strip_option))]
    pub robots_url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub robots_policy: Option<String>,
    #[builder(default, setter(strip_option))]
    pub robots_fetched_at: Option<DateTime<Utc>>,
    #[builder(default = "crawld/1.0".to_string())]
    pub user_agent: String,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const HOST_COLUMNS: &str = "id, name, base_url, parser_tag, min_spacing_secs, max_in_flight, \
     default_interval_secs, active, robots_url, robots_policy, robots_fetched_at, user_agent, \
     created_at, updated_at";

impl Host {
    /// Whether the cached robots policy is stale (or was never fetched).
    pub fn needs_robots_refresh(&self, max_age_hours: i64, now: DateTime<Utc>) -> bool {
        match self.robots_fetched_at {
            None => true,
            Some(fetched) => now - fetched > Duration::hours(max_age_hours),
        }
    }

    pub async fn find_by_name(name: &str, db: &PgPool) -> Result<Option<Self>, OrchestratorError> {
        let host = sqlx::query_as::<_, Self>(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(db)
        .await?;
        Ok(host)
    }

    /// Store the freshly fetched robots policy.
    pub async fn cache_robots(
        &self,
        policy: &str,
        fetched_at: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<(), OrchestratorError> {
        sqlx::query(
            "UPDATE hosts SET robots_policy = $1, robots_fetched_at = $2, updated_at = NOW() \
             WHERE id = $3",
        )
        .bind(policy)
        .bind(fetched_at)
        .bind(self.id)
        .execute(db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Record for Host {
    const TABLE: &'static str = "hosts";

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self, OrchestratorError> {
        let host = sqlx::query_as::<_, Self>(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("host {id}")))?;
        Ok(host)
    }

    async fn insert(&self, db: &PgPool) -> Result<Self, OrchestratorError> {
        let host = sqlx::query_as::<_, Self>(&format!(
            "INSERT INTO hosts (
                id, name, base_url, parser_tag, min_spacing_secs, max_in_flight,
                default_interval_secs, active, robots_url, robots_policy, robots_fetched_at,
                user_agent, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {HOST_COLUMNS}"
        ))
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.base_url)
        .bind(&self.parser_tag)
        .bind(self.min_spacing_secs)
        .bind(self.max_in_flight)
        .bind(self.default_interval_secs)
        .bind(self.active)
        .bind(&self.robots_url)
        .bind(&self.robots_policy)
        .bind(self.robots_fetched_at)
        .bind(&self.user_agent)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;
        Ok(host)
    }

    async fn update(&self, db: &PgPool) -> Result<Self, OrchestratorError> {
        let host = sqlx::query_as::<_, Self>(&format!(
            "UPDATE hosts SET
                name = $1, base_url = $2, parser_tag = $3, min_spacing_secs = $4,
                max_in_flight = $5, default_interval_secs = $6, active = $7,
                robots_url = $8, robots_policy = $9, robots_fetched_at = $10,
                user_agent = $11, updated_at = NOW()
            WHERE id = $12
            RETURNING {HOST_COLUMNS}"
        ))
        .bind(&self.name)
        .bind(&self.base_url)
        .bind(&self.parser_tag)
        .bind(self.min_spacing_secs)
        .bind(self.max_in_flight)
        .bind(self.default_interval_secs)
        .bind(self.active)
        .bind(&self.robots_url)
        .bind(&self.robots_policy)
        .bind(self.robots_fetched_at)
        .bind(&self.user_agent)
        .bind(self.id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("host {}", self.id)))?;
        Ok(host)
    }

    async fn delete(&self, db: &PgPool) -> Result<(), OrchestratorError> {
        sqlx::query("DELETE FROM hosts WHERE id = $1")
            .bind(self.id)
            .execute(db)
            .await?;
        Ok(())
    }
}
