//! Record trait for CRUD operations on store-backed models.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::OrchestratorError;

/// Narrow CRUD surface every row type exposes. Anything richer (CAS
/// transitions, claims, health accounting) lives on the model itself.
#[async_trait]
pub trait Record: Sized + Send + Sync {
    /// The table name for this record type.
    const TABLE: &'static str;

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self, OrchestratorError>;

    async fn insert(&self, db: &PgPool) -> Result<Self, OrchestratorError>;

    async fn update(&self, db: &PgPool) -> Result<Self, OrchestratorError>;

    async fn delete(&self, db: &PgPool) -> Result<(), OrchestratorError>;
}
