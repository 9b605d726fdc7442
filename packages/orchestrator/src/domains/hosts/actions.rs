//! Admin operations on hosts.

use sqlx::PgPool;
use uuid::Uuid;

use crate::common::OrchestratorError;
use crate::kernel::record::Record;

use super::models::Host;

/// Settings accepted when creating or updating a host.
#[derive(Debug, Clone, Default)]
pub struct HostSettings {
    pub min_spacing_secs: Option<i32>,
    pub max_in_flight: Option<i32>,
    pub default_interval_secs: Option<i64>,
    pub user_agent: Option<String>,
}

/// Register a new host. Fails with `Duplicate` when the name is taken.
pub async fn create_host(
    name: &str,
    base_url: &str,
    parser_tag: &str,
    settings: HostSettings,
    db: &PgPool,
) -> Result<Host, OrchestratorError> {
    if name.trim().is_empty() {
        return Err(OrchestratorError::Validation("host name is empty".into()));
    }
    if let Some(existing) = Host::find_by_name(name, db).await? {
        return Err(OrchestratorError::Duplicate(format!(
            "host {name} already exists as {}",
            existing.id
        )));
    }

    let mut host = Host::builder()
        .name(name.to_string())
        .base_url(base_url.to_string())
        .parser_tag(parser_tag.to_string())
        .build();
    apply(&mut host, settings)?;

    host.insert(db).await
}

/// Update an existing host's settings.
pub async fn update_host(
    host_id: Uuid,
    settings: HostSettings,
    db: &PgPool,
) -> Result<Host, OrchestratorError> {
    let mut host = Host::find_by_id(host_id, db).await?;
    apply(&mut host, settings)?;
    host.update(db).await
}

/// Flip the active flag. Inactive hosts are skipped by `fetch_due`, so
/// disabling a host parks its pending tasks without touching them.
pub async fn set_host_active(
    host_id: Uuid,
    active: bool,
    db: &PgPool,
) -> Result<Host, OrchestratorError> {
    let mut host = Host::find_by_id(host_id, db).await?;
    host.active = active;
    host.update(db).await
}

fn apply(host: &mut Host, settings: HostSettings) -> Result<(), OrchestratorError> {
    if let Some(v) = settings.min_spacing_secs {
        host.min_spacing_secs = v;
    }
    if let Some(v) = settings.max_in_flight {
        host.max_in_flight = v;
    }
    if let Some(v) = settings.default_interval_secs {
        // Tasks inherit this interval; a non-positive value would schedule
        // recurrences at or before the completion itself
        if v <= 0 {
            return Err(OrchestratorError::Validation(format!(
                "default_interval_secs must be positive, got {v}"
            )));
        }
        host.default_interval_secs = v;
    }
    if let Some(v) = settings.user_agent {
        host.user_agent = v;
    }
    Ok(())
}
