//! Admin operations on the proxy pool.

use sqlx::PgPool;
use uuid::Uuid;

use crate::common::OrchestratorError;
use crate::kernel::record::Record;

use super::models::Proxy;

/// Input for registering a proxy endpoint.
#[derive(Debug, Clone)]
pub struct NewProxy {
    pub endpoint_host: String,
    pub endpoint_port: i32,
    pub protocol: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub provider: Option<String>,
    pub per_hour_cap: Option<i32>,
}

/// Add a proxy to the pool. Fails with `Duplicate` when the endpoint tuple
/// already exists.
pub async fn create_proxy(input: NewProxy, db: &PgPool) -> Result<Proxy, OrchestratorError> {
    if !matches!(input.protocol.as_str(), "http" | "https" | "socks5") {
        return Err(OrchestratorError::Validation(format!(
            "unsupported proxy protocol {:?}",
            input.protocol
        )));
    }
    if let Some(existing) =
        Proxy::find_by_endpoint(&input.endpoint_host, input.endpoint_port, db).await?
    {
        return Err(OrchestratorError::Duplicate(format!(
            "proxy {}:{} already exists as {}",
            input.endpoint_host, input.endpoint_port, existing.id
        )));
    }

    let mut proxy = Proxy::builder()
        .endpoint_host(input.endpoint_host)
        .endpoint_port(input.endpoint_port)
        .protocol(input.protocol)
        .build();
    proxy.username = input.username;
    proxy.password = input.password;
    proxy.country_code = input.country_code;
    proxy.city = input.city;
    proxy.provider = input.provider;
    if let Some(cap) = input.per_hour_cap {
        proxy.per_hour_cap = cap;
    }

    proxy.insert(db).await
}

/// Manually flip a proxy's active flag. Enabling also clears the
/// consecutive-failure streak so the health gate starts fresh.
pub async fn set_proxy_active(
    proxy_id: Uuid,
    active: bool,
    db: &PgPool,
) -> Result<Proxy, OrchestratorError> {
    let mut proxy = Proxy::find_by_id(proxy_id, db).await?;
    proxy.active = active;
    if active {
        proxy.failure_count = 0;
    }
    proxy.update(db).await
}

/// List proxies, optionally narrowed by active flag, country, or provider.
pub async fn list_proxies(
    active: Option<bool>,
    country_code: Option<&str>,
    provider: Option<&str>,
    db: &PgPool,
) -> Result<Vec<Proxy>, OrchestratorError> {
    let proxies = sqlx::query_as::<_, Proxy>(
        "SELECT id, endpoint_host, endpoint_port, protocol, username, password, active,
                success_count, failure_count, last_used_at, last_success_at, last_failure_at,
                avg_latency_ms, country_code, city, provider, per_hour_cap, created_at, updated_at
         FROM proxies
         WHERE ($1::boolean IS NULL OR active = $1)
           AND ($2::text IS NULL OR country_code = $2)
           AND ($3::text IS NULL OR provider = $3)
         ORDER BY created_at ASC",
    )
    .bind(active)
    .bind(country_code)
    .bind(provider)
    .fetch_all(db)
    .await?;
    Ok(proxies)
}
