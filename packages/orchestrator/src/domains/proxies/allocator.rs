//! Per-host proxy rotation.
//!
//! Selection is least-recently-used with a health gate: among bindings for
//! the host where the binding is active, the proxy is active, and the
//! binding's consecutive-failure count is under the threshold, pick the one
//! with the smallest `last_used_at` (never-used first), breaking ties by
//! rolling average latency.
//!
//! `acquire` must be linearizable per binding: two concurrent calls for the
//! same host may never return the same proxy. The selection and the
//! `last_used_at` touch therefore happen in one conditional statement; there
//! is no separate read-then-write window.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::OrchestratorError;
use crate::config::ProxySettings;
use crate::kernel::record::Record;

use super::models::binding::BINDING_COLUMNS;
use super::models::{HostProxyBinding, Proxy};

/// An acquired identity: which binding won and how to connect through it.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    pub binding_id: Uuid,
    pub proxy_id: Uuid,
    pub host_id: Uuid,
    pub connection_string: String,
}

/// Result of one attempt through an acquired proxy.
#[derive(Debug, Clone)]
pub enum AttemptResult {
    Success { latency_ms: i32 },
    Failure { reason: String },
}

pub struct ProxyAllocator {
    db: PgPool,
    settings: ProxySettings,
}

#[derive(FromRow)]
struct AcquiredRow {
    id: Uuid,
    proxy_id: Uuid,
    host_id: Uuid,
}

impl ProxyAllocator {
    pub fn new(db: PgPool, settings: ProxySettings) -> Self {
        Self { db, settings }
    }

    /// Pick the least-recently-used healthy proxy for the host and stamp its
    /// `last_used_at` in the same statement.
    ///
    /// `SKIP LOCKED` keeps concurrent acquirers from blocking on each other;
    /// whoever locks the LRU row first wins it, the next caller gets the
    /// next-oldest binding.
    pub async fn acquire(
        &self,
        host_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ProxyHandle, OrchestratorError> {
        let acquired = sqlx::query_as::<_, AcquiredRow>(
            "WITH candidate AS (
                SELECT b.id
                FROM host_proxy_bindings b
                JOIN proxies p ON p.id = b.proxy_id
                WHERE b.host_id = $1
                  AND b.active
                  AND p.active
                  AND b.failure_count < $2
                ORDER BY b.last_used_at ASC NULLS FIRST, b.avg_latency_ms ASC NULLS LAST
                LIMIT 1
                FOR UPDATE OF b SKIP LOCKED
            )
            UPDATE host_proxy_bindings AS b
            SET last_used_at = $3, updated_at = NOW()
            FROM candidate
            WHERE b.id = candidate.id
            RETURNING b.id, b.proxy_id, b.host_id",
        )
        .bind(host_id)
        .bind(self.settings.binding_failure_threshold)
        .bind(now)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| OrchestratorError::NoProxyAvailable(host_id.to_string()))?;

        let proxy = Proxy::find_by_id(acquired.proxy_id, &self.db).await?;
        Ok(ProxyHandle {
            binding_id: acquired.id,
            proxy_id: acquired.proxy_id,
            host_id: acquired.host_id,
            connection_string: proxy.connection_string(),
        })
    }

    /// Account the outcome of a request made through `handle`, on both the
    /// binding and the proxy's global record.
    pub async fn release(
        &self,
        handle: &ProxyHandle,
        outcome: AttemptResult,
    ) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        match outcome {
            AttemptResult::Success { latency_ms } => {
                sqlx::query(
                    "UPDATE host_proxy_bindings SET
                        success_count = success_count + 1,
                        failure_count = 0,
                        last_used_at = $1,
                        avg_latency_ms = (COALESCE(avg_latency_ms, $2) + $2) / 2,
                        updated_at = NOW()
                    WHERE id = $3",
                )
                .bind(now)
                .bind(latency_ms)
                .bind(handle.binding_id)
                .execute(&self.db)
                .await?;
                Proxy::record_success(handle.proxy_id, latency_ms, now, &self.db).await?;
            }
            AttemptResult::Failure { reason } => {
                tracing::debug!(
                    binding_id = %handle.binding_id,
                    proxy_id = %handle.proxy_id,
                    reason = %reason,
                    "proxy attempt failed"
                );
                sqlx::query(
                    "UPDATE host_proxy_bindings SET
                        failure_count = failure_count + 1,
                        last_used_at = $1,
                        active = CASE WHEN failure_count + 1 >= $2 THEN FALSE ELSE active END,
                        updated_at = NOW()
                    WHERE id = $3",
                )
                .bind(now)
                .bind(self.settings.binding_failure_threshold)
                .bind(handle.binding_id)
                .execute(&self.db)
                .await?;
                Proxy::record_failure(
                    handle.proxy_id,
                    self.settings.global_failure_threshold,
                    now,
                    &self.db,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Assign a proxy to a host. Idempotent: an existing pair is returned
    /// unchanged.
    pub async fn bind(
        &self,
        host_id: Uuid,
        proxy_id: Uuid,
        priority: i32,
    ) -> Result<HostProxyBinding, OrchestratorError> {
        // Referential errors surface as NotFound rather than raw FK failures
        Proxy::find_by_id(proxy_id, &self.db).await?;
        if let Some(existing) = HostProxyBinding::find_pair(host_id, proxy_id, &self.db).await? {
            return Ok(existing);
        }
        let binding = HostProxyBinding::builder()
            .host_id(host_id)
            .proxy_id(proxy_id)
            .priority(priority)
            .build();
        match binding.insert(&self.db).await {
            Ok(binding) => Ok(binding),
            // Concurrent bind of the same pair: the unique index won, reuse it
            Err(OrchestratorError::Duplicate(_)) => {
                HostProxyBinding::find_pair(host_id, proxy_id, &self.db)
                    .await?
                    .ok_or_else(|| OrchestratorError::NotFound("binding".into()))
            }
            Err(e) => Err(e),
        }
    }

    /// Assign several proxies at once; already-bound pairs are skipped.
    /// Returns the number of new bindings.
    pub async fn bind_many(
        &self,
        host_id: Uuid,
        proxy_ids: &[Uuid],
        priority: i32,
    ) -> Result<usize, OrchestratorError> {
        let mut assigned = 0;
        for &proxy_id in proxy_ids {
            if HostProxyBinding::find_pair(host_id, proxy_id, &self.db)
                .await?
                .is_none()
            {
                self.bind(host_id, proxy_id, priority).await?;
                assigned += 1;
            }
        }
        Ok(assigned)
    }

    /// Remove the binding outright.
    pub async fn unbind(&self, host_id: Uuid, proxy_id: Uuid) -> Result<(), OrchestratorError> {
        let deleted =
            sqlx::query("DELETE FROM host_proxy_bindings WHERE host_id = $1 AND proxy_id = $2")
                .bind(host_id)
                .bind(proxy_id)
                .execute(&self.db)
                .await?
                .rows_affected();
        if deleted == 0 {
            return Err(OrchestratorError::NotFound(format!(
                "binding of proxy {proxy_id} to host {host_id}"
            )));
        }
        Ok(())
    }

    /// Re-activate a binding and zero its consecutive-failure counter.
    pub async fn enable(&self, host_id: Uuid, proxy_id: Uuid) -> Result<(), OrchestratorError> {
        self.set_binding_state(host_id, proxy_id, true).await
    }

    /// Disable a binding while keeping the row and its history.
    pub async fn disable(&self, host_id: Uuid, proxy_id: Uuid) -> Result<(), OrchestratorError> {
        self.set_binding_state(host_id, proxy_id, false).await
    }

    async fn set_binding_state(
        &self,
        host_id: Uuid,
        proxy_id: Uuid,
        active: bool,
    ) -> Result<(), OrchestratorError> {
        let updated = sqlx::query(
            "UPDATE host_proxy_bindings SET
                active = $1,
                failure_count = CASE WHEN $1 THEN 0 ELSE failure_count END,
                updated_at = NOW()
            WHERE host_id = $2 AND proxy_id = $3",
        )
        .bind(active)
        .bind(host_id)
        .bind(proxy_id)
        .execute(&self.db)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(OrchestratorError::NotFound(format!(
                "binding of proxy {proxy_id} to host {host_id}"
            )));
        }
        Ok(())
    }

    /// Health summary across the host's bindings.
    pub async fn stats(&self, host_id: Uuid) -> Result<HostProxyStats, OrchestratorError> {
        let bindings = sqlx::query_as::<_, HostProxyBinding>(&format!(
            "SELECT {BINDING_COLUMNS} FROM host_proxy_bindings WHERE host_id = $1"
        ))
        .bind(host_id)
        .fetch_all(&self.db)
        .await?;

        let total = bindings.len();
        let active = bindings.iter().filter(|b| b.active).count();
        let failing = bindings
            .iter()
            .filter(|b| b.failure_count >= self.settings.binding_failure_threshold)
            .count();
        let successes: i64 = bindings.iter().map(|b| b.success_count).sum();
        let failures: i64 = bindings.iter().map(|b| b.failure_count as i64).sum();
        let latencies: Vec<i32> = bindings.iter().filter_map(|b| b.avg_latency_ms).collect();
        let avg_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().map(|&l| l as i64).sum::<i64>() as i32 / latencies.len() as i32)
        };
        let requests = successes + failures;

        Ok(HostProxyStats {
            host_id,
            total_bindings: total,
            active_bindings: active,
            failing_bindings: failing,
            total_requests: requests,
            success_rate: if requests == 0 {
                0.0
            } else {
                successes as f64 / requests as f64
            },
            avg_latency_ms,
        })
    }
}

/// Aggregate binding health for one host.
#[derive(Debug, Clone, Serialize)]
pub struct HostProxyStats {
    pub host_id: Uuid,
    pub total_bindings: usize,
    pub active_bindings: usize,
    pub failing_bindings: usize,
    pub total_requests: i64,
    pub success_rate: f64,
    pub avg_latency_ms: Option<i32>,
}
