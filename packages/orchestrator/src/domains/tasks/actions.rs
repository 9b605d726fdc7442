//! Control plane: admin operations that mutate tasks while work is in
//! flight.
//!
//! Every operation is a single atomic mutation guarded by the status CAS.
//! Pausing or cancelling does not drain broker queues; workers re-check the
//! task's status at each stage entry and ack without work when they observe
//! `paused` or `cancelled`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::OrchestratorError;
use crate::config::UrlNormalizeSettings;
use crate::domains::hosts::Host;
use crate::kernel::record::Record;

use super::models::{
    BulkSubmitOutcome, CrawlTask, CreateTaskOptions, TaskStatus, TransitionPatch,
};

// ============================================================================
// Submission
// ============================================================================

/// Submit one URL for crawling.
pub async fn submit(
    host_id: Uuid,
    url: &str,
    opts: CreateTaskOptions,
    normalize: &UrlNormalizeSettings,
    db: &PgPool,
) -> Result<CrawlTask, OrchestratorError> {
    let host = Host::find_by_id(host_id, db).await?;
    if !host.active {
        return Err(OrchestratorError::Validation(format!(
            "host {} is disabled",
            host.name
        )));
    }
    CrawlTask::create(&host, url, &opts, normalize, db).await
}

/// Submit a batch of URLs; per-item outcomes, no whole-batch rollback.
pub async fn submit_batch(
    host_id: Uuid,
    urls: &[String],
    opts: CreateTaskOptions,
    normalize: &UrlNormalizeSettings,
    db: &PgPool,
) -> Result<BulkSubmitOutcome, OrchestratorError> {
    let host = Host::find_by_id(host_id, db).await?;
    if !host.active {
        return Err(OrchestratorError::Validation(format!(
            "host {} is disabled",
            host.name
        )));
    }
    CrawlTask::create_bulk(&host, urls, &opts, normalize, db).await
}

// ============================================================================
// Pause / resume / cancel
// ============================================================================

/// Pause any non-terminal task. A message already in a queue is left there;
/// the worker observes `paused` on dequeue and acks without work.
pub async fn pause(task_id: Uuid, db: &PgPool) -> Result<CrawlTask, OrchestratorError> {
    cas_or_explain(
        task_id,
        &TaskStatus::NON_TERMINAL,
        TaskStatus::Paused,
        TransitionPatch::default(),
        db,
    )
    .await
}

/// Resume a paused task: back to `pending`, due immediately, retry count
/// untouched.
pub async fn resume(task_id: Uuid, db: &PgPool) -> Result<CrawlTask, OrchestratorError> {
    cas_or_explain(
        task_id,
        &[TaskStatus::Paused],
        TaskStatus::Pending,
        TransitionPatch {
            scheduled_at: Some(Utc::now()),
            ..Default::default()
        },
        db,
    )
    .await
}

/// Cancel from any state except the terminal `completed`/`failed`.
/// Cancelling an already-cancelled task is a harmless no-op.
pub async fn cancel(task_id: Uuid, db: &PgPool) -> Result<CrawlTask, OrchestratorError> {
    cas_or_explain(
        task_id,
        &TaskStatus::CANCELLABLE,
        TaskStatus::Cancelled,
        TransitionPatch::default(),
        db,
    )
    .await
}

// ============================================================================
// Restarts
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RestartOptions {
    pub reset_retries: bool,
    pub priority: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Restart a terminal task from scratch. Clears every per-attempt field so
/// the row is indistinguishable from a fresh submission (audit timestamps
/// aside).
pub async fn restart_full(
    task_id: Uuid,
    opts: RestartOptions,
    db: &PgPool,
) -> Result<CrawlTask, OrchestratorError> {
    if let Some(priority) = opts.priority {
        if !(1..=10).contains(&priority) {
            return Err(OrchestratorError::Validation(format!(
                "priority must be 1..=10, got {priority}"
            )));
        }
    }

    let restarted = sqlx::query_as::<_, CrawlTask>(
        "UPDATE crawl_tasks SET
            status = 'pending',
            scheduled_at = COALESCE($2, NOW()),
            priority = COALESCE($3, priority),
            retry_count = CASE WHEN $4 THEN 0 ELSE retry_count END,
            started_at = NULL,
            completed_at = NULL,
            error = NULL,
            blob_ref = NULL,
            http_code = NULL,
            latency_ms = NULL,
            proxy_id = NULL,
            next_run_at = NULL,
            last_transition_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status IN ('failed', 'completed')
        RETURNING *",
    )
    .bind(task_id)
    .bind(opts.scheduled_at)
    .bind(opts.priority)
    .bind(opts.reset_retries)
    .fetch_optional(db)
    .await?;

    match restarted {
        Some(task) => Ok(task),
        None => Err(explain_failure(task_id, "failed or completed", db).await),
    }
}

/// Restart only the parse phase: the task returns to `downloaded` and the
/// dispatcher re-publishes a parse job against the existing blob. Fails with
/// `HtmlNotAvailable` when the blob reference is gone.
pub async fn restart_parse_only(
    task_id: Uuid,
    db: &PgPool,
) -> Result<CrawlTask, OrchestratorError> {
    let restarted = sqlx::query_as::<_, CrawlTask>(
        "UPDATE crawl_tasks SET
            status = 'downloaded',
            completed_at = NULL,
            error = NULL,
            next_run_at = NULL,
            last_transition_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status IN ('failed', 'completed') AND blob_ref IS NOT NULL
        RETURNING *",
    )
    .bind(task_id)
    .fetch_optional(db)
    .await?;

    if let Some(task) = restarted {
        return Ok(task);
    }

    let task = CrawlTask::find_by_id(task_id, db).await?;
    if task.blob_ref.is_none() {
        return Err(OrchestratorError::HtmlNotAvailable(format!(
            "task {task_id} has no downloaded blob"
        )));
    }
    Err(OrchestratorError::IllegalTransition(format!(
        "task {task_id} is {}, expected failed or completed",
        task.status
    )))
}

/// Filter for [`bulk_restart_failed`]. `failed_after` is inclusive and
/// compares against the failure timestamp (`completed_at`).
#[derive(Debug, Clone, Default)]
pub struct BulkRestartFilter {
    pub host_id: Option<Uuid>,
    pub failed_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct BulkRestartOutcome {
    pub restarted: Vec<Uuid>,
    pub skipped: Vec<(Uuid, String)>,
}

/// Restart up to `limit` failed tasks matching the filter. Per-item
/// failures are reported, not rolled back.
pub async fn bulk_restart_failed(
    filter: BulkRestartFilter,
    limit: i64,
    opts: RestartOptions,
    db: &PgPool,
) -> Result<BulkRestartOutcome, OrchestratorError> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM crawl_tasks
         WHERE status = 'failed'
           AND ($1::uuid IS NULL OR host_id = $1)
           AND ($2::timestamptz IS NULL OR completed_at >= $2)
         ORDER BY completed_at ASC
         LIMIT $3",
    )
    .bind(filter.host_id)
    .bind(filter.failed_after)
    .bind(limit.clamp(1, 10_000))
    .fetch_all(db)
    .await?;

    let mut outcome = BulkRestartOutcome::default();
    for id in ids {
        match restart_full(id, opts.clone(), db).await {
            Ok(_) => outcome.restarted.push(id),
            // A racer completed/claimed it, or a live duplicate exists
            Err(e @ (OrchestratorError::IllegalTransition(_) | OrchestratorError::Duplicate(_))) => {
                outcome.skipped.push((id, e.kind().to_string()));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(outcome)
}

// ============================================================================
// Priority
// ============================================================================

/// Change a task's priority. Messages already enqueued keep their original
/// queue route; the broker is not re-ordered.
pub async fn change_priority(
    task_id: Uuid,
    new_priority: i32,
    db: &PgPool,
) -> Result<CrawlTask, OrchestratorError> {
    if !(1..=10).contains(&new_priority) {
        return Err(OrchestratorError::Validation(format!(
            "priority must be 1..=10, got {new_priority}"
        )));
    }
    let task = sqlx::query_as::<_, CrawlTask>(
        "UPDATE crawl_tasks SET priority = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(task_id)
    .bind(new_priority)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))?;
    Ok(task)
}

// ============================================================================
// Helpers
// ============================================================================

/// Run a CAS and, when it loses, turn the bare `false` into the precise
/// error kind the caller should surface.
async fn cas_or_explain(
    task_id: Uuid,
    from: &[TaskStatus],
    to: TaskStatus,
    patch: TransitionPatch,
    db: &PgPool,
) -> Result<CrawlTask, OrchestratorError> {
    if CrawlTask::transition(task_id, from, to, patch, db).await? {
        return CrawlTask::find_by_id(task_id, db).await;
    }
    let expected = from
        .iter()
        .map(TaskStatus::as_str)
        .collect::<Vec<_>>()
        .join("|");
    Err(explain_failure(task_id, &expected, db).await)
}

async fn explain_failure(task_id: Uuid, expected: &str, db: &PgPool) -> OrchestratorError {
    match CrawlTask::find_by_id(task_id, db).await {
        Ok(task) => OrchestratorError::IllegalTransition(format!(
            "task {task_id} is {}, expected {expected}",
            task.status
        )),
        Err(e) => e,
    }
}
