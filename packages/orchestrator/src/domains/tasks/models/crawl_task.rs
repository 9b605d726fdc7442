//! Crawl task model and its state machine.
//!
//! One row per URL. The status column is the spine of the pipeline:
//!
//! ```text
//! pending -> queued -> crawling -> downloaded -> queued_parse -> parsing -> completed
//!                \         \            \             \            \
//!                 +---------+------------+-------------+------------+--> failed
//! ```
//!
//! plus admin-controlled `paused` and `cancelled`. Every transition is a
//! conditional compare-and-set on the current status, so concurrent
//! dispatchers, workers and admin actions race safely: exactly one actor
//! wins, the others observe a `false` CAS and move on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::{db_id, OrchestratorError};
use crate::config::{BackoffSettings, UrlNormalizeSettings};
use crate::domains::hosts::Host;
use crate::domains::tasks::backoff::next_attempt_at;
use crate::domains::tasks::url_norm::{fingerprint, normalize_url};
use crate::kernel::record::Record;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Crawling,
    Downloaded,
    QueuedParse,
    Parsing,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl TaskStatus {
    /// States a worker currently holds a lease in, plus `queued`/`queued_parse`
    /// where a message is (or should be) in flight.
    pub const ACTIVE: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Crawling,
        TaskStatus::Downloaded,
        TaskStatus::QueuedParse,
        TaskStatus::Parsing,
    ];

    /// States subject to lease reclaim by the dispatcher.
    pub const RECLAIMABLE: [TaskStatus; 4] = [
        TaskStatus::Queued,
        TaskStatus::Crawling,
        TaskStatus::QueuedParse,
        TaskStatus::Parsing,
    ];

    /// Everything except the terminal states.
    pub const NON_TERMINAL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Crawling,
        TaskStatus::Downloaded,
        TaskStatus::QueuedParse,
        TaskStatus::Parsing,
        TaskStatus::Paused,
    ];

    /// States cancel may act on: everything except `completed`/`failed`.
    /// Including `cancelled` itself makes a repeated cancel a no-op CAS.
    pub const CANCELLABLE: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Crawling,
        TaskStatus::Downloaded,
        TaskStatus::QueuedParse,
        TaskStatus::Parsing,
        TaskStatus::Paused,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Crawling => "crawling",
            TaskStatus::Downloaded => "downloaded",
            TaskStatus::QueuedParse => "queued_parse",
            TaskStatus::Parsing => "parsing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CrawlTask {
    #[builder(default = db_id())]
    pub id: Uuid,

    pub host_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub proxy_id: Option<Uuid>,

    pub url: String,
    pub url_fp: String,

    #[builder(default = TaskStatus::Pending)]
    pub status: TaskStatus,
    #[builder(default = 5)]
    pub priority: i32,

    #[builder(default = Utc::now())]
    pub scheduled_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub last_transition_at: DateTime<Utc>,

    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,

    #[builder(default = 86_400)]
    pub interval_secs: i64,
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub recur_count: i32,
    #[builder(default = true)]
    pub is_recurring: bool,

    #[builder(default, setter(strip_option))]
    pub blob_ref: Option<String>,
    #[builder(default, setter(strip_option))]
    pub http_code: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub latency_ms: Option<i32>,

    #[builder(default = "system".to_string())]
    pub created_by: String,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Submission
// ============================================================================

/// Options accepted when submitting a task.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    pub priority: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub interval_secs: Option<i64>,
    pub is_recurring: Option<bool>,
    pub max_retries: Option<i32>,
    pub created_by: Option<String>,
}

/// Per-item outcome of a bulk submission. The batch never rolls back as a
/// whole; each URL lands in exactly one bucket.
#[derive(Debug, Default)]
pub struct BulkSubmitOutcome {
    pub inserted: Vec<Uuid>,
    pub duplicates: Vec<(String, Uuid)>,
    pub invalid: Vec<(String, String)>,
}

pub const MAX_BULK_SUBMIT: usize = 10_000;

impl CrawlTask {
    /// Submit one URL for the host. Fails with `Duplicate` (carrying the
    /// existing task id) when a live row already has the same fingerprint.
    pub async fn create(
        host: &Host,
        url: &str,
        opts: &CreateTaskOptions,
        normalize: &UrlNormalizeSettings,
        db: &PgPool,
    ) -> Result<Self, OrchestratorError> {
        let priority = opts.priority.unwrap_or(5);
        if !(1..=10).contains(&priority) {
            return Err(OrchestratorError::Validation(format!(
                "priority must be 1..=10, got {priority}"
            )));
        }
        // A non-positive interval would schedule the next run at or before
        // the completion itself
        if let Some(interval) = opts.interval_secs {
            if interval <= 0 {
                return Err(OrchestratorError::Validation(format!(
                    "interval_secs must be positive, got {interval}"
                )));
            }
        }

        let normalized = normalize_url(url, normalize)?;
        let url_fp = fingerprint(&normalized);

        if let Some(existing) = Self::find_live_by_fingerprint(host.id, &url_fp, db).await? {
            return Err(OrchestratorError::Duplicate(format!(
                "url already tracked as task {}",
                existing
            )));
        }

        let task = Self::builder()
            .host_id(host.id)
            .url(normalized)
            .url_fp(url_fp)
            .priority(priority)
            .scheduled_at(opts.scheduled_at.unwrap_or_else(Utc::now))
            .interval_secs(opts.interval_secs.unwrap_or(host.default_interval_secs))
            .is_recurring(opts.is_recurring.unwrap_or(true))
            .max_retries(opts.max_retries.unwrap_or(3))
            .created_by(opts.created_by.clone().unwrap_or_else(|| "system".into()))
            .build();

        match task.insert(db).await {
            Ok(task) => Ok(task),
            // Lost the race against a concurrent submit of the same URL
            Err(OrchestratorError::Duplicate(_)) => {
                let existing = Self::find_live_by_fingerprint(host.id, &task.url_fp, db)
                    .await?
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unknown".into());
                Err(OrchestratorError::Duplicate(format!(
                    "url already tracked as task {existing}"
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Submit up to [`MAX_BULK_SUBMIT`] URLs, reporting per-item outcomes.
    pub async fn create_bulk(
        host: &Host,
        urls: &[String],
        opts: &CreateTaskOptions,
        normalize: &UrlNormalizeSettings,
        db: &PgPool,
    ) -> Result<BulkSubmitOutcome, OrchestratorError> {
        if urls.len() > MAX_BULK_SUBMIT {
            return Err(OrchestratorError::Validation(format!(
                "bulk submit limited to {MAX_BULK_SUBMIT} urls, got {}",
                urls.len()
            )));
        }

        let mut outcome = BulkSubmitOutcome::default();
        for url in urls {
            match Self::create(host, url, opts, normalize, db).await {
                Ok(task) => outcome.inserted.push(task.id),
                Err(OrchestratorError::Duplicate(msg)) => {
                    let existing = msg
                        .rsplit(' ')
                        .next()
                        .and_then(|s| Uuid::parse_str(s).ok())
                        .unwrap_or(Uuid::nil());
                    outcome.duplicates.push((url.clone(), existing));
                }
                Err(OrchestratorError::Validation(msg)) => {
                    outcome.invalid.push((url.clone(), msg));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Id of the live (non-terminal) row for this (host, fingerprint), if any.
    pub async fn find_live_by_fingerprint(
        host_id: Uuid,
        url_fp: &str,
        db: &PgPool,
    ) -> Result<Option<Uuid>, OrchestratorError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM crawl_tasks
             WHERE host_id = $1 AND url_fp = $2
               AND status NOT IN ('completed', 'failed', 'cancelled')
             LIMIT 1",
        )
        .bind(host_id)
        .bind(url_fp)
        .fetch_optional(db)
        .await?;
        Ok(id)
    }

    // ========================================================================
    // Scheduling reads
    // ========================================================================

    /// Ready rows in dispatch order: highest priority first, oldest schedule
    /// first, only for active hosts with in-flight headroom. Candidates are
    /// ranked per host so one round cannot queue a host past its
    /// `max_in_flight`.
    ///
    /// Safe against concurrent dispatchers: this is only a snapshot, the
    /// authoritative claim is the per-task CAS to `queued`.
    pub async fn fetch_due(
        limit: i64,
        now: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<Vec<Self>, OrchestratorError> {
        let tasks = sqlx::query_as::<_, Self>(
            "SELECT * FROM (
                 SELECT t.*,
                        ROW_NUMBER() OVER (
                            PARTITION BY t.host_id
                            ORDER BY t.priority ASC, t.scheduled_at ASC
                        ) AS host_rank,
                        h.max_in_flight - (
                            SELECT COUNT(*) FROM crawl_tasks x
                            WHERE x.host_id = t.host_id
                              AND x.status IN ('queued', 'crawling')
                        ) AS headroom
                 FROM crawl_tasks t
                 JOIN hosts h ON h.id = t.host_id
                 WHERE t.status = 'pending'
                   AND t.scheduled_at <= $1
                   AND h.active
             ) candidates
             WHERE host_rank <= GREATEST(headroom, 0)
             ORDER BY priority ASC, scheduled_at ASC
             LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(tasks)
    }

    /// Completed recurring rows whose next run is due.
    pub async fn fetch_recurrence_due(
        limit: i64,
        now: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<Vec<Self>, OrchestratorError> {
        let tasks = sqlx::query_as::<_, Self>(
            "SELECT * FROM crawl_tasks
             WHERE status = 'completed' AND is_recurring AND next_run_at <= $1
             ORDER BY next_run_at ASC
             LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(tasks)
    }

    /// Rows sitting in `downloaded` longer than `grace_secs`. The crawl
    /// worker normally hands off to the parse queue itself; this sweep covers
    /// a worker that died (or a publish that failed) in between.
    pub async fn fetch_stalled_downloaded(
        grace_secs: i64,
        limit: i64,
        now: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<Vec<Self>, OrchestratorError> {
        let tasks = sqlx::query_as::<_, Self>(
            "SELECT * FROM crawl_tasks
             WHERE status = 'downloaded'
               AND last_transition_at < $1 - ($2 * INTERVAL '1 second')
             ORDER BY last_transition_at ASC
             LIMIT $3",
        )
        .bind(now)
        .bind(grace_secs as f64)
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(tasks)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Conditional compare-and-set on status. Returns `false` when the row's
    /// current status is not in `from` (a concurrent actor won the race).
    pub async fn transition(
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        patch: TransitionPatch,
        db: &PgPool,
    ) -> Result<bool, OrchestratorError> {
        let updated = sqlx::query(
            "UPDATE crawl_tasks SET
                status = $2,
                started_at = COALESCE($3, started_at),
                completed_at = COALESCE($4, completed_at),
                scheduled_at = COALESCE($5, scheduled_at),
                error = COALESCE($6, error),
                last_transition_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($7)",
        )
        .bind(id)
        .bind(to)
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .bind(patch.scheduled_at)
        .bind(patch.error)
        .bind(from)
        .execute(db)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Record the outcome of one worker attempt. Every arm is a CAS, so a
    /// redelivered message records at most one state advance.
    pub async fn record_attempt(
        id: Uuid,
        outcome: AttemptOutcome,
        backoff: &BackoffSettings,
        db: &PgPool,
    ) -> Result<(), OrchestratorError> {
        match outcome {
            AttemptOutcome::DownloadSuccess {
                blob_ref,
                http_code,
                latency_ms,
                proxy_id,
            } => {
                let updated = sqlx::query(
                    "UPDATE crawl_tasks SET
                        status = 'downloaded',
                        blob_ref = $2,
                        http_code = $3,
                        latency_ms = $4,
                        proxy_id = COALESCE($5, proxy_id),
                        last_transition_at = NOW(),
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'crawling'",
                )
                .bind(id)
                .bind(&blob_ref)
                .bind(http_code)
                .bind(latency_ms)
                .bind(proxy_id)
                .execute(db)
                .await?
                .rows_affected();
                if updated == 0 {
                    return Err(OrchestratorError::IllegalTransition(format!(
                        "task {id} is not crawling"
                    )));
                }
            }

            AttemptOutcome::ParseSuccess => {
                let updated = sqlx::query(
                    "UPDATE crawl_tasks SET
                        status = 'completed',
                        completed_at = NOW(),
                        error = NULL,
                        next_run_at = CASE
                            WHEN is_recurring
                            THEN NOW() + (interval_secs * INTERVAL '1 second')
                            ELSE NULL
                        END,
                        last_transition_at = NOW(),
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'parsing'",
                )
                .bind(id)
                .execute(db)
                .await?
                .rows_affected();
                if updated == 0 {
                    return Err(OrchestratorError::IllegalTransition(format!(
                        "task {id} is not parsing"
                    )));
                }
            }

            AttemptOutcome::TransientFailure { error } => {
                let task = Self::find_by_id(id, db).await?;
                if !task.status.is_active() {
                    return Err(OrchestratorError::IllegalTransition(format!(
                        "task {id} is {} and cannot record a failure",
                        task.status
                    )));
                }
                if task.retry_count < task.max_retries {
                    let retry_count = task.retry_count + 1;
                    let due = next_attempt_at(Utc::now(), retry_count, backoff.base, backoff.cap);
                    // The retry_count guard makes a duplicate delivery a no-op
                    sqlx::query(
                        "UPDATE crawl_tasks SET
                            status = 'pending',
                            retry_count = retry_count + 1,
                            scheduled_at = $2,
                            error = $3,
                            last_transition_at = NOW(),
                            updated_at = NOW()
                        WHERE id = $1 AND status = ANY($4) AND retry_count = $5",
                    )
                    .bind(id)
                    .bind(due)
                    .bind(&error)
                    .bind(&TaskStatus::ACTIVE[..])
                    .bind(task.retry_count)
                    .execute(db)
                    .await?;
                } else {
                    sqlx::query(
                        "UPDATE crawl_tasks SET
                            status = 'failed',
                            completed_at = NOW(),
                            error = $2,
                            last_transition_at = NOW(),
                            updated_at = NOW()
                        WHERE id = $1 AND status = ANY($3)",
                    )
                    .bind(id)
                    .bind(&error)
                    .bind(&TaskStatus::ACTIVE[..])
                    .execute(db)
                    .await?;
                }
            }

            AttemptOutcome::TerminalFailure { error } => {
                sqlx::query(
                    "UPDATE crawl_tasks SET
                        status = 'failed',
                        completed_at = NOW(),
                        error = $2,
                        last_transition_at = NOW(),
                        updated_at = NOW()
                    WHERE id = $1 AND status = ANY($3)",
                )
                .bind(id)
                .bind(&error)
                .bind(&TaskStatus::ACTIVE[..])
                .execute(db)
                .await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Lease reclaim
    // ========================================================================

    /// Return rows stuck in `state` past `deadline_secs` to `pending` with
    /// an incremented retry count; rows already at their retry bound go
    /// terminal `failed` instead. Returns (reclaimed, exhausted).
    pub async fn reclaim_expired(
        state: TaskStatus,
        deadline_secs: i64,
        now: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<(u64, u64), OrchestratorError> {
        let message = format!("lease expired in {state}");

        let reclaimed = sqlx::query(
            "UPDATE crawl_tasks SET
                status = 'pending',
                retry_count = retry_count + 1,
                scheduled_at = $1,
                error = $2,
                last_transition_at = NOW(),
                updated_at = NOW()
            WHERE status = $3
              AND last_transition_at < $1 - ($4 * INTERVAL '1 second')
              AND retry_count < max_retries",
        )
        .bind(now)
        .bind(&message)
        .bind(state)
        .bind(deadline_secs as f64)
        .execute(db)
        .await?
        .rows_affected();

        let exhausted = sqlx::query(
            "UPDATE crawl_tasks SET
                status = 'failed',
                completed_at = NOW(),
                error = $1,
                last_transition_at = NOW(),
                updated_at = NOW()
            WHERE status = $2
              AND last_transition_at < $3 - ($4 * INTERVAL '1 second')
              AND retry_count >= max_retries",
        )
        .bind(&message)
        .bind(state)
        .bind(now)
        .bind(deadline_secs as f64)
        .execute(db)
        .await?
        .rows_affected();

        Ok((reclaimed, exhausted))
    }

    // ========================================================================
    // Recurrence
    // ========================================================================

    /// Materialize the next run of a completed recurring task as a fresh
    /// pending row, and advance the parent's `next_run_at` by one interval.
    ///
    /// Returns the new row, or `None` when no row was inserted: either a
    /// live row for the same URL already exists, or a concurrent dispatcher
    /// already advanced the parent.
    pub async fn materialize_recurrence(
        parent_id: Uuid,
        now: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<Option<Self>, OrchestratorError> {
        let mut tx = db.begin().await.map_err(OrchestratorError::from)?;

        let parent = sqlx::query_as::<_, Self>(
            "SELECT * FROM crawl_tasks WHERE id = $1 FOR UPDATE",
        )
        .bind(parent_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("task {parent_id}")))?;

        // Re-check under the row lock: another dispatcher replica may have
        // materialized this run already.
        let due = parent.status == TaskStatus::Completed
            && parent.is_recurring
            && parent.next_run_at.is_some_and(|at| at <= now);
        if !due {
            tx.rollback().await.map_err(OrchestratorError::from)?;
            return Ok(None);
        }

        let child = sqlx::query_as::<_, Self>(
            "INSERT INTO crawl_tasks (
                id, host_id, url, url_fp, status, priority, scheduled_at,
                retry_count, max_retries, interval_secs, recur_count, is_recurring,
                created_by, last_transition_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, 0, $7, $8, $9, TRUE, $10,
                    NOW(), NOW(), NOW())
            ON CONFLICT (host_id, url_fp)
                WHERE status NOT IN ('completed', 'failed', 'cancelled')
                DO NOTHING
            RETURNING *",
        )
        .bind(db_id())
        .bind(parent.host_id)
        .bind(&parent.url)
        .bind(&parent.url_fp)
        .bind(parent.priority)
        .bind(now)
        .bind(parent.max_retries)
        .bind(parent.interval_secs)
        .bind(parent.recur_count + 1)
        .bind(&parent.created_by)
        .fetch_optional(&mut *tx)
        .await?;

        // Advance the parent either way so a blocked materialization (live
        // duplicate) does not retry every tick.
        sqlx::query(
            "UPDATE crawl_tasks SET
                next_run_at = next_run_at + (interval_secs * INTERVAL '1 second'),
                updated_at = NOW()
            WHERE id = $1",
        )
        .bind(parent_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(OrchestratorError::from)?;
        Ok(child)
    }
}

/// Optional fields applied alongside a status CAS. `None` keeps the column.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Worker-reported outcome of one attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    DownloadSuccess {
        blob_ref: String,
        http_code: i32,
        latency_ms: i32,
        proxy_id: Option<Uuid>,
    },
    ParseSuccess,
    TransientFailure {
        error: String,
    },
    TerminalFailure {
        error: String,
    },
}

// ============================================================================
// Record
// ============================================================================

#[async_trait]
impl Record for CrawlTask {
    const TABLE: &'static str = "crawl_tasks";

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self, OrchestratorError> {
        let task = sqlx::query_as::<_, Self>("SELECT * FROM crawl_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))?;
        Ok(task)
    }

    async fn insert(&self, db: &PgPool) -> Result<Self, OrchestratorError> {
        let task = sqlx::query_as::<_, Self>(
            "INSERT INTO crawl_tasks (
                id, host_id, proxy_id, url, url_fp, status, priority, scheduled_at,
                started_at, completed_at, last_transition_at, retry_count, max_retries,
                error, interval_secs, next_run_at, recur_count, is_recurring, blob_ref,
                http_code, latency_ms, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, $24)
            RETURNING *",
        )
        .bind(self.id)
        .bind(self.host_id)
        .bind(self.proxy_id)
        .bind(&self.url)
        .bind(&self.url_fp)
        .bind(self.status)
        .bind(self.priority)
        .bind(self.scheduled_at)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(self.last_transition_at)
        .bind(self.retry_count)
        .bind(self.max_retries)
        .bind(&self.error)
        .bind(self.interval_secs)
        .bind(self.next_run_at)
        .bind(self.recur_count)
        .bind(self.is_recurring)
        .bind(&self.blob_ref)
        .bind(self.http_code)
        .bind(self.latency_ms)
        .bind(&self.created_by)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;
        Ok(task)
    }

    async fn update(&self, db: &PgPool) -> Result<Self, OrchestratorError> {
        let task = sqlx::query_as::<_, Self>(
            "UPDATE crawl_tasks SET
                host_id = $1, proxy_id = $2, url = $3, url_fp = $4, status = $5,
                priority = $6, scheduled_at = $7, started_at = $8, completed_at = $9,
                last_transition_at = $10, retry_count = $11, max_retries = $12, error = $13,
                interval_secs = $14, next_run_at = $15, recur_count = $16, is_recurring = $17,
                blob_ref = $18, http_code = $19, latency_ms = $20, created_by = $21,
                updated_at = NOW()
            WHERE id = $22
            RETURNING *",
        )
        .bind(self.host_id)
        .bind(self.proxy_id)
        .bind(&self.url)
        .bind(&self.url_fp)
        .bind(self.status)
        .bind(self.priority)
        .bind(self.scheduled_at)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(self.last_transition_at)
        .bind(self.retry_count)
        .bind(self.max_retries)
        .bind(&self.error)
        .bind(self.interval_secs)
        .bind(self.next_run_at)
        .bind(self.recur_count)
        .bind(self.is_recurring)
        .bind(&self.blob_ref)
        .bind(self.http_code)
        .bind(self.latency_ms)
        .bind(&self.created_by)
        .bind(self.id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("task {}", self.id)))?;
        Ok(task)
    }

    async fn delete(&self, db: &PgPool) -> Result<(), OrchestratorError> {
        sqlx::query("DELETE FROM crawl_tasks WHERE id = $1")
            .bind(self.id)
            .execute(db)
            .await?;
        Ok(())
    }
}
