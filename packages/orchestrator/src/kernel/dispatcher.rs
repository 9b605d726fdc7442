//! Dispatcher: the central state machine driver.
//!
//! One round:
//! 1. Reclaim expired leases (`queued`/`crawling`/`queued_parse`/`parsing`
//!    rows stuck past their state deadline go back to `pending`).
//! 2. Materialize due recurrences as fresh pending rows.
//! 3. Re-publish parse jobs for `downloaded` rows whose handoff stalled.
//! 4. Fetch due pending rows and, per task, CAS `pending -> queued` then
//!    publish a `CrawlJob` to the priority or crawl queue.
//!
//! The dispatcher is horizontally replicable and idempotent across
//! restarts: correctness rides entirely on the per-task CAS, a lost race
//! is benign. `broker_unavailable` pauses the rest of the batch; the
//! affected task is reverted to `pending` with a short delay.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::OrchestratorError;
use crate::domains::hosts::Host;
use crate::domains::tasks::{CrawlTask, TaskStatus, TransitionPatch};
use crate::kernel::broker::{publish_json, route_for_priority, CrawlJob, ParseJob, QueueName};
use crate::kernel::record::Record;
use crate::kernel::Kernel;

/// Delay before a task whose publish failed becomes due again.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How long a `downloaded` row may sit before the dispatcher re-publishes
/// its parse job. Covers a crawl worker that died between the download
/// commit and the queue handoff.
const DOWNLOAD_HANDOFF_GRACE_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub interval: Duration,
    pub batch_size: i64,
    pub worker_id: String,
}

impl DispatcherConfig {
    pub fn from_kernel(kernel: &Kernel) -> Self {
        Self {
            interval: kernel.config.dispatcher.interval,
            batch_size: kernel.config.dispatcher.batch_size,
            worker_id: format!("dispatcher-{}", Uuid::new_v4()),
        }
    }
}

pub struct Dispatcher {
    kernel: Kernel,
    config: DispatcherConfig,
}

/// Counters from one dispatcher round, for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub reclaimed: u64,
    pub exhausted: u64,
    pub recurrences: u64,
    pub parse_republished: u64,
    pub dispatched: u64,
    pub lost_races: u64,
    pub broker_paused: bool,
}

impl Dispatcher {
    pub fn new(kernel: Kernel) -> Self {
        let config = DispatcherConfig::from_kernel(&kernel);
        Self { kernel, config }
    }

    pub fn with_config(kernel: Kernel, config: DispatcherConfig) -> Self {
        Self { kernel, config }
    }

    /// Run until shutdown is requested.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "dispatcher starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                Ok(stats) => {
                    if stats != RoundStats::default() {
                        debug!(
                            reclaimed = stats.reclaimed,
                            exhausted = stats.exhausted,
                            recurrences = stats.recurrences,
                            parse_republished = stats.parse_republished,
                            dispatched = stats.dispatched,
                            lost_races = stats.lost_races,
                            broker_paused = stats.broker_paused,
                            "dispatcher round"
                        );
                    }
                }
                Err(e) => error!(error = %e, "dispatcher round failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "dispatcher stopped");
    }

    /// One full round. Public so tests can tick the dispatcher manually.
    pub async fn run_once(&self) -> Result<RoundStats, OrchestratorError> {
        let mut stats = RoundStats::default();
        let now = Utc::now();
        let db = &self.kernel.db;

        // 1. Lease reclaim
        let deadlines = &self.kernel.config.deadlines;
        for (state, deadline) in [
            (TaskStatus::Queued, deadlines.queued),
            (TaskStatus::Crawling, deadlines.crawling),
            (TaskStatus::QueuedParse, deadlines.queued_parse),
            (TaskStatus::Parsing, deadlines.parsing),
        ] {
            let (reclaimed, exhausted) =
                CrawlTask::reclaim_expired(state, deadline.as_secs() as i64, now, db).await?;
            if reclaimed + exhausted > 0 {
                warn!(state = %state, reclaimed, exhausted, "reclaimed expired leases");
            }
            stats.reclaimed += reclaimed;
            stats.exhausted += exhausted;
        }

        // 2. Recurrence
        let due_recurrences =
            CrawlTask::fetch_recurrence_due(self.config.batch_size, now, db).await?;
        for parent in due_recurrences {
            if let Some(child) = CrawlTask::materialize_recurrence(parent.id, now, db).await? {
                debug!(parent_id = %parent.id, child_id = %child.id, "materialized recurrence");
                stats.recurrences += 1;
            }
        }

        // 3. Stalled download handoffs
        let stalled = CrawlTask::fetch_stalled_downloaded(
            DOWNLOAD_HANDOFF_GRACE_SECS,
            self.config.batch_size,
            now,
            db,
        )
        .await?;
        for task in stalled {
            match self.publish_parse_job(&task).await {
                Ok(true) => stats.parse_republished += 1,
                Ok(false) => stats.lost_races += 1,
                Err(e) if matches!(e, OrchestratorError::BrokerUnavailable(_)) => {
                    warn!(error = %e, "broker unavailable, pausing round");
                    stats.broker_paused = true;
                    return Ok(stats);
                }
                Err(e) => return Err(e),
            }
        }

        // 4. Dispatch due work
        let due = CrawlTask::fetch_due(self.config.batch_size, now, db).await?;
        for task in due {
            if !CrawlTask::transition(
                task.id,
                &[TaskStatus::Pending],
                TaskStatus::Queued,
                TransitionPatch::default(),
                db,
            )
            .await?
            {
                // A replica, a worker, or an admin got there first
                stats.lost_races += 1;
                continue;
            }

            let queue = route_for_priority(task.priority);
            let job = CrawlJob {
                task_id: task.id,
                url: task.url.clone(),
                host_id: task.host_id,
                priority: task.priority,
                proxy_handle: None,
                attempt: task.retry_count + 1,
            };

            match publish_json(self.kernel.broker.as_ref(), queue, &job).await {
                Ok(()) => stats.dispatched += 1,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "publish failed, reverting to pending");
                    self.revert_to_pending(task.id).await?;
                    if matches!(e, OrchestratorError::BrokerUnavailable(_)) {
                        stats.broker_paused = true;
                        return Ok(stats);
                    }
                    return Err(e);
                }
            }
        }

        Ok(stats)
    }

    /// CAS `downloaded -> queued_parse` and publish the parse job. Returns
    /// `Ok(false)` when a racer won the CAS.
    async fn publish_parse_job(&self, task: &CrawlTask) -> Result<bool, OrchestratorError> {
        let Some(blob_ref) = task.blob_ref.clone() else {
            // Downloaded row without a blob cannot be parsed
            CrawlTask::record_attempt(
                task.id,
                crate::domains::tasks::AttemptOutcome::TerminalFailure {
                    error: "downloaded without a blob reference".into(),
                },
                &self.kernel.config.backoff,
                &self.kernel.db,
            )
            .await?;
            return Ok(false);
        };

        if !CrawlTask::transition(
            task.id,
            &[TaskStatus::Downloaded],
            TaskStatus::QueuedParse,
            TransitionPatch::default(),
            &self.kernel.db,
        )
        .await?
        {
            return Ok(false);
        }

        let host = Host::find_by_id(task.host_id, &self.kernel.db).await?;
        let job = ParseJob {
            task_id: task.id,
            host_id: task.host_id,
            blob_ref,
            parser_tag: host.parser_tag,
            attempt: task.retry_count + 1,
        };

        if let Err(e) = publish_json(self.kernel.broker.as_ref(), QueueName::Parse, &job).await {
            self.revert_parse_handoff(task.id).await?;
            return Err(e);
        }
        Ok(true)
    }

    async fn revert_to_pending(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        CrawlTask::transition(
            task_id,
            &[TaskStatus::Queued],
            TaskStatus::Pending,
            TransitionPatch {
                scheduled_at: Some(Utc::now() + chrono::Duration::from_std(PUBLISH_RETRY_DELAY)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30))),
                ..Default::default()
            },
            &self.kernel.db,
        )
        .await?;
        Ok(())
    }

    async fn revert_parse_handoff(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        CrawlTask::transition(
            task_id,
            &[TaskStatus::QueuedParse],
            TaskStatus::Downloaded,
            TransitionPatch::default(),
            &self.kernel.db,
        )
        .await?;
        Ok(())
    }
}
