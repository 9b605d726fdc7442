//! Parse worker: consumes `ParseJob`s, resolves the host's parser tag and
//! drives the final `parsing -> completed` leg of the pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::OrchestratorError;
use crate::domains::tasks::{AttemptOutcome, CrawlTask, TaskStatus, TransitionPatch};
use crate::kernel::broker::{Delivery, ParseJob, QueueName};
use crate::kernel::record::Record;
use crate::kernel::Kernel;

use super::blob::BlobStore;
use super::registry::ParserRegistry;

#[derive(Debug, Clone)]
pub struct ParseWorkerConfig {
    pub poll_interval: Duration,
    pub worker_id: String,
}

impl Default for ParseWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            worker_id: format!("parse-worker-{}", Uuid::new_v4()),
        }
    }
}

pub struct ParseWorker {
    kernel: Kernel,
    registry: Arc<ParserRegistry>,
    blobs: Arc<dyn BlobStore>,
    config: ParseWorkerConfig,
}

impl ParseWorker {
    pub fn new(kernel: Kernel, registry: Arc<ParserRegistry>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            kernel,
            registry,
            blobs,
            config: ParseWorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ParseWorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.config.worker_id, "parse worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "parse worker poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "parse worker stopped");
    }

    /// Drain one prefetch window from the parse queue. Returns how many
    /// messages were handled.
    pub async fn run_once(&self) -> Result<usize, OrchestratorError> {
        let prefetch = self.kernel.config.broker.prefetch.max(1) as usize;
        let deliveries = self.kernel.broker.fetch(QueueName::Parse, prefetch).await?;
        let handled = deliveries.len();
        futures::future::join_all(
            deliveries
                .into_iter()
                .map(|delivery| self.process_delivery(delivery)),
        )
        .await;
        Ok(handled)
    }

    async fn process_delivery(&self, delivery: Delivery) {
        match self.handle(&delivery).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "ack failed");
                }
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "transient failure, nacking for redelivery");
                if let Err(e) = delivery.nack().await {
                    warn!(error = %e, "nack failed");
                }
            }
            Err(e) => {
                warn!(error = %e, "dropping undeliverable message");
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "ack failed");
                }
            }
        }
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), OrchestratorError> {
        let job: ParseJob = match delivery.decode() {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "malformed parse job payload");
                return Ok(());
            }
        };
        let db = &self.kernel.db;
        let backoff = &self.kernel.config.backoff;

        let task = match CrawlTask::find_by_id(job.task_id, db).await {
            Ok(task) => task,
            Err(OrchestratorError::NotFound(_)) => {
                debug!(task_id = %job.task_id, "task vanished, dropping message");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if task.status != TaskStatus::QueuedParse {
            debug!(task_id = %task.id, status = %task.status, "skipping, task moved on");
            return Ok(());
        }

        if !CrawlTask::transition(
            task.id,
            &[TaskStatus::QueuedParse],
            TaskStatus::Parsing,
            TransitionPatch::default(),
            db,
        )
        .await?
        {
            debug!(task_id = %task.id, "lost claim race");
            return Ok(());
        }

        let Some(handler) = self.registry.resolve(&job.parser_tag) else {
            CrawlTask::record_attempt(
                task.id,
                AttemptOutcome::TerminalFailure {
                    error: format!("no parser registered for tag {:?}", job.parser_tag),
                },
                backoff,
                db,
            )
            .await?;
            return Ok(());
        };

        let html = match self.blobs.get(&job.blob_ref).await {
            Ok(html) => html,
            Err(OrchestratorError::HtmlNotAvailable(msg)) => {
                CrawlTask::record_attempt(
                    task.id,
                    AttemptOutcome::TerminalFailure { error: msg },
                    backoff,
                    db,
                )
                .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match handler.parse(&job, &html).await {
            Ok(output) => {
                debug!(
                    task_id = %task.id,
                    parser_tag = %job.parser_tag,
                    items = output.items_extracted,
                    "parse succeeded"
                );
                CrawlTask::record_attempt(task.id, AttemptOutcome::ParseSuccess, backoff, db)
                    .await?;
            }
            Err(e) => {
                warn!(task_id = %task.id, parser_tag = %job.parser_tag, error = %e, "parse failed");
                CrawlTask::record_attempt(
                    task.id,
                    AttemptOutcome::TransientFailure {
                        error: format!("parse: {e}"),
                    },
                    backoff,
                    db,
                )
                .await?;
            }
        }
        Ok(())
    }
}
