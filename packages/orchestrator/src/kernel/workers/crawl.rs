//! Crawl worker: consumes `CrawlJob`s, downloads pages through rotated
//! proxies, and hands successful downloads to the parse queue.
//!
//! The worker re-reads authoritative task state at stage entry, so a
//! message for a task that was paused, cancelled or already claimed is
//! acked without work. Transient trouble (no proxy, network failure) goes
//! through `record_attempt`; only infrastructure errors nack the message
//! for redelivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::OrchestratorError;
use crate::domains::hosts::Host;
use crate::domains::proxies::{AttemptResult, ProxyAllocator, ProxyHandle};
use crate::domains::tasks::{AttemptOutcome, CrawlTask, TaskStatus, TransitionPatch};
use crate::kernel::broker::{publish_json, Delivery, CrawlJob, ParseJob, QueueName};
use crate::kernel::record::Record;
use crate::kernel::Kernel;

use super::blob::BlobStore;
use super::fetch::{FetchRequest, Fetcher};

/// Delay before a task parked for `no_proxy_available` becomes due again.
const NO_PROXY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CrawlWorkerConfig {
    pub poll_interval: Duration,
    pub worker_id: String,
}

impl Default for CrawlWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            worker_id: format!("crawl-worker-{}", Uuid::new_v4()),
        }
    }
}

pub struct CrawlWorker {
    kernel: Kernel,
    allocator: Arc<ProxyAllocator>,
    fetcher: Arc<dyn Fetcher>,
    blobs: Arc<dyn BlobStore>,
    config: CrawlWorkerConfig,
}

impl CrawlWorker {
    pub fn new(
        kernel: Kernel,
        allocator: Arc<ProxyAllocator>,
        fetcher: Arc<dyn Fetcher>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            kernel,
            allocator,
            fetcher,
            blobs,
            config: CrawlWorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CrawlWorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.config.worker_id, "crawl worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let fetched = self.run_once().await;
            match fetched {
                Ok(0) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "crawl worker poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "crawl worker stopped");
    }

    /// Drain one prefetch window from the priority queue first, then the
    /// crawl queue. Returns how many messages were handled.
    pub async fn run_once(&self) -> Result<usize, OrchestratorError> {
        let prefetch = self.kernel.config.broker.prefetch.max(1) as usize;
        let mut handled = 0;
        for queue in [QueueName::Priority, QueueName::Crawl] {
            let deliveries = self.kernel.broker.fetch(queue, prefetch).await?;
            handled += deliveries.len();
            futures::future::join_all(
                deliveries
                    .into_iter()
                    .map(|delivery| self.process_delivery(delivery)),
            )
            .await;
        }
        Ok(handled)
    }

    async fn process_delivery(&self, delivery: Delivery) {
        match self.handle(&delivery).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "ack failed");
                }
            }
            // Infrastructure trouble: leave the work to a redelivery
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
        let job: CrawlJob = match delivery.decode() {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "malformed crawl job payload");
                return Ok(());
            }
        };
        let db = &self.kernel.db;

        let task = match CrawlTask::find_by_id(job.task_id, db).await {
            Ok(task) => task,
            Err(OrchestratorError::NotFound(_)) => {
                debug!(task_id = %job.task_id, "task vanished, dropping message");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Pause/cancel race, or a redelivery of work already claimed
        if task.status != TaskStatus::Queued {
            debug!(task_id = %task.id, status = %task.status, "skipping, task moved on");
            return Ok(());
        }

        if !CrawlTask::transition(
            task.id,
            &[TaskStatus::Queued],
            TaskStatus::Crawling,
            TransitionPatch {
                started_at: Some(Utc::now()),
                ..Default::default()
            },
            db,
        )
        .await?
        {
            debug!(task_id = %task.id, "lost claim race");
            return Ok(());
        }

        let host = Host::find_by_id(task.host_id, db).await?;

        let proxy = match self.allocator.acquire(task.host_id, Utc::now()).await {
            Ok(handle) => handle,
            Err(OrchestratorError::NoProxyAvailable(_)) => {
                // Retryable without burning a retry: park the task briefly
                debug!(task_id = %task.id, "no proxy available, parking task");
                CrawlTask::transition(
                    task.id,
                    &[TaskStatus::Crawling],
                    TaskStatus::Pending,
                    TransitionPatch {
                        scheduled_at: Some(
                            Utc::now()
                                + chrono::Duration::from_std(NO_PROXY_DELAY)
                                    .unwrap_or_else(|_| chrono::Duration::seconds(30)),
                        ),
                        ..Default::default()
                    },
                    db,
                )
                .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.download(&task, &host, &proxy, &job).await
    }

    async fn download(
        &self,
        task: &CrawlTask,
        host: &Host,
        proxy: &ProxyHandle,
        job: &CrawlJob,
    ) -> Result<(), OrchestratorError> {
        let db = &self.kernel.db;
        let backoff = &self.kernel.config.backoff;

        let request = FetchRequest {
            url: task.url.clone(),
            user_agent: host.user_agent.clone(),
            proxy: Some(proxy.connection_string.clone()),
        };

        match self.fetcher.fetch(request).await {
            Ok(response) if response.http_code < 400 => {
                self.allocator
                    .release(
                        proxy,
                        AttemptResult::Success {
                            latency_ms: response.latency_ms,
                        },
                    )
                    .await?;

                let blob_ref = self
                    .blobs
                    .put(task.id, job.attempt, &response.body)
                    .await?;

                CrawlTask::record_attempt(
                    task.id,
                    AttemptOutcome::DownloadSuccess {
                        blob_ref: blob_ref.clone(),
                        http_code: response.http_code,
                        latency_ms: response.latency_ms,
                        proxy_id: Some(proxy.proxy_id),
                    },
                    backoff,
                    db,
                )
                .await?;

                self.handoff_to_parse(task, host, &blob_ref).await
            }

            Ok(response) if response.http_code < 500 => {
                // The proxy relayed fine; the target says this URL is bad
                self.allocator
                    .release(
                        proxy,
                        AttemptResult::Success {
                            latency_ms: response.latency_ms,
                        },
                    )
                    .await?;
                CrawlTask::record_attempt(
                    task.id,
                    AttemptOutcome::TerminalFailure {
                        error: format!("http status {}", response.http_code),
                    },
                    backoff,
                    db,
                )
                .await?;
                Ok(())
            }

            Ok(response) => {
                self.allocator
                    .release(
                        proxy,
                        AttemptResult::Success {
                            latency_ms: response.latency_ms,
                        },
                    )
                    .await?;
                CrawlTask::record_attempt(
                    task.id,
                    AttemptOutcome::TransientFailure {
                        error: format!("http status {}", response.http_code),
                    },
                    backoff,
                    db,
                )
                .await?;
                Ok(())
            }

            Err(fetch_err) => {
                self.allocator
                    .release(
                        proxy,
                        AttemptResult::Failure {
                            reason: fetch_err.to_string(),
                        },
                    )
                    .await?;
                CrawlTask::record_attempt(
                    task.id,
                    AttemptOutcome::TransientFailure {
                        error: fetch_err.to_string(),
                    },
                    backoff,
                    db,
                )
                .await?;
                Ok(())
            }
        }
    }

    /// CAS `downloaded -> queued_parse` and publish the parse job. On a
    /// publish failure the task reverts to `downloaded`; the dispatcher's
    /// stalled-handoff sweep retries it.
    async fn handoff_to_parse(
        &self,
        task: &CrawlTask,
        host: &Host,
        blob_ref: &str,
    ) -> Result<(), OrchestratorError> {
        let db = &self.kernel.db;
        if !CrawlTask::transition(
            task.id,
            &[TaskStatus::Downloaded],
            TaskStatus::QueuedParse,
            TransitionPatch::default(),
            db,
        )
        .await?
        {
            return Ok(());
        }

        let job = ParseJob {
            task_id: task.id,
            host_id: task.host_id,
            blob_ref: blob_ref.to_string(),
            parser_tag: host.parser_tag.clone(),
            attempt: 1,
        };
        if let Err(e) = publish_json(self.kernel.broker.as_ref(), QueueName::Parse, &job).await {
            warn!(task_id = %task.id, error = %e, "parse handoff publish failed, reverting");
            CrawlTask::transition(
                task.id,
                &[TaskStatus::QueuedParse],
                TaskStatus::Downloaded,
                TransitionPatch::default(),
                db,
            )
            .await?;
        }
        Ok(())
    }
}
