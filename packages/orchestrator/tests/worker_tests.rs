//! Worker stage behavior end to end against the store and the in-memory
//! broker: download, parse, pause races, proxy parking, redeliveries.
//!
//! The tables are shared across tests, so every test runs under the
//! pipeline lock and asserts only on its own tasks.

mod common;

use std::sync::Arc;

use chrono::Utc;
use orchestrator::config::UrlNormalizeSettings;
use orchestrator::domains::proxies::ProxyAllocator;
use orchestrator::domains::tasks::{actions, CrawlTask, CreateTaskOptions, TaskStatus};
use orchestrator::kernel::broker::{Broker, CrawlJob, ParseJob, QueueName, TestBroker};
use orchestrator::kernel::dispatcher::Dispatcher;
use orchestrator::kernel::record::Record;
use orchestrator::kernel::workers::{
    CrawlWorker, MemoryBlobStore, ParseWorker, ParserRegistry, StaticFetcher,
};
use orchestrator::kernel::Kernel;

struct Harness {
    pool: sqlx::PgPool,
    kernel: Kernel,
    broker: TestBroker,
    fetcher: Arc<StaticFetcher>,
    blobs: Arc<MemoryBlobStore>,
}

impl Harness {
    async fn new() -> Option<Self> {
        let pool = common::test_pool().await?;
        let broker = TestBroker::new();
        let kernel = Kernel::new(pool.clone(), Arc::new(broker.clone()), common::test_config());
        Some(Self {
            pool,
            kernel,
            broker,
            fetcher: Arc::new(StaticFetcher::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
        })
    }

    fn allocator(&self) -> ProxyAllocator {
        ProxyAllocator::new(self.pool.clone(), common::test_config().proxy)
    }

    fn crawl_worker(&self) -> CrawlWorker {
        CrawlWorker::new(
            self.kernel.clone(),
            Arc::new(self.allocator()),
            Arc::clone(&self.fetcher) as _,
            Arc::clone(&self.blobs) as _,
        )
    }

    fn parse_worker(&self) -> ParseWorker {
        ParseWorker::new(
            self.kernel.clone(),
            Arc::new(ParserRegistry::with_defaults()),
            Arc::clone(&self.blobs) as _,
        )
    }

    async fn dispatch(&self) {
        Dispatcher::new(self.kernel.clone()).run_once().await.unwrap();
    }

    /// Run the crawl worker until its queues are drained.
    async fn drain_crawl(&self) {
        let worker = self.crawl_worker();
        while worker.run_once().await.unwrap() > 0 {}
    }

    /// Run the parse worker until its queue is drained.
    async fn drain_parse(&self) {
        let worker = self.parse_worker();
        while worker.run_once().await.unwrap() > 0 {}
    }

    async fn submit(&self, host: &orchestrator::domains::hosts::Host, url: &str) -> CrawlTask {
        actions::submit(
            host.id,
            url,
            CreateTaskOptions::default(),
            &UrlNormalizeSettings::default(),
            &self.pool,
        )
        .await
        .unwrap()
    }

    async fn bind_proxy(&self, host: &orchestrator::domains::hosts::Host) {
        let proxy = common::create_proxy(&self.pool).await;
        self.allocator().bind(host.id, proxy.id, 5).await.unwrap();
    }

    async fn reload(&self, task: &CrawlTask) -> CrawlTask {
        CrawlTask::find_by_id(task.id, &self.pool).await.unwrap()
    }
}

#[tokio::test]
async fn a_task_flows_through_both_stages_to_completed() {
    let Some(h) = Harness::new().await else { return };
    let _guard = common::pipeline_lock().await;
    let host = common::create_host(&h.pool).await;
    h.bind_proxy(&host).await;

    let task = h.submit(&host, &common::unique_url("flow")).await;
    h.fetcher.respond(&task.url, 200, "<html>products</html>");

    // Dispatch, download, parse
    h.dispatch().await;
    h.drain_crawl().await;

    let mid = h.reload(&task).await;
    assert_eq!(mid.status, TaskStatus::QueuedParse);
    assert_eq!(mid.http_code, Some(200));
    assert!(mid.blob_ref.is_some());
    assert!(mid.proxy_id.is_some());
    assert!(mid.started_at.is_some());

    h.drain_parse().await;

    let done = h.reload(&task).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.started_at.unwrap() <= done.completed_at.unwrap());
    assert!(done.next_run_at.unwrap() > done.completed_at.unwrap());

    // Everything acked, nothing left in flight
    assert_eq!(h.broker.in_flight(QueueName::Crawl), 0);
    assert_eq!(h.broker.in_flight(QueueName::Parse), 0);
}

#[tokio::test]
async fn paused_task_is_acked_without_work_on_dequeue() {
    let Some(h) = Harness::new().await else { return };
    let _guard = common::pipeline_lock().await;
    let host = common::create_host(&h.pool).await;
    h.bind_proxy(&host).await;

    let task = h.submit(&host, &common::unique_url("pause-race")).await;
    h.dispatch().await;

    // Admin pauses while the message is already on the queue
    actions::pause(task.id, &h.pool).await.unwrap();

    h.drain_crawl().await;

    let after = h.reload(&task).await;
    assert_eq!(after.status, TaskStatus::Paused);
    assert_eq!(h.broker.in_flight(QueueName::Crawl), 0);
}

#[tokio::test]
async fn no_proxy_parks_the_task_without_burning_a_retry() {
    let Some(h) = Harness::new().await else { return };
    let _guard = common::pipeline_lock().await;
    let host = common::create_host(&h.pool).await;
    // Deliberately no binding for this host

    let task = h.submit(&host, &common::unique_url("noproxy")).await;
    h.dispatch().await;
    h.drain_crawl().await;

    let after = h.reload(&task).await;
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.retry_count, 0);
    assert!(after.scheduled_at > Utc::now());
}

#[tokio::test]
async fn network_failure_records_a_transient_attempt() {
    let Some(h) = Harness::new().await else { return };
    let _guard = common::pipeline_lock().await;
    let host = common::create_host(&h.pool).await;
    h.bind_proxy(&host).await;

    let task = h.submit(&host, &common::unique_url("netfail")).await;
    h.fetcher.fail(&task.url, "connection refused");

    h.dispatch().await;
    h.drain_crawl().await;

    let after = h.reload(&task).await;
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.retry_count, 1);
    assert!(after.error.as_deref().unwrap().contains("connection refused"));
    assert!(after.scheduled_at > Utc::now());
}

#[tokio::test]
async fn http_404_fails_the_task_terminally() {
    let Some(h) = Harness::new().await else { return };
    let _guard = common::pipeline_lock().await;
    let host = common::create_host(&h.pool).await;
    h.bind_proxy(&host).await;

    let task = h.submit(&host, &common::unique_url("gone")).await;
    h.fetcher.respond(&task.url, 404, "not found");

    h.dispatch().await;
    h.drain_crawl().await;

    let after = h.reload(&task).await;
    assert_eq!(after.status, TaskStatus::Failed);
    assert_eq!(after.error.as_deref(), Some("http status 404"));
}

#[tokio::test]
async fn redelivered_crawl_job_does_not_advance_state_twice() {
    let Some(h) = Harness::new().await else { return };
    let _guard = common::pipeline_lock().await;
    let host = common::create_host(&h.pool).await;
    h.bind_proxy(&host).await;

    let task = h.submit(&host, &common::unique_url("redelivered")).await;
    h.fetcher.respond(&task.url, 200, "<html></html>");

    h.dispatch().await;
    h.drain_crawl().await;
    let first = h.reload(&task).await;
    assert_eq!(first.status, TaskStatus::QueuedParse);

    // Simulate the broker redelivering the already-processed message
    let job = CrawlJob {
        task_id: task.id,
        url: first.url.clone(),
        host_id: host.id,
        priority: first.priority,
        proxy_handle: None,
        attempt: 1,
    };
    h.broker
        .publish(
            QueueName::Crawl,
            bytes::Bytes::from(serde_json::to_vec(&job).unwrap()),
        )
        .await
        .unwrap();
    h.drain_crawl().await;

    // The second delivery's status re-check drops it; no state regression
    let second = h.reload(&task).await;
    assert_eq!(second.status, TaskStatus::QueuedParse);
    assert_eq!(second.last_transition_at, first.last_transition_at);
}

#[tokio::test]
async fn unknown_parser_tag_is_a_terminal_failure() {
    let Some(h) = Harness::new().await else { return };
    let _guard = common::pipeline_lock().await;
    let host = common::create_host(&h.pool).await;
    let task = h.submit(&host, &common::unique_url("untagged")).await;

    sqlx::query("UPDATE crawl_tasks SET status = 'queued_parse', blob_ref = 'b/1.html' WHERE id = $1")
        .bind(task.id)
        .execute(&h.pool)
        .await
        .unwrap();
    let job = ParseJob {
        task_id: task.id,
        host_id: host.id,
        blob_ref: "b/1.html".into(),
        parser_tag: "no-such-parser".into(),
        attempt: 1,
    };
    h.broker
        .publish(
            QueueName::Parse,
            bytes::Bytes::from(serde_json::to_vec(&job).unwrap()),
        )
        .await
        .unwrap();

    h.drain_parse().await;

    let after = h.reload(&task).await;
    assert_eq!(after.status, TaskStatus::Failed);
    assert!(after.error.as_deref().unwrap().contains("no parser registered"));
}

#[tokio::test]
async fn missing_blob_fails_the_parse_terminally() {
    let Some(h) = Harness::new().await else { return };
    let _guard = common::pipeline_lock().await;
    let host = common::create_host(&h.pool).await;
    let task = h.submit(&host, &common::unique_url("missing-blob")).await;

    sqlx::query("UPDATE crawl_tasks SET status = 'queued_parse', blob_ref = 'gone/1.html' WHERE id = $1")
        .bind(task.id)
        .execute(&h.pool)
        .await
        .unwrap();
    let job = ParseJob {
        task_id: task.id,
        host_id: host.id,
        blob_ref: "gone/1.html".into(),
        parser_tag: "archive".into(),
        attempt: 1,
    };
    h.broker
        .publish(
            QueueName::Parse,
            bytes::Bytes::from(serde_json::to_vec(&job).unwrap()),
        )
        .await
        .unwrap();

    h.drain_parse().await;

    let after = h.reload(&task).await;
    assert_eq!(after.status, TaskStatus::Failed);
    assert!(after.error.as_deref().unwrap().contains("is gone"));
}

#[tokio::test]
async fn priority_tasks_ride_their_own_queue_through_the_worker() {
    let Some(h) = Harness::new().await else { return };
    let _guard = common::pipeline_lock().await;
    let host = common::create_host(&h.pool).await;
    h.bind_proxy(&host).await;

    let normal = h.submit(&host, &common::unique_url("normal")).await;
    let urgent = actions::submit(
        host.id,
        &common::unique_url("urgent"),
        CreateTaskOptions {
            priority: Some(1),
            ..Default::default()
        },
        &UrlNormalizeSettings::default(),
        &h.pool,
    )
    .await
    .unwrap();
    h.fetcher.respond(&normal.url, 200, "<html></html>");
    h.fetcher.respond(&urgent.url, 200, "<html></html>");

    h.dispatch().await;
    let priority_jobs: Vec<CrawlJob> = h.broker.ready_messages(QueueName::Priority);
    assert!(priority_jobs.iter().any(|j| j.task_id == urgent.id));
    let crawl_jobs: Vec<CrawlJob> = h.broker.ready_messages(QueueName::Crawl);
    assert!(crawl_jobs.iter().any(|j| j.task_id == normal.id));
    assert!(crawl_jobs.iter().all(|j| j.task_id != urgent.id));

    h.drain_crawl().await;

    // Both made it through their respective queues
    assert_eq!(h.reload(&urgent).await.status, TaskStatus::QueuedParse);
    assert_eq!(h.reload(&normal).await.status, TaskStatus::QueuedParse);
}
