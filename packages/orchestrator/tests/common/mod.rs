//! Shared harness for database-backed tests.
//!
//! Tests run against the Postgres at `TEST_DATABASE_URL` and skip (with a
//! note on stderr) when it is not set, so the pure-logic suite stays green
//! on machines without a database.

#![allow(dead_code)]

use std::time::Duration;

use orchestrator::config::{
    BackoffSettings, BrokerSettings, Config, DispatcherSettings, ProxySettings, StateDeadlines,
    UrlNormalizeSettings,
};
use orchestrator::domains::hosts::Host;
use orchestrator::domains::proxies::Proxy;
use orchestrator::kernel::record::Record;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

/// Tests that tick a dispatcher or worker serialize on this lock so two
/// tests' pipelines do not claim each other's tasks mid-assertion. The
/// tables are shared, so assertions should still be task-scoped.
pub async fn pipeline_lock() -> tokio::sync::MutexGuard<'static, ()> {
    use std::sync::OnceLock;
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(())).lock().await
}

pub async fn test_pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping database test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");
    Some(pool)
}

/// Config for tests; the pool is handed to the kernel separately, so the
/// database_url here is never dialed.
pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".into(),
        nats_url: "nats://unused".into(),
        storage_path: "./storage".into(),
        http_timeout: Duration::from_secs(5),
        user_agent: "crawld-test/1.0".into(),
        dispatcher: DispatcherSettings {
            interval: Duration::from_millis(10),
            batch_size: 500,
        },
        deadlines: StateDeadlines {
            queued: Duration::from_secs(600),
            crawling: Duration::from_secs(300),
            queued_parse: Duration::from_secs(600),
            parsing: Duration::from_secs(120),
        },
        backoff: BackoffSettings {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(3600),
        },
        proxy: ProxySettings {
            binding_failure_threshold: 5,
            global_failure_threshold: 10,
        },
        broker: BrokerSettings {
            prefetch: 10,
            queue_max_length: 1000,
            ttl_work: Duration::from_secs(86_400),
            ttl_priority: Duration::from_secs(3_600),
            replicas: 1,
        },
        url_normalize: UrlNormalizeSettings::default(),
    }
}

/// Create an active host with a unique name.
pub async fn create_host(pool: &PgPool) -> Host {
    Host::builder()
        .name(format!("host-{}.example", Uuid::new_v4()))
        .base_url("https://a.example")
        .parser_tag("archive")
        .build()
        .insert(pool)
        .await
        .expect("failed to create host")
}

/// Create a proxy with a unique endpoint.
pub async fn create_proxy(pool: &PgPool) -> Proxy {
    Proxy::builder()
        .endpoint_host(format!("proxy-{}", Uuid::new_v4()))
        .endpoint_port(8080)
        .build()
        .insert(pool)
        .await
        .expect("failed to create proxy")
}

/// A URL that no other test run will collide with.
pub fn unique_url(path: &str) -> String {
    format!("https://a.example/{path}-{}", Uuid::new_v4())
}
