// Main entry point for the crawl orchestration service: dispatcher plus
// crawl and parse workers in one process.

use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator::domains::proxies::ProxyAllocator;
use orchestrator::kernel::broker::JetStreamBroker;
use orchestrator::kernel::dispatcher::Dispatcher;
use orchestrator::kernel::workers::{
    CrawlWorker, FsBlobStore, HttpFetcher, ParseWorker, ParserRegistry,
};
use orchestrator::kernel::Kernel;
use orchestrator::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    tracing::info!("starting crawld");

    let config = Config::from_env().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    tracing::info!("database connected");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("migrations complete");

    let nats = async_nats::connect(&config.nats_url)
        .await
        .context("failed to connect to broker")?;
    let broker = JetStreamBroker::connect(nats, &config.broker)
        .await
        .context("failed to declare queues")?;
    tracing::info!("broker connected");

    let kernel = Kernel::new(pool.clone(), Arc::new(broker), config.clone());

    let allocator = Arc::new(ProxyAllocator::new(pool, config.proxy.clone()));
    let fetcher = Arc::new(HttpFetcher::new(config.http_timeout));
    let blobs = Arc::new(FsBlobStore::new(config.storage_path.clone()));
    let registry = Arc::new(ParserRegistry::with_defaults());

    let shutdown = CancellationToken::new();

    let dispatcher = Dispatcher::new(kernel.clone());
    let crawl_worker = CrawlWorker::new(
        kernel.clone(),
        allocator,
        fetcher,
        Arc::clone(&blobs) as _,
    );
    let parse_worker = ParseWorker::new(kernel, registry, blobs);

    let mut services = tokio::task::JoinSet::new();
    services.spawn(dispatcher.run(shutdown.clone()));
    services.spawn(crawl_worker.run(shutdown.clone()));
    services.spawn(parse_worker.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("received shutdown signal");
    shutdown.cancel();

    while services.join_next().await.is_some() {}
    tracing::info!("crawld stopped");

    Ok(())
}
