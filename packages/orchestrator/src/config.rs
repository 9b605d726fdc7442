use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub nats_url: String,
    pub storage_path: String,
    pub http_timeout: Duration,
    pub user_agent: String,

    pub dispatcher: DispatcherSettings,
    pub deadlines: StateDeadlines,
    pub backoff: BackoffSettings,
    pub proxy: ProxySettings,
    pub broker: BrokerSettings,
    pub url_normalize: UrlNormalizeSettings,
}

/// Cadence and batch size of the dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub interval: Duration,
    pub batch_size: i64,
}

/// Lease TTL per non-terminal active state. A task stuck past its deadline
/// is reclaimed to pending by the dispatcher.
#[derive(Debug, Clone)]
pub struct StateDeadlines {
    pub queued: Duration,
    pub crawling: Duration,
    pub queued_parse: Duration,
    pub parsing: Duration,
}

/// Exponential retry delay curve: `base * 2^(retry_count - 1)`, capped.
#[derive(Debug, Clone)]
pub struct BackoffSettings {
    pub base: Duration,
    pub cap: Duration,
}

/// Consecutive-failure thresholds for auto-disabling identities.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Per (host, proxy) binding; the health gate in the allocator.
    pub binding_failure_threshold: i32,
    /// Global per-proxy threshold.
    pub global_failure_threshold: i32,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub prefetch: i64,
    pub queue_max_length: i64,
    pub ttl_work: Duration,
    pub ttl_priority: Duration,
    pub replicas: usize,
}

/// Toggles for URL normalization, the input to fingerprinting.
#[derive(Debug, Clone)]
pub struct UrlNormalizeSettings {
    pub sort_query: bool,
    pub strip_fragment: bool,
    pub drop_empty_params: bool,
}

impl Default for UrlNormalizeSettings {
    fn default() -> Self {
        Self {
            sort_query: true,
            strip_fragment: true,
            drop_empty_params: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Only `DATABASE_URL` is required; every tunable has a default.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            nats_url: env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            storage_path: env::var("STORAGE_PATH").unwrap_or_else(|_| "./storage".to_string()),
            http_timeout: secs("HTTP_TIMEOUT_SECS", 30)?,
            user_agent: env::var("USER_AGENT").unwrap_or_else(|_| "crawld/1.0".to_string()),

            dispatcher: DispatcherSettings {
                interval: secs("DISPATCHER_INTERVAL_SECS", 10)?,
                batch_size: parsed("DISPATCHER_BATCH_SIZE", 100)?,
            },
            deadlines: StateDeadlines {
                queued: secs("STATE_DEADLINE_QUEUED_SECS", 600)?,
                crawling: secs("STATE_DEADLINE_CRAWLING_SECS", 300)?,
                queued_parse: secs("STATE_DEADLINE_QUEUED_PARSE_SECS", 600)?,
                parsing: secs("STATE_DEADLINE_PARSING_SECS", 120)?,
            },
            backoff: BackoffSettings {
                base: secs("BACKOFF_BASE_SECS", 60)?,
                cap: secs("BACKOFF_CAP_SECS", 3600)?,
            },
            proxy: ProxySettings {
                binding_failure_threshold: parsed("PROXY_BINDING_FAILURE_THRESHOLD", 5)?,
                global_failure_threshold: parsed("PROXY_GLOBAL_FAILURE_THRESHOLD", 10)?,
            },
            broker: BrokerSettings {
                prefetch: parsed("BROKER_PREFETCH", 10)?,
                queue_max_length: parsed("QUEUE_MAX_LENGTH", 100_000)?,
                ttl_work: secs("QUEUE_TTL_WORK_SECS", 86_400)?,
                ttl_priority: secs("QUEUE_TTL_PRIORITY_SECS", 3_600)?,
                replicas: parsed("QUEUE_REPLICAS", 3)?,
            },
            url_normalize: UrlNormalizeSettings {
                sort_query: flag("URL_NORMALIZE_SORT_QUERY", true)?,
                strip_fragment: flag("URL_NORMALIZE_STRIP_FRAGMENT", true)?,
                drop_empty_params: flag("URL_NORMALIZE_DROP_EMPTY_PARAMS", true)?,
            },
        })
    }
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{name} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn secs(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parsed(name, default)?))
}

fn flag(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<bool>()
            .with_context(|| format!("{name} must be true or false, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
