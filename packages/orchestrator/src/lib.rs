// Crawl orchestration core.
//
// Durable crawl tasks flow pending -> queued -> crawling -> downloaded ->
// queued_parse -> parsing -> completed under a CAS-per-transition
// discipline. The kernel holds the dispatcher, workers, and broker; the
// domains hold hosts, proxies (with per-host rotation), and tasks.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use common::OrchestratorError;
pub use config::Config;
