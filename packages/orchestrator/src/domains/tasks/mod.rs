pub mod actions;
pub mod backoff;
pub mod models;
pub mod query;
pub mod url_norm;

pub use models::{AttemptOutcome, CrawlTask, CreateTaskOptions, TaskStatus, TransitionPatch};
