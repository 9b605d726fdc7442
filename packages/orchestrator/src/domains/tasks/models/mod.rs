mod crawl_task;

pub use crawl_task::{
    AttemptOutcome, BulkSubmitOutcome, CrawlTask, CreateTaskOptions, TaskStatus, TransitionPatch,
    MAX_BULK_SUBMIT,
};
