//! Worker services for the two pipeline stages, plus their seams: the HTTP
//! fetcher, the blob store, and the parser registry.

pub mod blob;
pub mod crawl;
pub mod fetch;
pub mod parse;
pub mod registry;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use crawl::{CrawlWorker, CrawlWorkerConfig};
pub use fetch::{Fetcher, HttpFetcher, StaticFetcher};
pub use parse::{ParseWorker, ParseWorkerConfig};
pub use registry::{ArchiveHandler, ParseHandler, ParseOutput, ParserRegistry};
