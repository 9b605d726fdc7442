//! Parser registry: parser tags resolved to handlers.
//!
//! Hosts carry a `parser_tag`; the parse worker looks the tag up here and
//! hands the downloaded HTML to the matching handler. Handlers own product
//! extraction and their write sinks; the orchestration core only routes.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::kernel::broker::ParseJob;

/// Summary a handler reports back after a successful parse.
#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub items_extracted: u64,
}

#[async_trait]
pub trait ParseHandler: Send + Sync {
    async fn parse(&self, job: &ParseJob, html: &[u8]) -> Result<ParseOutput>;
}

/// Tag -> handler lookup table held by parse workers.
#[derive(Default)]
pub struct ParserRegistry {
    handlers: HashMap<String, Arc<dyn ParseHandler>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `archive` handler, for hosts that only
    /// need their HTML captured.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("archive", Arc::new(ArchiveHandler));
        registry
    }

    pub fn register(&mut self, tag: &str, handler: Arc<dyn ParseHandler>) {
        self.handlers.insert(tag.to_string(), handler);
    }

    pub fn resolve(&self, tag: &str) -> Option<Arc<dyn ParseHandler>> {
        self.handlers.get(tag).cloned()
    }

    pub fn tags(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Handler that extracts nothing; completing the task archives the blob.
pub struct ArchiveHandler;

#[async_trait]
impl ParseHandler for ArchiveHandler {
    async fn parse(&self, _job: &ParseJob, _html: &[u8]) -> Result<ParseOutput> {
        Ok(ParseOutput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn job(tag: &str) -> ParseJob {
        ParseJob {
            task_id: Uuid::now_v7(),
            host_id: Uuid::now_v7(),
            blob_ref: "blob".into(),
            parser_tag: tag.into(),
            attempt: 1,
        }
    }

    #[test]
    fn unknown_tag_resolves_to_none() {
        let registry = ParserRegistry::new();
        assert!(registry.resolve("amazon").is_none());
    }

    #[test]
    fn defaults_include_archive() {
        let registry = ParserRegistry::with_defaults();
        assert!(registry.resolve("archive").is_some());
    }

    #[tokio::test]
    async fn archive_handler_extracts_nothing() {
        let output = ArchiveHandler
            .parse(&job("archive"), b"<html></html>")
            .await
            .unwrap();
        assert_eq!(output.items_extracted, 0);
    }

    #[test]
    fn registered_handlers_are_resolvable() {
        let mut registry = ParserRegistry::new();
        registry.register("books", Arc::new(ArchiveHandler));
        assert!(registry.resolve("books").is_some());
        assert_eq!(registry.tags(), vec!["books"]);
    }
}
