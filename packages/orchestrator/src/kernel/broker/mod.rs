//! Broker abstraction for the three durable work queues.
//!
//! Provides a trait-based broker so the JetStream-backed implementation and
//! the in-memory test broker are interchangeable.
//!
//! Queues:
//! - `crawl`: default-priority download work
//! - `parse`: post-download extraction work
//! - `priority`: tasks with priority <= 2 skip the crawl queue
//!
//! Delivery is at-least-once with explicit acknowledgement. Consumers cap
//! in-flight work with a prefetch limit; unacked messages are redelivered
//! after the visibility timeout. Duplicate deliveries are harmless because
//! every state advance behind a message is a conditional CAS.

pub mod jetstream;
pub mod testing;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::OrchestratorError;

pub use jetstream::JetStreamBroker;
pub use testing::TestBroker;

// ============================================================================
// Queues
// ============================================================================

/// The three logical queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Crawl,
    Parse,
    Priority,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Crawl, QueueName::Parse, QueueName::Priority];

    /// Broker subject / queue identifier.
    pub fn subject(&self) -> &'static str {
        match self {
            QueueName::Crawl => "crawl",
            QueueName::Parse => "parse",
            QueueName::Priority => "priority",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.subject())
    }
}

/// Queue routing: tasks at priority 1 or 2 skip the crawl queue.
pub fn route_for_priority(priority: i32) -> QueueName {
    if priority <= 2 {
        QueueName::Priority
    } else {
        QueueName::Crawl
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Message handed to a crawler worker. Carries the minimum context to work
/// without re-querying the store; authoritative state is re-read at stage
/// entry anyway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub task_id: Uuid,
    pub url: String,
    pub host_id: Uuid,
    pub priority: i32,
    pub proxy_handle: Option<Uuid>,
    pub attempt: i32,
}

/// Message handed to a parser worker after a successful download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseJob {
    pub task_id: Uuid,
    pub host_id: Uuid,
    pub blob_ref: String,
    pub parser_tag: String,
    pub attempt: i32,
}

// ============================================================================
// Broker trait
// ============================================================================

/// Durable at-least-once queue operations.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message. Fails with `BrokerUnavailable` when the broker is
    /// unreachable or the queue is at capacity; the caller decides whether
    /// that pauses a batch or fails an item.
    async fn publish(&self, queue: QueueName, payload: Bytes) -> Result<(), OrchestratorError>;

    /// Fetch up to `max` messages for processing. Fetched messages count
    /// against the consumer's prefetch window until acked or nacked.
    async fn fetch(&self, queue: QueueName, max: usize)
        -> Result<Vec<Delivery>, OrchestratorError>;
}

/// Publish a JSON-serializable payload.
pub async fn publish_json<T: Serialize>(
    broker: &dyn Broker,
    queue: QueueName,
    payload: &T,
) -> Result<(), OrchestratorError> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| OrchestratorError::Validation(format!("payload serialization: {e}")))?;
    broker.publish(queue, Bytes::from(bytes)).await
}

// ============================================================================
// Deliveries
// ============================================================================

/// One fetched message plus its acknowledgement handle.
pub struct Delivery {
    pub queue: QueueName,
    pub payload: Bytes,
    /// 1-based delivery count; > 1 means this is a redelivery.
    pub attempt: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(queue: QueueName, payload: Bytes, attempt: u64, acker: Box<dyn Acker>) -> Self {
        Self {
            queue,
            payload,
            attempt,
            acker,
        }
    }

    /// Deserialize the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, OrchestratorError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| OrchestratorError::Validation(format!("malformed message payload: {e}")))
    }

    /// Acknowledge: the message is done and will not be redelivered.
    pub async fn ack(self) -> Result<(), OrchestratorError> {
        self.acker.ack().await
    }

    /// Negative-acknowledge: hand the message back for redelivery.
    pub async fn nack(self) -> Result<(), OrchestratorError> {
        self.acker.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Acknowledgement backend for one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), OrchestratorError>;
    async fn nack(self: Box<Self>) -> Result<(), OrchestratorError>;
}
