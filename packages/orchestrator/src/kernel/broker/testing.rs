//! In-memory broker that tracks published and in-flight messages for tests.
//!
//! Mirrors the at-least-once contract of the real broker: fetched messages
//! sit in-flight until acked; a nack (or `redeliver_unacked`) puts them back
//! at the head of the queue with an incremented delivery count.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use super::{Acker, Broker, Delivery, QueueName};
use crate::common::OrchestratorError;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<u64, StoredMessage>,
}

#[derive(Clone)]
struct StoredMessage {
    payload: Bytes,
    deliveries: u64,
}

struct BrokerState {
    queues: HashMap<QueueName, QueueState>,
    next_tag: u64,
    /// Per-queue capacity; publishes beyond it fail like a full queue.
    capacity: Option<usize>,
    /// When true every publish fails, simulating a broker outage.
    publishes_fail: bool,
}

/// Cloning shares the underlying queues, so a test can keep one handle for
/// assertions while the code under test owns another as `Arc<dyn Broker>`.
#[derive(Clone)]
pub struct TestBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for TestBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBroker {
    pub fn new() -> Self {
        let mut queues = HashMap::new();
        for queue in QueueName::ALL {
            queues.insert(queue, QueueState::default());
        }
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queues,
                next_tag: 0,
                capacity: None,
                publishes_fail: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cap each queue at `n` ready messages to exercise backpressure.
    pub fn set_capacity(&self, n: usize) {
        self.lock().capacity = Some(n);
    }

    /// Make every publish fail, simulating an unreachable broker.
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().publishes_fail = fail;
    }

    /// Number of ready (not yet fetched) messages on a queue.
    pub fn len(&self, queue: QueueName) -> usize {
        self.lock().queues[&queue].ready.len()
    }

    pub fn is_empty(&self, queue: QueueName) -> bool {
        self.len(queue) == 0
    }

    /// Number of fetched-but-unacked messages on a queue.
    pub fn in_flight(&self, queue: QueueName) -> usize {
        self.lock().queues[&queue].in_flight.len()
    }

    /// Deserialize all ready payloads on a queue without consuming them.
    pub fn ready_messages<T: serde::de::DeserializeOwned>(&self, queue: QueueName) -> Vec<T> {
        self.lock().queues[&queue]
            .ready
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }

    /// Simulate a consumer disconnect / visibility timeout: every in-flight
    /// message goes back to the head of its queue for redelivery.
    pub fn redeliver_unacked(&self) {
        let mut state = self.lock();
        for queue_state in state.queues.values_mut() {
            for (_, message) in queue_state.in_flight.drain() {
                queue_state.ready.push_front(message);
            }
        }
    }
}

fn complete(state: &Arc<Mutex<BrokerState>>, queue: QueueName, tag: u64, requeue: bool) {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    let queue_state = state.queues.get_mut(&queue).expect("queue exists");
    if let Some(message) = queue_state.in_flight.remove(&tag) {
        if requeue {
            queue_state.ready.push_front(message);
        }
    }
}

#[async_trait]
impl Broker for TestBroker {
    async fn publish(&self, queue: QueueName, payload: Bytes) -> Result<(), OrchestratorError> {
        let mut state = self.lock();
        if state.publishes_fail {
            return Err(OrchestratorError::BrokerUnavailable(
                "test broker is down".into(),
            ));
        }
        if let Some(cap) = state.capacity {
            if state.queues[&queue].ready.len() >= cap {
                return Err(OrchestratorError::BrokerUnavailable(format!(
                    "queue {queue} at capacity"
                )));
            }
        }
        state
            .queues
            .get_mut(&queue)
            .expect("queue exists")
            .ready
            .push_back(StoredMessage {
                payload,
                deliveries: 0,
            });
        Ok(())
    }

    async fn fetch(
        &self,
        queue: QueueName,
        max: usize,
    ) -> Result<Vec<Delivery>, OrchestratorError> {
        let mut state = self.lock();
        let mut fetched = Vec::new();
        for _ in 0..max {
            state.next_tag += 1;
            let tag = state.next_tag;
            let queue_state = state.queues.get_mut(&queue).expect("queue exists");
            let Some(mut message) = queue_state.ready.pop_front() else {
                break;
            };
            message.deliveries += 1;
            let delivery = Delivery::new(
                queue,
                message.payload.clone(),
                message.deliveries,
                Box::new(TestAcker {
                    state: Arc::clone(&self.state),
                    queue,
                    tag,
                }),
            );
            queue_state.in_flight.insert(tag, message);
            fetched.push(delivery);
        }
        Ok(fetched)
    }
}

struct TestAcker {
    state: Arc<Mutex<BrokerState>>,
    queue: QueueName,
    tag: u64,
}

#[async_trait]
impl Acker for TestAcker {
    async fn ack(self: Box<Self>) -> Result<(), OrchestratorError> {
        complete(&self.state, self.queue, self.tag, false);
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), OrchestratorError> {
        complete(&self.state, self.queue, self.tag, true);
        Ok(())
    }
}
