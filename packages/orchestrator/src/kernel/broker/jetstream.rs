//! JetStream-backed broker.
//!
//! Each logical queue is a file-backed work-queue stream with one durable
//! pull consumer shared by all workers of that stage:
//! - durability: file storage, messages survive broker restart
//! - at-least-once: explicit ack, redelivery after `ack_wait`
//! - prefetch: `max_ack_pending` caps unacked messages per consumer
//! - bounds: `max_messages` (queue cap) and `max_age` (24 h work / 1 h
//!   priority TTL)
//! - mirroring: `num_replicas` across the cluster tolerates one node loss

use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::consumer::Consumer;
use async_nats::jetstream::stream::{RetentionPolicy, StorageType};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;

use super::{Acker, Broker, Delivery, QueueName};
use crate::common::OrchestratorError;
use crate::config::BrokerSettings;

const CONSUMER_NAME: &str = "workers";

pub struct JetStreamBroker {
    context: jetstream::Context,
    consumers: HashMap<QueueName, Consumer<pull::Config>>,
}

impl JetStreamBroker {
    /// Declare the three streams and their durable consumers, then return a
    /// ready broker. Declaration is idempotent across replicas.
    pub async fn connect(
        client: async_nats::Client,
        settings: &BrokerSettings,
    ) -> Result<Self, OrchestratorError> {
        let context = jetstream::new(client);
        let mut consumers = HashMap::new();

        for queue in QueueName::ALL {
            let ttl = match queue {
                QueueName::Priority => settings.ttl_priority,
                QueueName::Crawl | QueueName::Parse => settings.ttl_work,
            };

            let stream = context
                .get_or_create_stream(jetstream::stream::Config {
                    name: queue.subject().to_string(),
                    subjects: vec![queue.subject().to_string()],
                    storage: StorageType::File,
                    retention: RetentionPolicy::WorkQueue,
                    max_messages: settings.queue_max_length,
                    max_age: ttl,
                    num_replicas: settings.replicas,
                    ..Default::default()
                })
                .await
                .map_err(broker_err)?;

            let consumer = stream
                .get_or_create_consumer(
                    CONSUMER_NAME,
                    pull::Config {
                        durable_name: Some(CONSUMER_NAME.to_string()),
                        ack_policy: AckPolicy::Explicit,
                        ack_wait: visibility_timeout(queue),
                        max_ack_pending: settings.prefetch,
                        ..Default::default()
                    },
                )
                .await
                .map_err(broker_err)?;

            debug!(queue = %queue, "declared stream and consumer");
            consumers.insert(queue, consumer);
        }

        Ok(Self { context, consumers })
    }
}

/// How long a fetched message stays invisible before redelivery. Sized to
/// the slowest legitimate handling of that stage, shorter than the task's
/// state deadline so the broker retries before the lease reclaim does.
fn visibility_timeout(queue: QueueName) -> Duration {
    match queue {
        QueueName::Crawl | QueueName::Priority => Duration::from_secs(120),
        QueueName::Parse => Duration::from_secs(60),
    }
}

fn broker_err(e: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::BrokerUnavailable(e.to_string())
}

#[async_trait]
impl Broker for JetStreamBroker {
    async fn publish(&self, queue: QueueName, payload: Bytes) -> Result<(), OrchestratorError> {
        // Wait for the stream-level ack so a publish reported Ok is durable.
        self.context
            .publish(queue.subject(), payload)
            .await
            .map_err(broker_err)?
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn fetch(
        &self,
        queue: QueueName,
        max: usize,
    ) -> Result<Vec<Delivery>, OrchestratorError> {
        let consumer = self
            .consumers
            .get(&queue)
            .ok_or_else(|| OrchestratorError::BrokerUnavailable(format!("no consumer for {queue}")))?;

        let mut batch = consumer
            .fetch()
            .max_messages(max)
            .messages()
            .await
            .map_err(broker_err)?;

        let mut deliveries = Vec::new();
        while let Some(message) = batch.next().await {
            let message = message.map_err(broker_err)?;
            let attempt = message.info().map(|i| i.delivered as u64).unwrap_or(1);
            deliveries.push(Delivery::new(
                queue,
                message.payload.clone(),
                attempt,
                Box::new(JetStreamAcker { message }),
            ));
        }
        Ok(deliveries)
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(self: Box<Self>) -> Result<(), OrchestratorError> {
        self.message.ack().await.map_err(broker_err)
    }

    async fn nack(self: Box<Self>) -> Result<(), OrchestratorError> {
        self.message
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(broker_err)
    }
}
