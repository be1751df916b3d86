//! NATS JetStream transport
//!
//! A durable pull consumer with explicit acks stands in for the queue:
//! fetch is a bounded long poll, the delivered count is the receive count,
//! and deleting a message is a confirmed ack.

use async_nats::header::{HeaderMap, NATS_MESSAGE_ID};
use async_nats::jetstream::{self, consumer::PullConsumer};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Acknowledgeable, DeleteOutcome, QueueClient, RawMessage, APPROXIMATE_RECEIVE_COUNT};
use crate::config::NatsConfig;
use crate::error::QueueError;

/// Attribute holding the JetStream stream sequence of the message
pub const STREAM_SEQUENCE: &str = "StreamSequence";

async fn connect_stream(
    config: &NatsConfig,
) -> Result<(jetstream::Context, jetstream::stream::Stream), QueueError> {
    let client = async_nats::connect(&config.url)
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?;
    tracing::info!("Connected to NATS at {}", config.url);

    let jetstream = jetstream::new(client);

    let stream = jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: config.stream_name.clone(),
            subjects: vec![config.subject.clone()],
            max_age: config.max_age(),
            max_bytes: config.max_bytes,
            storage: jetstream::stream::StorageType::File,
            num_replicas: 1,
            ..Default::default()
        })
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?;

    tracing::info!("JetStream stream '{}' ready", config.stream_name);
    Ok((jetstream, stream))
}

/// [`QueueClient`] backed by a durable JetStream pull consumer
#[derive(Clone)]
pub struct JetStreamQueue {
    consumer: PullConsumer,
    fetch_wait: Duration,
    receive_errors: Arc<AtomicU64>,
}

impl JetStreamQueue {
    /// Connect, ensure the stream exists and bind the durable consumer
    pub async fn connect(config: &NatsConfig) -> Result<Self, QueueError> {
        let (_jetstream, stream) = connect_stream(config).await?;

        let consumer = stream
            .get_or_create_consumer(
                &config.consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(config.consumer_name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: config.ack_wait(),
                    max_deliver: config.max_deliver,
                    filter_subject: config.subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        tracing::info!(
            "Consuming from stream '{}' with consumer '{}'",
            config.stream_name,
            config.consumer_name
        );

        Ok(Self {
            consumer,
            fetch_wait: config.fetch_wait(),
            receive_errors: Arc::new(AtomicU64::new(0)),
        })
    }
}

#[async_trait]
impl QueueClient for JetStreamQueue {
    async fn fetch_batch(&self, max_messages: usize) -> Result<Vec<RawMessage>, QueueError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(self.fetch_wait)
            .messages()
            .await
            .map_err(|e| QueueError::Fetch(e.to_string()))?;

        let mut batch = Vec::new();
        while let Some(msg) = messages.next().await {
            match msg {
                Ok(msg) => batch.push(into_raw_message(msg)),
                Err(e) => {
                    self.receive_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Error receiving message from batch");
                }
            }
        }

        Ok(batch)
    }

    fn take_receive_errors(&self) -> u64 {
        self.receive_errors.swap(0, Ordering::Relaxed)
    }
}

fn into_raw_message(message: jetstream::Message) -> RawMessage {
    let mut attributes = HashMap::new();
    let mut fallback_id = None;

    if let Ok(info) = message.info() {
        attributes.insert(APPROXIMATE_RECEIVE_COUNT.to_string(), info.delivered.to_string());
        attributes.insert(STREAM_SEQUENCE.to_string(), info.stream_sequence.to_string());
        fallback_id = Some(format!("{}-{}", info.stream, info.stream_sequence));
    }

    let header_id = message
        .headers
        .as_ref()
        .and_then(|headers| headers.get(NATS_MESSAGE_ID))
        .map(|value| value.as_str().to_string());

    let id = header_id
        .or(fallback_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    RawMessage {
        body: String::from_utf8_lossy(&message.payload).into_owned(),
        attributes,
        handle: Box::new(JetStreamHandle {
            message_id: id.clone(),
            message,
        }),
        id,
    }
}

/// Ack handle for one JetStream delivery
pub struct JetStreamHandle {
    message_id: String,
    message: jetstream::Message,
}

impl std::fmt::Debug for JetStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JetStreamHandle")
            .field("message_id", &self.message_id)
            .field("subject", &self.message.subject)
            .finish()
    }
}

#[async_trait]
impl Acknowledgeable for JetStreamHandle {
    async fn delete(&self) -> Result<DeleteOutcome, QueueError> {
        // Wait for the server to confirm; a plain ack may be lost silently
        self.message
            .double_ack()
            .await
            .map_err(|e| QueueError::Delete {
                message_id: self.message_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(DeleteOutcome::Deleted)
    }
}

/// Publishes message bodies into the stream the source consumes
#[derive(Clone)]
pub struct JetStreamPublisher {
    jetstream: jetstream::Context,
}

impl JetStreamPublisher {
    pub async fn connect(config: &NatsConfig) -> Result<Self, QueueError> {
        let (jetstream, _stream) = connect_stream(config).await?;
        Ok(Self { jetstream })
    }

    /// Publish `body` to `subject` with `message_id` as the JetStream dedup id
    pub async fn publish(
        &self,
        subject: &str,
        message_id: &str,
        body: &str,
    ) -> Result<(), QueueError> {
        let mut headers = HeaderMap::new();
        headers.insert(NATS_MESSAGE_ID, message_id);

        // Publish with JetStream (durable, acknowledged)
        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, body.to_string().into())
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;

        // Wait for acknowledgment
        ack.await.map_err(|e| QueueError::Publish(e.to_string()))?;

        tracing::debug!(message_id, subject, "Published message to JetStream");
        Ok(())
    }
}
