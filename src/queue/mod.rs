//! Queue transports
//!
//! A [`QueueClient`] fetches bounded batches of [`RawMessage`]s. Each message
//! carries its own deletion capability so acknowledgment never needs to know
//! which transport produced it.

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

use crate::error::QueueError;

pub use memory::MemoryQueue;
pub use nats::{JetStreamPublisher, JetStreamQueue};

/// Attribute holding how many times the message has been received
pub const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";

/// Result of asking a handle to delete its message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The handle has no way to remove the message from its queue
    NotSupported,
}

/// Capability to remove one received message from its queue
#[async_trait]
pub trait Acknowledgeable: Send + Sync + fmt::Debug {
    async fn delete(&self) -> Result<DeleteOutcome, QueueError>;
}

/// Message as fetched from the queue
#[derive(Debug)]
pub struct RawMessage {
    pub id: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
    pub handle: Box<dyn Acknowledgeable>,
}

impl RawMessage {
    /// Receive count as reported by the transport, `"0"` when unknown
    pub fn retry_count(&self) -> String {
        self.attributes
            .get(APPROXIMATE_RECEIVE_COUNT)
            .cloned()
            .unwrap_or_else(|| "0".to_string())
    }
}

/// Source of message batches
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Fetch up to `max_messages` pending messages.
    ///
    /// May block for a transport-defined long-poll period and return an
    /// empty batch.
    async fn fetch_batch(&self, max_messages: usize) -> Result<Vec<RawMessage>, QueueError>;

    /// Items dropped from fetched batches since the last call because they
    /// could not be received, reset on read
    fn take_receive_errors(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NoopHandle;

    #[async_trait]
    impl Acknowledgeable for NoopHandle {
        async fn delete(&self) -> Result<DeleteOutcome, QueueError> {
            Ok(DeleteOutcome::NotSupported)
        }
    }

    fn message(attributes: &[(&str, &str)]) -> RawMessage {
        RawMessage {
            id: "m-1".to_string(),
            body: "{}".to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            handle: Box::new(NoopHandle),
        }
    }

    #[test]
    fn test_retry_count_defaults_to_zero() {
        assert_eq!(message(&[]).retry_count(), "0");
        assert_eq!(message(&[("SentTimestamp", "1")]).retry_count(), "0");
    }

    #[test]
    fn test_retry_count_from_attribute() {
        assert_eq!(message(&[(APPROXIMATE_RECEIVE_COUNT, "4")]).retry_count(), "4");
    }
}
