//! # event-source: queue-backed event stream
//!
//! Pulls batches of messages from a queue, records each one for audit and
//! dedup, hands them downstream as [`DomainEvent`]s, and removes a message
//! from the queue only after downstream code acknowledges it.
//!
//! ## Flow
//!
//! ```text
//! queue ──fetch_batch──▶ decode ──▶ upsert record ──▶ EventStream ──▶ downstream
//!   ▲                                                                  │
//!   └──────────────── delete ◀── EventSource::processed(event) ◀──────┘
//! ```
//!
//! Delivery is at-least-once: a message whose acknowledgment fails (or that
//! is never acknowledged) is redelivered by the queue.
//!
//! ## Example
//!
//! ```ignore
//! use event_source::{EventSource, MemoryQueue, MemoryEventStore, ConsumerConfig};
//! use std::sync::Arc;
//!
//! let queue = MemoryQueue::new();
//! queue.push("m-1", r#"{"message": "hello"}"#);
//!
//! let source = EventSource::new(
//!     Arc::new(queue),
//!     Arc::new(MemoryEventStore::new()),
//!     ConsumerConfig::default(),
//! );
//! let stream = source.consume()?;
//! while let Some(event) = stream.recv().await {
//!     // business logic
//!     source.processed(event).await?;
//! }
//! ```

pub mod config;
pub mod decoder;
pub mod error;
pub mod in_flight;
pub mod queue;
pub mod source;
pub mod store;

// HTTP status endpoints
pub mod http;

// Re-export key types
pub use config::{ConsumerConfig, DatabaseConfig, NatsConfig, PersistPolicy, SourceConfig};
pub use decoder::{decode, DecodedPayload};
pub use error::{ConfigError, DecodeError, QueueError, SourceError, SourceResult, StoreError};
pub use in_flight::{InFlightPermit, InFlightTracker};
pub use queue::{
    Acknowledgeable, DeleteOutcome, JetStreamPublisher, JetStreamQueue, MemoryQueue, QueueClient,
    RawMessage, APPROXIMATE_RECEIVE_COUNT,
};
pub use source::{DomainEvent, EventSource, EventStream, SourceState, SourceStats};
pub use store::{DieselEventStore, EventRecord, EventStore, MemoryEventStore};
