//! Error types for the event source.
//!
//! Each collaborator has its own error type; [`SourceError`] aggregates them
//! for the public entrypoints. None of these are fatal to the consume loop.

use std::time::Duration;
use thiserror::Error;

/// Result type for event source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors raised by a queue transport
#[derive(Error, Debug)]
pub enum QueueError {
    /// Queue unreachable, throttled, or the fetch request failed
    #[error("Failed to fetch messages: {0}")]
    Fetch(String),

    /// The transport refused or failed to delete a message
    #[error("Failed to delete message {message_id}: {reason}")]
    Delete { message_id: String, reason: String },

    /// Connection or stream/consumer setup failed
    #[error("Queue connection error: {0}")]
    Connection(String),

    /// Publishing a message failed
    #[error("Failed to publish message: {0}")]
    Publish(String),
}

/// Errors raised by an event record store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Blocking task panicked or was cancelled
    #[error("Store task failed: {0}")]
    Task(String),

    /// Store rejected the write (used by in-memory and test stores)
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Message body could not be decoded into a payload
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a JSON object, found {0}")]
    NotAnObject(&'static str),
}

/// Configuration could not be loaded or is invalid
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Aggregated error type returned by [`crate::EventSource`]
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Poll error: {0}")]
    Poll(#[source] QueueError),

    #[error("Decode error for message {message_id}: {source}")]
    Decode {
        message_id: String,
        #[source]
        source: DecodeError,
    },

    #[error("Persist error for message {message_id}: {source}")]
    Persist {
        message_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Delete error: {0}")]
    Delete(#[source] QueueError),

    /// The back-reference cannot delete its message
    #[error("Message {0} has no deletable back-reference")]
    TypeMismatch(String),

    #[error("Timed out after {0:?} waiting for in-flight events to drain")]
    DrainTimeout(Duration),

    #[error("consume() has already been called on this source")]
    AlreadyConsuming,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SourceError {
    /// Whether the affected message will be redelivered by the queue.
    ///
    /// `Persist` answers `false`: under the default best-effort policy the
    /// event is still dispatched and deleted once acknowledged.
    pub fn is_redelivered(&self) -> bool {
        matches!(self, SourceError::Decode { .. } | SourceError::Delete(_))
    }
}
