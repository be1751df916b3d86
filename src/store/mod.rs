//! Event record persistence.
//!
//! Records are keyed by message id and written with upsert semantics, so a
//! redelivered message overwrites its earlier row instead of adding one.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use memory::MemoryEventStore;
pub use sql::DieselEventStore;

/// Audit row for one received message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Message id, the upsert key
    pub id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Durable upsert-by-id store
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert the record, or overwrite every column of the existing row
    /// with the same id.
    async fn upsert(&self, record: &EventRecord) -> Result<(), StoreError>;
}
