//! In-process queue with visibility-timeout semantics
//!
//! Messages handed out by [`MemoryQueue::fetch_batch`] stay invisible until
//! they are deleted through their handle or [`MemoryQueue::redeliver_unacked`]
//! makes them visible again. Used by `event-source run --queue memory` and
//! by the test suite.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Acknowledgeable, DeleteOutcome, QueueClient, RawMessage, APPROXIMATE_RECEIVE_COUNT};
use crate::error::QueueError;

/// Deleted ids kept by [`MemoryQueue::deleted`] unless configured otherwise
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: String,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    invisible: HashMap<String, StoredMessage>,
    deleted: VecDeque<String>,
    log_capacity: usize,
    fail_fetches: usize,
    fail_deletes: usize,
    report_receive_count: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    fetches: AtomicUsize,
    next_receipt: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // State stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory [`QueueClient`]
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let queue = Self {
            shared: Arc::new(Shared::default()),
        };
        {
            let mut state = queue.shared.lock();
            state.report_receive_count = true;
            state.log_capacity = DEFAULT_LOG_CAPACITY;
        }
        queue
    }

    /// Keep at most `capacity` ids in the deletion log
    pub fn with_log_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.shared.lock();
            state.log_capacity = capacity;
            let excess = state.deleted.len().saturating_sub(capacity);
            state.deleted.drain(..excess);
        }
        self
    }

    /// Queue that never reports the receive-count attribute
    pub fn without_receive_count() -> Self {
        let queue = Self::new();
        queue.shared.lock().report_receive_count = false;
        queue
    }

    /// Enqueue a message with the given id and body
    pub fn push(&self, id: impl Into<String>, body: impl Into<String>) {
        self.push_with_receive_count(id, body, 0);
    }

    /// Enqueue a message that has already been received `receive_count` times
    pub fn push_with_receive_count(
        &self,
        id: impl Into<String>,
        body: impl Into<String>,
        receive_count: u32,
    ) {
        self.shared.lock().visible.push_back(StoredMessage {
            id: id.into(),
            body: body.into(),
            receive_count,
        });
    }

    /// Make every fetched-but-undeleted message visible again
    pub fn redeliver_unacked(&self) -> usize {
        let mut state = self.shared.lock();
        let mut pending: Vec<_> = state.invisible.drain().map(|(_, msg)| msg).collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        let count = pending.len();
        state.visible.extend(pending);
        count
    }

    /// Fail the next `n` fetches
    pub fn fail_next_fetches(&self, n: usize) {
        self.shared.lock().fail_fetches = n;
    }

    /// Fail the next `n` deletes
    pub fn fail_next_deletes(&self, n: usize) {
        self.shared.lock().fail_deletes = n;
    }

    /// Messages currently visible
    pub fn visible_len(&self) -> usize {
        self.shared.lock().visible.len()
    }

    /// Messages fetched and not yet deleted
    pub fn in_flight_len(&self) -> usize {
        self.shared.lock().invisible.len()
    }

    /// Most recently deleted ids, oldest first
    pub fn deleted(&self) -> Vec<String> {
        self.shared.lock().deleted.iter().cloned().collect()
    }

    /// Number of `fetch_batch` calls so far
    pub fn fetch_count(&self) -> usize {
        self.shared.fetches.load(Ordering::Acquire)
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn fetch_batch(&self, max_messages: usize) -> Result<Vec<RawMessage>, QueueError> {
        self.shared.fetches.fetch_add(1, Ordering::AcqRel);

        let mut state = self.shared.lock();
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(QueueError::Fetch("memory queue unavailable".to_string()));
        }

        let take = max_messages.min(state.visible.len());
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            let Some(mut stored) = state.visible.pop_front() else {
                break;
            };
            stored.receive_count += 1;

            let receipt = format!(
                "{}#{}",
                stored.id,
                self.shared.next_receipt.fetch_add(1, Ordering::AcqRel)
            );

            let mut attributes = HashMap::new();
            if state.report_receive_count {
                attributes.insert(
                    APPROXIMATE_RECEIVE_COUNT.to_string(),
                    stored.receive_count.to_string(),
                );
            }

            batch.push(RawMessage {
                id: stored.id.clone(),
                body: stored.body.clone(),
                attributes,
                handle: Box::new(MemoryHandle {
                    receipt: receipt.clone(),
                    shared: Arc::clone(&self.shared),
                }),
            });
            state.invisible.insert(receipt, stored);
        }

        Ok(batch)
    }
}

/// Receipt for one delivery of a [`MemoryQueue`] message
#[derive(Debug)]
pub struct MemoryHandle {
    receipt: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl Acknowledgeable for MemoryHandle {
    async fn delete(&self) -> Result<DeleteOutcome, QueueError> {
        let mut state = self.shared.lock();
        if state.fail_deletes > 0 {
            state.fail_deletes -= 1;
            return Err(QueueError::Delete {
                message_id: self.receipt.clone(),
                reason: "memory queue rejected delete".to_string(),
            });
        }

        match state.invisible.remove(&self.receipt) {
            Some(stored) => {
                if state.deleted.len() >= state.log_capacity {
                    state.deleted.pop_front();
                }
                if state.log_capacity > 0 {
                    state.deleted.push_back(stored.id);
                }
                Ok(DeleteOutcome::Deleted)
            }
            // Receipt expired: the message was redelivered under a new one
            None => Err(QueueError::Delete {
                message_id: self.receipt.clone(),
                reason: "receipt handle is no longer valid".to_string(),
            }),
        }
    }
}
