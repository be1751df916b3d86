//! In-memory event store for local runs and tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{EventRecord, EventStore};
use crate::error::StoreError;

/// Writes kept by [`MemoryEventStore::write_log`] unless configured otherwise
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

#[derive(Debug)]
struct StoreState {
    records: HashMap<String, EventRecord>,
    writes: VecDeque<String>,
    log_capacity: usize,
    fail_writes: usize,
}

/// [`EventStore`] keeping records in a map
#[derive(Debug, Clone)]
pub struct MemoryEventStore {
    state: Arc<Mutex<StoreState>>,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                records: HashMap::new(),
                writes: VecDeque::new(),
                log_capacity: DEFAULT_LOG_CAPACITY,
                fail_writes: 0,
            })),
        }
    }

    /// Keep at most `capacity` entries in the write log
    pub fn with_log_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.lock();
            state.log_capacity = capacity;
            let excess = state.writes.len().saturating_sub(capacity);
            state.writes.drain(..excess);
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: &str) -> Option<EventRecord> {
        self.lock().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the most recent successful writes, oldest first (repeats included)
    pub fn write_log(&self) -> Vec<String> {
        self.lock().writes.iter().cloned().collect()
    }

    /// Fail the next `n` upserts
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().fail_writes = n;
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert(&self, record: &EventRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(StoreError::Unavailable("memory store rejected write".to_string()));
        }
        state.records.insert(record.id.clone(), record.clone());
        if state.writes.len() >= state.log_capacity {
            state.writes.pop_front();
        }
        if state.log_capacity > 0 {
            state.writes.push_back(record.id.clone());
        }
        Ok(())
    }
}
