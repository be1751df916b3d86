//! Consume loop and acknowledgment entrypoint.
//!
//! One background task polls the queue, decodes and records each message,
//! and pushes a [`DomainEvent`] onto a bounded [`EventStream`]. Downstream
//! tasks hand each event back through [`EventSource::processed`], which
//! deletes the queue message. The loop does not poll again until every event
//! of the previous batch has been handed back (or dropped). A batch already
//! fetched when [`EventSource::close`] is called is still dispatched in full;
//! only a send to a full stream gives way to the close request.
//!
//! A reader that keeps an event forever without acknowledging or dropping it
//! blocks the next poll and [`EventSource::close`]; set
//! `consumer.drain_timeout_secs` to bound the latter.

use futures::Stream;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::config::{ConsumerConfig, PersistPolicy};
use crate::decoder::{self, DecodedPayload};
use crate::error::{SourceError, SourceResult};
use crate::in_flight::{InFlightPermit, InFlightTracker};
use crate::queue::{Acknowledgeable, DeleteOutcome, QueueClient, RawMessage};
use crate::store::{EventRecord, EventStore};

/// Lifecycle state of an [`EventSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Running,
    /// Close requested; waiting for in-flight events
    Draining,
    Closed,
}

/// Unit of work handed to downstream consumers.
///
/// Must be passed back to [`EventSource::processed`] once handled. Dropping
/// it instead releases its in-flight slot without deleting the message, which
/// the queue will then redeliver.
#[derive(Debug)]
pub struct DomainEvent {
    pub id: String,
    /// Receive count reported by the queue, `"0"` when unknown
    pub retry: String,
    pub payload: DecodedPayload,
    handle: Box<dyn Acknowledgeable>,
    span: Span,
    permit: InFlightPermit,
}

impl DomainEvent {
    /// Logging context for work done on behalf of this event
    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Output stream of a source, shareable between reader tasks
#[derive(Debug, Clone)]
pub struct EventStream {
    rx: Arc<Mutex<mpsc::Receiver<DomainEvent>>>,
}

impl EventStream {
    fn new(rx: mpsc::Receiver<DomainEvent>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next event, or `None` once the source is closed and the stream drained
    pub async fn recv(&self) -> Option<DomainEvent> {
        self.rx.lock().await.recv().await
    }

    /// Adapt into a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = DomainEvent> {
        futures::stream::unfold(self, |stream| async move {
            stream.recv().await.map(|event| (event, stream))
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    polls: AtomicU64,
    poll_failures: AtomicU64,
    received: AtomicU64,
    decode_failures: AtomicU64,
    persist_failures: AtomicU64,
    emitted: AtomicU64,
    acknowledged: AtomicU64,
    delete_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time view of a source's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStats {
    pub state: SourceState,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub polls: u64,
    pub poll_failures: u64,
    pub received: u64,
    pub decode_failures: u64,
    pub persist_failures: u64,
    pub emitted: u64,
    pub acknowledged: u64,
    pub delete_failures: u64,
}

enum Dispatch {
    Emitted,
    Skipped,
    Cancelled,
    StreamClosed,
}

struct Inner {
    queue: Arc<dyn QueueClient>,
    store: Arc<dyn EventStore>,
    config: ConsumerConfig,
    tracker: Arc<InFlightTracker>,
    cancel: CancellationToken,
    state: watch::Sender<SourceState>,
    started: AtomicBool,
    counters: Counters,
}

/// Queue-backed source of [`DomainEvent`]s
#[derive(Clone)]
pub struct EventSource {
    inner: Arc<Inner>,
}

impl EventSource {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        store: Arc<dyn EventStore>,
        config: ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(SourceState::Running);
        Self {
            inner: Arc::new(Inner {
                queue,
                store,
                config,
                tracker: Arc::new(InFlightTracker::new()),
                cancel: CancellationToken::new(),
                state,
                started: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Start the consume loop and return its output stream.
    ///
    /// Must be called from within a Tokio runtime. Only the first call
    /// starts a loop; later calls fail with [`SourceError::AlreadyConsuming`].
    pub fn consume(&self) -> SourceResult<EventStream> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(SourceError::AlreadyConsuming);
        }

        let capacity = self.inner.config.max_messages.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        if self.inner.cancel.is_cancelled() {
            // Closed before it ever ran: hand back an already finished stream
            drop(tx);
            self.inner.set_state(SourceState::Closed);
        } else {
            tokio::spawn(Arc::clone(&self.inner).run(tx));
        }

        Ok(EventStream::new(rx))
    }

    /// Acknowledge a processed event.
    ///
    /// Deletes the originating queue message and releases the event's
    /// in-flight slot. The slot is released on every path, including a
    /// failed delete, in which case the error is returned and the message
    /// will be redelivered.
    pub async fn processed(&self, event: DomainEvent) -> SourceResult<()> {
        let DomainEvent {
            id,
            handle,
            span,
            permit,
            ..
        } = event;

        let outcome = match handle.delete().instrument(span.clone()).await {
            Ok(DeleteOutcome::Deleted) => {
                bump(&self.inner.counters.acknowledged);
                tracing::info!(parent: &span, "Successfully deleted queue message");
                Ok(())
            }
            Ok(DeleteOutcome::NotSupported) => {
                bump(&self.inner.counters.acknowledged);
                let err = SourceError::TypeMismatch(id);
                tracing::warn!(parent: &span, error = %err, "Event is not backed by a deletable queue message");
                Ok(())
            }
            Err(e) => {
                bump(&self.inner.counters.delete_failures);
                tracing::error!(parent: &span, error = %e, "Error deleting queue message");
                Err(SourceError::Delete(e))
            }
        };

        permit.release();
        outcome
    }

    /// Stop polling and wait for every in-flight event to be acknowledged.
    ///
    /// Returns once the output stream has been closed. Calling it again
    /// after that is a no-op.
    pub async fn close(&self) -> SourceResult<()> {
        if self.state() == SourceState::Closed {
            tracing::debug!("Event source already closed");
            return Ok(());
        }

        tracing::info!(in_flight = self.in_flight(), "Closing event source");
        self.inner.cancel.cancel();
        self.inner.state.send_if_modified(|state| {
            if *state == SourceState::Running {
                *state = SourceState::Draining;
                true
            } else {
                false
            }
        });

        if !self.inner.started.load(Ordering::Acquire) {
            self.inner.set_state(SourceState::Closed);
            return Ok(());
        }

        let mut state = self.inner.state.subscribe();
        let closed = async move {
            // The sender lives in `inner`, so this only ends on Closed
            let _ = state.wait_for(|s| *s == SourceState::Closed).await;
        };

        match self.inner.config.drain_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, closed).await.map_err(|_| {
                tracing::warn!(
                    in_flight = self.in_flight(),
                    "Drain timed out; unacknowledged messages will be redelivered"
                );
                SourceError::DrainTimeout(timeout)
            })?,
            None => closed.await,
        }

        tracing::info!("Event source closed");
        Ok(())
    }

    pub fn state(&self) -> SourceState {
        *self.inner.state.borrow()
    }

    /// Events emitted and not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.count()
    }

    /// Highest in-flight count of the current (or last) batch
    pub fn peak_in_flight(&self) -> usize {
        self.inner.tracker.peak()
    }

    pub fn stats(&self) -> SourceStats {
        let c = &self.inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        SourceStats {
            state: self.state(),
            in_flight: self.in_flight(),
            peak_in_flight: self.peak_in_flight(),
            polls: load(&c.polls),
            poll_failures: load(&c.poll_failures),
            received: load(&c.received),
            decode_failures: load(&c.decode_failures),
            persist_failures: load(&c.persist_failures),
            emitted: load(&c.emitted),
            acknowledged: load(&c.acknowledged),
            delete_failures: load(&c.delete_failures),
        }
    }
}

impl Inner {
    fn set_state(&self, next: SourceState) {
        self.state.send_replace(next);
    }

    async fn run(self: Arc<Self>, tx: mpsc::Sender<DomainEvent>) {
        tracing::info!(max_messages = self.config.max_messages, "Starting consume loop");

        'poll: while !self.cancel.is_cancelled() {
            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                fetched = self.queue.fetch_batch(self.config.max_messages) => fetched,
            };
            bump(&self.counters.polls);

            let messages = match fetched {
                Ok(messages) => {
                    let dropped = self.queue.take_receive_errors();
                    if dropped > 0 {
                        self.counters.poll_failures.fetch_add(dropped, Ordering::Relaxed);
                        tracing::warn!(dropped, "Queue dropped unreadable items from the batch");
                    }
                    messages
                }
                Err(e) => {
                    bump(&self.counters.poll_failures);
                    let err = SourceError::Poll(e);
                    tracing::error!(error = %err, "Error getting messages from queue");
                    self.idle().await;
                    continue;
                }
            };

            if messages.is_empty() {
                tracing::debug!("No messages found in queue");
                self.idle().await;
                continue;
            }

            tracing::debug!(count = messages.len(), "Received message batch");
            self.tracker.reset_peak();

            // A close request stops the next poll, not this batch
            for message in messages {
                match self.dispatch(message, &tx).await {
                    Dispatch::Emitted | Dispatch::Skipped | Dispatch::Cancelled => {}
                    Dispatch::StreamClosed => {
                        tracing::warn!("All event stream readers are gone, stopping consume loop");
                        break 'poll;
                    }
                }
            }

            // Batch drain
            self.tracker.wait_until_zero().await;
        }

        self.state.send_if_modified(|state| {
            if *state == SourceState::Running {
                *state = SourceState::Draining;
                true
            } else {
                false
            }
        });
        self.tracker.wait_until_zero().await;

        drop(tx);
        self.set_state(SourceState::Closed);
        tracing::info!("Consume loop stopped");
    }

    /// Decode, record and emit one message
    async fn dispatch(&self, message: RawMessage, tx: &mpsc::Sender<DomainEvent>) -> Dispatch {
        bump(&self.counters.received);

        let payload = match decoder::decode(&message.body) {
            Ok(payload) => payload,
            Err(source) => {
                bump(&self.counters.decode_failures);
                let err = SourceError::Decode {
                    message_id: message.id.clone(),
                    source,
                };
                tracing::warn!(error = %err, "Error decoding queue message, leaving it for redelivery");
                return Dispatch::Skipped;
            }
        };

        let retry = message.retry_count();
        let span = tracing::info_span!("event", message_id = %message.id, retry = %retry);
        tracing::info!(parent: &span, "Start to process queued event");

        let record = EventRecord::new(message.id.clone(), payload.message.clone());
        if let Err(source) = self.store.upsert(&record).instrument(span.clone()).await {
            bump(&self.counters.persist_failures);
            let err = SourceError::Persist {
                message_id: message.id.clone(),
                source,
            };
            match self.config.persist_policy {
                PersistPolicy::BestEffort => {
                    tracing::error!(parent: &span, error = %err, "Failed to record event, dispatching anyway");
                }
                PersistPolicy::Required => {
                    tracing::error!(parent: &span, error = %err, "Failed to record event, leaving it for redelivery");
                    return Dispatch::Skipped;
                }
            }
        }

        let RawMessage { id, handle, .. } = message;
        let event = DomainEvent {
            id,
            retry,
            payload,
            handle,
            span: span.clone(),
            permit: self.tracker.increment(),
        };

        tokio::select! {
            biased;
            sent = tx.send(event) => match sent {
                Ok(()) => {
                    bump(&self.counters.emitted);
                    tracing::info!(parent: &span, in_flight = self.tracker.count(), "Event produced");
                    Dispatch::Emitted
                }
                // Dropping the returned event releases its slot
                Err(_) => Dispatch::StreamClosed,
            },
            _ = self.cancel.cancelled() => {
                tracing::debug!(parent: &span, "Close requested while the stream was full");
                Dispatch::Cancelled
            }
        }
    }

    async fn idle(&self) {
        if let Some(backoff) = self.config.idle_backoff() {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryEventStore;
    use std::time::Duration;

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            max_messages: 5,
            idle_backoff_ms: 5,
            ..Default::default()
        }
    }

    fn source(queue: &MemoryQueue, store: &MemoryEventStore, config: ConsumerConfig) -> EventSource {
        EventSource::new(Arc::new(queue.clone()), Arc::new(store.clone()), config)
    }

    async fn next(stream: &EventStream) -> DomainEvent {
        tokio::time::timeout(Duration::from_secs(2), stream.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn test_consume_twice_fails() {
        let source = source(&MemoryQueue::new(), &MemoryEventStore::new(), config());
        let _stream = source.consume().unwrap();
        assert!(matches!(source.consume(), Err(SourceError::AlreadyConsuming)));
        source.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_consume() {
        let source = source(&MemoryQueue::new(), &MemoryEventStore::new(), config());
        source.close().await.unwrap();
        assert_eq!(source.state(), SourceState::Closed);

        let stream = source.consume().unwrap();
        assert!(stream.recv().await.is_none());
        source.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_fields() {
        let queue = MemoryQueue::new();
        queue.push("m-1", r#"{"message": "hello", "kind": "upload"}"#);
        let source = source(&queue, &MemoryEventStore::new(), config());

        let stream = source.consume().unwrap();
        let event = next(&stream).await;
        assert_eq!(event.id, "m-1");
        assert_eq!(event.retry, "1");
        assert_eq!(event.payload.message, "hello");
        assert_eq!(event.payload.get("kind"), Some(&serde_json::json!("upload")));

        source.processed(event).await.unwrap();
        source.close().await.unwrap();
        assert_eq!(queue.deleted(), vec!["m-1".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_event_releases_slot() {
        let queue = MemoryQueue::new();
        queue.push("m-1", "{}");
        let source = source(&queue, &MemoryEventStore::new(), config());

        let stream = source.consume().unwrap();
        let event = next(&stream).await;
        assert_eq!(source.in_flight(), 1);

        drop(event);
        assert_eq!(source.in_flight(), 0);
        source.close().await.unwrap();
        assert!(queue.deleted().is_empty());
        assert_eq!(queue.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let queue = MemoryQueue::new();
        queue.push("m-0", "garbage");
        queue.push("m-1", "{}");
        let source = source(&queue, &MemoryEventStore::new(), config());

        let stream = source.consume().unwrap();
        let event = next(&stream).await;
        source.processed(event).await.unwrap();
        source.close().await.unwrap();

        let stats = source.stats();
        assert_eq!(stats.state, SourceState::Closed);
        assert_eq!(stats.received, 2);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.in_flight, 0);
        assert!(stats.polls >= 1);
    }
}
