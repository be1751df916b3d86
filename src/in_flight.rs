//! In-flight event accounting.
//!
//! Every emitted event holds one [`InFlightPermit`]. The consume loop waits for
//! the count to return to zero before polling again, and shutdown waits for
//! the same condition.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Counter of dispatched-but-unacknowledged events
#[derive(Debug, Default)]
pub struct InFlightTracker {
    count: AtomicUsize,
    peak: AtomicUsize,
    zero: Notify,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one in-flight unit.
    ///
    /// The returned permit releases the unit exactly once, when it is
    /// dropped or explicitly released.
    pub fn increment(self: &Arc<Self>) -> InFlightPermit {
        let now = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        InFlightPermit {
            tracker: Some(Arc::clone(self)),
        }
    }

    /// Release one in-flight unit.
    ///
    /// Returns `false` (and leaves the count at zero) when there is nothing
    /// to release.
    fn release(&self) -> bool {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => {
                self.zero.notify_waiters();
                true
            }
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("In-flight release without a matching increment");
                false
            }
        }
    }

    /// Current number of in-flight units
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Highest count observed since the last [`reset_peak`](Self::reset_peak)
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn reset_peak(&self) {
        self.peak.store(self.count(), Ordering::Release);
    }

    /// Wait until every in-flight unit has been released
    pub async fn wait_until_zero(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait_until_zero`](Self::wait_until_zero) but gives up after `timeout`.
    ///
    /// Returns `true` if the count reached zero in time.
    pub async fn wait_until_zero_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_until_zero())
            .await
            .is_ok()
    }
}

/// Ownership of one in-flight unit
#[derive(Debug)]
pub struct InFlightPermit {
    tracker: Option<Arc<InFlightTracker>>,
}

impl InFlightPermit {
    /// Release the unit now instead of on drop
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.release();
        }
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}
