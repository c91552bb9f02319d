use prometheus::{IntCounter, IntGauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Count of faults in effect across every request sharing a filter config.
///
/// The counter is only reachable through [`ActiveFaultTracker::try_activate`],
/// which hands out an [`ActiveFault`] slot; dropping the slot releases it.
#[derive(Debug)]
pub struct ActiveFaultTracker {
    active: AtomicU64,
    overflow: AtomicU64,
    active_gauge: IntGauge,
    overflow_counter: IntCounter,
}

impl ActiveFaultTracker {
    pub fn new(active_gauge: IntGauge, overflow_counter: IntCounter) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
            active_gauge,
            overflow_counter,
        })
    }

    /// Reserve a slot unless `max_active` slots are already held.
    ///
    /// Returns `None` and counts an overflow when the cap is reached.
    pub fn try_activate(self: &Arc<Self>, max_active: Option<u64>) -> Option<ActiveFault> {
        let limit = max_active.unwrap_or(u64::MAX);
        let reserved = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            });

        match reserved {
            Ok(previous) => {
                self.active_gauge.inc();
                debug!(active = previous + 1, "active fault slot reserved");
                Some(ActiveFault {
                    tracker: Arc::clone(self),
                })
            }
            Err(current) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                self.overflow_counter.inc();
                debug!(active = current, limit, "fault dropped for overflow");
                None
            }
        }
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    fn release(&self) {
        let released = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
        if released.is_ok() {
            self.active_gauge.dec();
        }
    }
}

/// A held active-fault slot. Released exactly once, on drop.
#[derive(Debug)]
pub struct ActiveFault {
    tracker: Arc<ActiveFaultTracker>,
}

impl Drop for ActiveFault {
    fn drop(&mut self) {
        self.tracker.release();
    }
}
