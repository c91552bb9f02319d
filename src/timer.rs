//! Timer service used by the fault engine and the response rate limiter.
//!
//! Timers never call back into the filter directly. A fired timer produces a
//! [`TimerEvent`] which the stream's driver hands back to
//! [`FaultFilter::on_timer`](crate::fault::FaultFilter::on_timer). A timer
//! always fires asynchronously, even with a zero duration.

use crate::errors::{FaultError, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// One-shot fault delay
    Delay,
    /// Rate limiter token refill
    TokenRefill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub id: TimerId,
    pub kind: TimerKind,
}

pub trait TimerService: Send + Sync {
    /// Arm a one-shot timer firing `after` from now.
    fn schedule(&self, after: Duration, kind: TimerKind) -> Result<TimerHandle>;
}

/// Armed timer. Cancelling (explicitly or by drop) is idempotent.
pub struct TimerHandle {
    id: TimerId,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(id: TimerId, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            trace!(id = self.id.0, "timer cancelled");
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Timers backed by tokio sleeps, delivering events on a per-stream channel.
#[derive(Debug)]
pub struct TokioTimers {
    tx: mpsc::UnboundedSender<TimerEvent>,
    next_id: AtomicU64,
}

impl TokioTimers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_id: AtomicU64::new(0),
            },
            rx,
        )
    }
}

impl TimerService for TokioTimers {
    fn schedule(&self, after: Duration, kind: TimerKind) -> Result<TimerHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FaultError::TimerError(format!("no tokio runtime: {}", e)))?;
        if self.tx.is_closed() {
            return Err(FaultError::TimerError(
                "timer event receiver dropped".to_string(),
            ));
        }

        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tx = self.tx.clone();
        let event = TimerEvent { id, kind };
        let task = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            // The stream may be gone; nothing to deliver to then.
            let _ = tx.send(event);
        });
        let abort = task.abort_handle();

        trace!(id = id.0, ?kind, after_ms = after.as_millis() as u64, "timer armed");
        Ok(TimerHandle::new(id, move || abort.abort()))
    }
}

#[cfg(test)]
pub(crate) mod manual {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Inner {
        now: Duration,
        next_id: u64,
        pending: Vec<(Duration, TimerEvent)>,
        failing: bool,
    }

    /// Deterministic timer service driven by explicit clock advances.
    #[derive(Debug, Clone, Default)]
    pub struct ManualTimers {
        inner: Arc<Mutex<Inner>>,
    }

    impl ManualTimers {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn now(&self) -> Duration {
            self.inner.lock().unwrap().now
        }

        pub fn pending(&self) -> usize {
            self.inner.lock().unwrap().pending.len()
        }

        pub fn set_failing(&self, failing: bool) {
            self.inner.lock().unwrap().failing = failing;
        }

        /// Pop the earliest timer due at or before `until`, moving the clock
        /// to its deadline.
        pub fn next_due(&self, until: Duration) -> Option<TimerEvent> {
            let mut inner = self.inner.lock().unwrap();
            let (index, _) = inner
                .pending
                .iter()
                .enumerate()
                .filter(|(_, (deadline, _))| *deadline <= until)
                .min_by_key(|(_, (deadline, event))| (*deadline, event.id.0))?;
            let (deadline, event) = inner.pending.remove(index);
            inner.now = inner.now.max(deadline);
            Some(event)
        }

        /// Fire every timer due within `by`, including ones armed while
        /// handling earlier events, then set the clock to the end.
        pub fn advance(&self, by: Duration, mut on_event: impl FnMut(TimerEvent)) {
            let until = self.now() + by;
            while let Some(event) = self.next_due(until) {
                on_event(event);
            }
            self.inner.lock().unwrap().now = until;
        }
    }

    impl TimerService for ManualTimers {
        fn schedule(&self, after: Duration, kind: TimerKind) -> Result<TimerHandle> {
            let mut inner = self.inner.lock().unwrap();
            if inner.failing {
                return Err(FaultError::TimerError("manual timers failing".to_string()));
            }
            let id = TimerId(inner.next_id);
            inner.next_id += 1;
            let deadline = inner.now + after;
            inner.pending.push((deadline, TimerEvent { id, kind }));

            let shared = Arc::clone(&self.inner);
            Ok(TimerHandle::new(id, move || {
                shared
                    .lock()
                    .unwrap()
                    .pending
                    .retain(|(_, event)| event.id != id);
            }))
        }
    }
}
