//! Cancellable one-shot timers that report back through the director's channel.
//!
//! A timer never calls into a component directly. When it expires it sends a
//! [`TimerFired`] message; the owning component compares the message against
//! the [`TimerHandle`] it still holds and ignores anything stale. Cancelling a
//! handle (explicitly or by dropping it) stops the sleep, and the generation
//! check covers the window where the message was already queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Timer categories. At most one live timer per category per owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Quiet period after the avatar stopped speaking.
    Debounce,
    /// Grace period before the session is torn down.
    Countdown,
    /// Delay between teardown and the ending presentation.
    Settle,
    /// Re-check of a disconnect deferred while the avatar was speaking.
    DisconnectRecheck,
}

/// Message delivered when a timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Factory for timers that all report into the same channel.
#[derive(Clone)]
pub struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    next_generation: Arc<AtomicU64>,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a timer factory together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Arm a one-shot timer. Must be called from within a tokio runtime.
    pub fn arm(&self, kind: TimerKind, delay: Duration) -> TimerHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let tx = self.tx.clone();
        let deadline = tokio::time::Instant::now() + delay;
        tokio::spawn(async move {
            tokio::select! {
                () = task_cancel.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {
                    let _ = tx.send(TimerFired { kind, generation });
                }
            }
        });
        TimerHandle {
            kind,
            generation,
            cancel,
        }
    }
}

/// Ownership of one armed timer. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    kind: TimerKind,
    generation: u64,
    cancel: CancellationToken,
}

impl TimerHandle {
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// Whether `fired` was produced by this handle's timer.
    pub fn matches(&self, fired: &TimerFired) -> bool {
        fired.kind == self.kind && fired.generation == self.generation
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Take the handle out of `slot` if `fired` belongs to it.
///
/// Returns `true` when the fire is current. The slot is only emptied on a match.
pub fn claim(slot: &mut Option<TimerHandle>, fired: &TimerFired) -> bool {
    if slot.as_ref().is_some_and(|h| h.matches(fired)) {
        slot.take();
        true
    } else {
        false
    }
}
