//! Stream lifecycle tracking and the idle-disconnect decision.
//!
//! ```text
//!            opened                 opened
//!   Idle ─────────────► Active(1) ◄────────── PendingIdle
//!                        │    ▲                   ▲   │
//!                opened  │    │ closed (n>1)      │   │ deferred check
//!                        ▼    │                   │   │ (same generation)
//!                      Active(n) ── closed (n=1) ─┘   ▼
//!                                                    Idle → disconnect
//! ```
//!
//! The deferred check runs in its own task after one scheduling turn (or a
//! configured grace period), so a stream reopened right after the last one
//! closed keeps the peer alive.
//!
//! Streams are tracked by multiplexer slot id. Recording the same open twice
//! is a no-op, so the application path can register a stream synchronously
//! while the matching multiplexer event is still queued.

use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Tracker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// No streams have been open since the last idle decision
    Idle,
    /// `n` streams are open
    Active(usize),
    /// The last stream closed; an idle check is pending
    PendingIdle,
}

/// Counts live application streams for one peer
#[derive(Debug)]
pub struct StreamTracker {
    state: TrackerState,
    live: HashSet<u64>,
    generation: u64,
    pending: Option<AbortHandle>,
}

impl Default for StreamTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTracker {
    /// Create an idle tracker
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: TrackerState::Idle,
            live: HashSet::new(),
            generation: 0,
            pending: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Number of open streams
    #[must_use]
    pub fn count(&self) -> usize {
        self.live.len()
    }

    /// Record that stream `id` opened, cancelling any pending idle check
    pub fn on_opened(&mut self, id: u64) {
        if !self.live.insert(id) {
            return;
        }
        self.cancel_pending();
        self.state = TrackerState::Active(self.live.len());
    }

    /// Record that stream `id` closed.
    ///
    /// Returns the generation of the idle check to schedule when the last
    /// stream closed.
    pub fn on_closed(&mut self, id: u64) -> Option<u64> {
        if !self.live.remove(&id) {
            tracing::warn!("Close for untracked stream {}, ignoring", id);
            return None;
        }
        if self.live.is_empty() {
            self.state = TrackerState::PendingIdle;
            self.generation += 1;
            Some(self.generation)
        } else {
            self.state = TrackerState::Active(self.live.len());
            None
        }
    }

    /// Hold the handle of the scheduled idle check
    pub fn arm(&mut self, handle: AbortHandle) {
        self.cancel_pending();
        self.pending = Some(handle);
    }

    /// Resolve a deferred check; true means the peer is idle and should close
    pub fn on_deferred(&mut self, generation: u64) -> bool {
        if self.state == TrackerState::PendingIdle && generation == self.generation {
            self.state = TrackerState::Idle;
            self.pending = None;
            true
        } else {
            false
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for StreamTracker {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

/// Spawn the deferred idle check for `generation`.
///
/// The task waits one scheduling turn when `grace` is zero, otherwise it
/// sleeps for `grace`, then reports `generation` on `notify`.
pub fn spawn_idle_check(
    generation: u64,
    grace: Duration,
    notify: mpsc::UnboundedSender<u64>,
) -> AbortHandle {
    tokio::spawn(async move {
        if grace.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(grace).await;
        }
        let _ = notify.send(generation);
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_opens_and_closes() {
        let mut tracker = StreamTracker::new();
        tracker.on_opened(1);
        tracker.on_opened(2);
        assert_eq!(tracker.state(), TrackerState::Active(2));
        assert_eq!(tracker.on_closed(1), None);
        assert_eq!(tracker.count(), 1);
        assert_eq!(tracker.on_closed(2), Some(1));
        assert_eq!(tracker.state(), TrackerState::PendingIdle);
        assert!(tracker.on_deferred(1));
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[test]
    fn test_duplicate_open_counted_once() {
        let mut tracker = StreamTracker::new();
        tracker.on_opened(4);
        tracker.on_opened(4);
        assert_eq!(tracker.count(), 1);
        assert_eq!(tracker.on_closed(4), Some(1));
    }

    #[test]
    fn test_registered_open_survives_queued_close() {
        // Stream 1 closed and stream 2 was registered before the close of
        // stream 1 was processed
        let mut tracker = StreamTracker::new();
        tracker.on_opened(1);
        tracker.on_opened(2);
        assert_eq!(tracker.on_closed(1), None);
        tracker.on_opened(2);
        assert_eq!(tracker.state(), TrackerState::Active(1));
    }

    #[test]
    fn test_reopen_cancels_idle() {
        let mut tracker = StreamTracker::new();
        tracker.on_opened(1);
        let generation = tracker.on_closed(1).unwrap();
        tracker.on_opened(2);
        assert!(!tracker.on_deferred(generation));
        assert_eq!(tracker.state(), TrackerState::Active(1));
    }

    #[test]
    fn test_stale_generation_ignored() {
        let mut tracker = StreamTracker::new();
        tracker.on_opened(1);
        let first = tracker.on_closed(1).unwrap();
        tracker.on_opened(2);
        let second = tracker.on_closed(2).unwrap();
        assert_ne!(first, second);
        assert!(!tracker.on_deferred(first));
        assert!(tracker.on_deferred(second));
    }

    #[test]
    fn test_untracked_close_ignored() {
        let mut tracker = StreamTracker::new();
        assert_eq!(tracker.on_closed(9), None);
        assert_eq!(tracker.state(), TrackerState::Idle);

        tracker.on_opened(1);
        assert_eq!(tracker.on_closed(9), None);
        assert_eq!(tracker.state(), TrackerState::Active(1));
    }

    #[tokio::test]
    async fn test_idle_check_reports_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_idle_check(7, Duration::ZERO, tx);
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_reopen_aborts_scheduled_check() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = StreamTracker::new();
        tracker.on_opened(1);
        let generation = tracker.on_closed(1).unwrap();
        tracker.arm(spawn_idle_check(generation, Duration::from_millis(50), tx));
        tracker.on_opened(2);

        // The aborted task dropped its sender without reporting
        assert_eq!(rx.recv().await, None);
    }
}
