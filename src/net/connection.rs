//! Per-connection identity and in-flight tracking.
//!
//! # Responsibilities
//! - Generate connection IDs for log correlation
//! - Report how each accepted connection ended (`Disposition`)
//! - Count connections still being served after `stop()` so shutdown can drain

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-process counter; forked workers each continue from the parent's value.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Terminal state of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Peer disconnected during TLS setup; closed without invoking the handler.
    ClosedBenign,
    /// Handler ran and returned normally.
    Done,
    /// Setup or handler failed; the failure was logged and suppressed.
    ErrorLogged,
}

/// Counts connections a handler is still serving.
///
/// Handlers call [`ConnectionTracker::track`] and hold the guard for as long
/// as they own the stream. Single-threaded: clones share one counter.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active: Rc<Cell<usize>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self) -> ConnectionGuard {
        self.active.set(self.active.get() + 1);
        ConnectionGuard {
            active: Rc::clone(&self.active),
            id: ConnectionId::next(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.get()
    }

    /// Wait until every guard is dropped or `grace` elapses.
    /// Returns the number of connections still open.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active.get() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.active.get()
    }
}

/// Decrements the tracker when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Rc<Cell<usize>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.set(self.active.get().saturating_sub(1));
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }

    #[test]
    fn tracker_counts_guards() {
        let tracker = ConnectionTracker::new();
        let g1 = tracker.track();
        let g2 = tracker.clone().track();
        assert_eq!(tracker.active_count(), 2);
        assert_ne!(g1.id(), g2.id());

        drop(g1);
        assert_eq!(tracker.active_count(), 1);
        drop(g2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn drain_returns_leftover_count() {
        let tracker = ConnectionTracker::new();
        let _held = tracker.track();
        assert_eq!(tracker.drain(Duration::from_millis(30)).await, 1);
    }
}
