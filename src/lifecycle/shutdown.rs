//! Graceful stop: halt acceptance, then let in-flight connections drain.

use std::time::Duration;

use crate::net::connection::ConnectionTracker;
use crate::server::{StreamHandler, TcpServer};

/// Default time in-flight connections get after `stop()`.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Stop accepting on `server` and wait up to `grace` for tracked connections.
/// Returns how many connections were still open when the wait ended.
pub async fn graceful_stop<H>(server: &mut TcpServer<H>, tracker: &ConnectionTracker, grace: Duration) -> usize
where
    H: StreamHandler + 'static,
{
    server.stop();

    let in_flight = tracker.active_count();
    if in_flight == 0 {
        return 0;
    }

    tracing::info!(in_flight, grace_secs = grace.as_secs_f64(), "Draining connections");
    let remaining = tracker.drain(grace).await;
    if remaining > 0 {
        tracing::warn!(remaining, "Drain deadline reached with connections still open");
    } else {
        tracing::info!("All connections drained");
    }
    remaining
}
