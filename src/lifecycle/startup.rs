//! Startup orchestration.
//!
//! Binds every configured listener before `start`, so that a bad address
//! fails the whole process before any worker is forked.

use crate::config::ListenerConfig;
use crate::server::{ServerError, StreamHandler, TcpServer};

pub fn bind_listeners<H>(server: &mut TcpServer<H>, listeners: &[ListenerConfig]) -> Result<(), ServerError>
where
    H: StreamHandler + 'static,
{
    for listener in listeners {
        server.bind(
            listener.port,
            listener.address.as_deref(),
            listener.family,
            listener.backlog,
        )?;
    }
    tracing::info!(listeners = listeners.len(), pending = server.pending_count(), "Listeners bound");
    Ok(())
}
