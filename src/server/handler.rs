//! Application handler contract.

use std::net::SocketAddr;

use crate::net::stream::Stream;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure raised while building a stream or running a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler has no behaviour for this stream.
    #[error("handle_stream is not implemented")]
    NotImplemented,

    #[error("failed to construct stream: {0}")]
    Stream(#[source] std::io::Error),

    #[error(transparent)]
    Other(BoxError),
}

impl HandlerError {
    pub fn other(err: impl Into<BoxError>) -> Self {
        HandlerError::Other(err.into())
    }
}

/// Receives every stream the server accepts.
///
/// Called synchronously from the accept callback; long-running work should
/// be spawned (e.g. `tokio::task::spawn_local`). Errors and panics are caught
/// by the server, logged, and do not affect other connections.
pub trait StreamHandler {
    fn handle_stream(&self, stream: Stream, peer: SocketAddr) -> Result<(), HandlerError>;
}

impl<F> StreamHandler for F
where
    F: Fn(Stream, SocketAddr) -> Result<(), HandlerError>,
{
    fn handle_stream(&self, stream: Stream, peer: SocketAddr) -> Result<(), HandlerError> {
        self(stream, peer)
    }
}
