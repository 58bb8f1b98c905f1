//! Accept-time handoff from raw connection to application handler.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};

use tokio::net::TcpStream;

use crate::net::connection::{ConnectionId, Disposition};
use crate::net::stream::{Stream, StreamOptions};
use crate::net::tls::{Transport, TransportNegotiator};
use crate::observability::metrics;
use crate::server::handler::{HandlerError, StreamHandler};

/// What escaped the handler call.
#[derive(Debug)]
pub enum BoundaryFailure {
    Error(HandlerError),
    Panic(String),
}

impl std::fmt::Display for BoundaryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundaryFailure::Error(e) => write!(f, "{}", e),
            BoundaryFailure::Panic(msg) => write!(f, "panic: {}", msg),
        }
    }
}

/// Run `f`, turning a returned error or a panic into a `BoundaryFailure`.
///
/// Nothing raised inside `f` unwinds past this call.
pub fn error_boundary<F>(f: F) -> Result<(), BoundaryFailure>
where
    F: FnOnce() -> Result<(), HandlerError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BoundaryFailure::Error(e)),
        Err(payload) => Err(BoundaryFailure::Panic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Turns accepted connections into streams for the handler.
pub struct ConnectionDispatcher<H> {
    handler: H,
    negotiator: TransportNegotiator,
    options: StreamOptions,
}

impl<H: StreamHandler> ConnectionDispatcher<H> {
    pub fn new(handler: H, negotiator: TransportNegotiator, options: StreamOptions) -> Self {
        Self {
            handler,
            negotiator,
            options,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Handle one accepted connection. Never panics and never returns an error:
    /// the outcome is reported as a `Disposition`.
    pub fn handle_connection(&self, connection: TcpStream, peer: SocketAddr) -> Disposition {
        let id = ConnectionId::next();
        let span = tracing::debug_span!("conn", %id, %peer);
        let _entered = span.enter();
        metrics::record_connection_accepted();

        let transport = match self.negotiator.negotiate(connection, peer) {
            Ok(transport) => transport,
            Err(e) if e.is_benign() => {
                metrics::record_benign_close();
                return Disposition::ClosedBenign;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error in connection callback");
                metrics::record_transport_error();
                return Disposition::ErrorLogged;
            }
        };

        match error_boundary(|| self.dispatch(transport, peer)) {
            Ok(()) => {
                tracing::trace!("Stream handed off");
                Disposition::Done
            }
            Err(failure) => {
                let kind = match failure {
                    BoundaryFailure::Error(_) => "error",
                    BoundaryFailure::Panic(_) => "panic",
                };
                tracing::error!(error = %failure, kind, "Error in connection callback");
                metrics::record_handler_error(kind);
                Disposition::ErrorLogged
            }
        }
    }

    fn dispatch(&self, transport: Transport, peer: SocketAddr) -> Result<(), HandlerError> {
        let stream = Stream::new(transport, peer, self.options).map_err(HandlerError::Stream)?;
        self.handler.handle_stream(stream, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_passes_success_through() {
        assert!(error_boundary(|| Ok(())).is_ok());
    }

    #[test]
    fn boundary_captures_returned_error() {
        let failure = error_boundary(|| Err(HandlerError::NotImplemented)).unwrap_err();
        assert!(matches!(failure, BoundaryFailure::Error(HandlerError::NotImplemented)));
    }

    #[test]
    fn boundary_captures_panic_message() {
        let failure = error_boundary(|| panic!("handler exploded")).unwrap_err();
        match failure {
            BoundaryFailure::Panic(msg) => assert_eq!(msg, "handler exploded"),
            other => panic!("expected panic, got {other:?}"),
        }
    }

    #[test]
    fn boundary_captures_formatted_panic() {
        let code = 7;
        let failure = error_boundary(|| panic!("failed with {code}")).unwrap_err();
        assert_eq!(failure.to_string(), "panic: failed with 7");
    }

    #[cfg(feature = "tls")]
    mod tls_setup {
        use std::cell::Cell;
        use std::path::{Path, PathBuf};
        use std::rc::Rc;
        use std::time::Duration;

        use socket2::{Domain, Socket, Type};
        use tokio::net::TcpListener;

        use super::*;
        use crate::net::tls::{BenignErrors, TlsOptions, TlsSettings};

        fn fixture(name: &str) -> PathBuf {
            Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
        }

        fn dispatcher(
            benign: BenignErrors,
        ) -> (Rc<Cell<usize>>, ConnectionDispatcher<impl Fn(Stream, SocketAddr) -> Result<(), HandlerError>>) {
            let tls = TlsSettings::load(&TlsOptions::new(fixture("cert.pem")).with_key(fixture("key.pem"))).unwrap();
            let calls = Rc::new(Cell::new(0usize));
            let counter = Rc::clone(&calls);
            let handler = move |_stream: Stream, _peer: SocketAddr| -> Result<(), HandlerError> {
                counter.set(counter.get() + 1);
                Ok(())
            };
            let negotiator = TransportNegotiator::new(Some(tls), benign);
            (calls, ConnectionDispatcher::new(handler, negotiator, StreamOptions::default()))
        }

        /// Accept a connection whose peer reset it while it sat in the backlog.
        async fn accept_reset(listener: &TcpListener) -> (TcpStream, SocketAddr) {
            let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
            socket.set_linger(Some(Duration::ZERO)).unwrap();
            socket.connect(&listener.local_addr().unwrap().into()).unwrap();
            drop(socket);
            tokio::time::sleep(Duration::from_millis(50)).await;
            listener.accept().await.unwrap()
        }

        #[tokio::test]
        async fn reset_peer_is_closed_as_benign() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let (calls, dispatcher) = dispatcher(BenignErrors::default());

            let (connection, peer) = accept_reset(&listener).await;
            assert_eq!(dispatcher.handle_connection(connection, peer), Disposition::ClosedBenign);
            assert_eq!(calls.get(), 0);
        }

        #[tokio::test]
        async fn unexpected_setup_error_is_logged_and_next_connection_served() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let (calls, dispatcher) = dispatcher(BenignErrors::none());

            let (connection, peer) = accept_reset(&listener).await;
            assert_eq!(dispatcher.handle_connection(connection, peer), Disposition::ErrorLogged);
            assert_eq!(calls.get(), 0);

            let _client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
            let (connection, peer) = listener.accept().await.unwrap();
            assert_eq!(dispatcher.handle_connection(connection, peer), Disposition::Done);
            assert_eq!(calls.get(), 1);
        }
    }
}
