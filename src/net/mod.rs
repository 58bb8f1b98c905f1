//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! SocketFactory (listener.rs)
//!     → bound ListeningSockets
//!     → registry.rs (descriptor map, reactor registration)
//!     → reactor.rs (accept loop per descriptor, invokes callback)
//!     → tls.rs (optional TLS setup, early-disconnect classification)
//!     → stream.rs (Stream handed to the application)
//!
//! Per connection:
//!     Accepted → (TLS setup) → Closed-benign
//!                            → Stream built → Handler invoked → Done
//!                            → Error logged
//! ```
//!
//! # Design Decisions
//! - Sockets are owned by exactly one collection at a time
//! - The reactor holds a duplicate descriptor per accept loop, never the socket
//! - TLS handshakes finish inside the Stream, off the accept path

pub mod connection;
pub mod listener;
pub mod reactor;
pub mod registry;
pub mod stream;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker, Disposition};
pub use listener::{AddressFamily, ListenerError, ListeningSocket, SocketFactory, SystemSocketFactory, DEFAULT_BACKLOG};
pub use reactor::{AcceptCallback, Reactor, TokioReactor};
pub use registry::ListeningSocketRegistry;
pub use stream::{Stream, StreamError, StreamOptions};
pub use tls::{BenignErrors, TlsOptions, TlsSettings, Transport, TransportError, TransportNegotiator};
