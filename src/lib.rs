//! Listening-socket lifecycle manager.
//!
//! Owns the sockets a process listens on, registers them with a reactor,
//! and turns each accepted connection into a [`Stream`](net::Stream) for an
//! application [`StreamHandler`](server::StreamHandler), optionally over TLS
//! and optionally across forked worker processes.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use net::{Stream, TokioReactor};
pub use server::{HandlerError, ServerOptions, StreamHandler, TcpServer};
