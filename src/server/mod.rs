//! Server lifecycle: bind → start → stop.
//!
//! # Data Flow
//! ```text
//! bind()  ──(not started)──▶ pending queue ──start()──┐
//!    │                                                ▼
//!    └────(started)────────────────────────────▶ registry ──▶ reactor
//! listen() / add_sockets() ────────────────────▶ registry
//!
//! reactor accept ──▶ dispatcher.rs (TLS setup, Stream, handler)
//! ```
//!
//! There are three ways to set a server up:
//!
//! 1. `listen`: single process, takes effect immediately.
//! 2. `bind` + `start(n)`: sockets are bound first, then `start` forks `n`
//!    workers (or one per core for `0`) and each worker registers them.
//! 3. `add_sockets`: sockets created elsewhere, e.g. bound and forked by the
//!    caller, registered immediately.

pub mod dispatcher;
pub mod handler;

use std::net::SocketAddr;
use std::rc::Rc;

use crate::config::validation::validate_stream_options;
use crate::config::ConfigError;
use crate::lifecycle::fanout::{resolve_worker_count, FanoutError, ForkFanout, ProcessFanout};
use crate::net::listener::{AddressFamily, ListenerError, ListeningSocket, SocketFactory, SystemSocketFactory, DEFAULT_BACKLOG};
use crate::net::reactor::{AcceptCallback, Reactor};
use crate::net::registry::ListeningSocketRegistry;
use crate::net::stream::StreamOptions;
use crate::net::tls::{BenignErrors, TlsOptions, TlsSettings, TransportNegotiator};

pub use dispatcher::{error_boundary, BoundaryFailure, ConnectionDispatcher};
pub use handler::{BoxError, HandlerError, StreamHandler};

/// Construction-time options.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Enables TLS on every accepted connection.
    pub tls: Option<TlsOptions>,
    /// Forwarded unchanged to each `Stream`.
    pub stream: StreamOptions,
    /// Errors treated as a peer disconnect during TLS setup.
    pub benign_errors: BenignErrors,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to register socket with reactor: {0}")]
    Register(#[source] std::io::Error),

    #[error(transparent)]
    Fanout(#[from] FanoutError),
}

/// A non-blocking TCP server.
///
/// Owns its listening sockets and hands every accepted connection to `H`.
/// All state is per instance; after `start` forks, each worker holds an
/// independent copy.
pub struct TcpServer<H> {
    dispatcher: Rc<ConnectionDispatcher<H>>,
    registry: ListeningSocketRegistry,
    pending: Vec<ListeningSocket>,
    started: bool,
    task_id: Option<usize>,
    factory: Box<dyn SocketFactory>,
    fanout: Box<dyn ProcessFanout>,
}

impl<H: StreamHandler + 'static> TcpServer<H> {
    /// Create a server. Stream limits are checked and TLS material is
    /// validated and loaded here; nothing is bound yet.
    pub fn new(handler: H, options: ServerOptions, reactor: Rc<dyn Reactor>) -> Result<Self, ConfigError> {
        validate_stream_options(&options.stream).map_err(ConfigError::Validation)?;
        let tls = options.tls.as_ref().map(TlsSettings::load).transpose()?;
        let negotiator = TransportNegotiator::new(tls, options.benign_errors);

        Ok(Self {
            dispatcher: Rc::new(ConnectionDispatcher::new(handler, negotiator, options.stream)),
            registry: ListeningSocketRegistry::new(reactor),
            pending: Vec::new(),
            started: false,
            task_id: None,
            factory: Box::new(SystemSocketFactory),
            fanout: Box::new(ForkFanout::default()),
        })
    }

    pub fn with_socket_factory(mut self, factory: impl SocketFactory + 'static) -> Self {
        self.factory = Box::new(factory);
        self
    }

    pub fn with_fanout(mut self, fanout: impl ProcessFanout + 'static) -> Self {
        self.fanout = Box::new(fanout);
        self
    }

    /// Bind `port` on `address` and start accepting right away.
    ///
    /// May be called more than once. No `start` is needed, but the reactor
    /// must be running for connections to be served.
    pub fn listen(&mut self, port: u16, address: &str) -> Result<(), ServerError> {
        let sockets = self
            .factory
            .bind_sockets(port, Some(address), AddressFamily::Unspec, DEFAULT_BACKLOG)?;
        self.add_sockets(sockets)
    }

    /// Accept connections on `sockets` right away.
    pub fn add_sockets(&mut self, sockets: Vec<ListeningSocket>) -> Result<(), ServerError> {
        let callback = self.accept_callback();
        self.registry.register(sockets, &callback).map_err(ServerError::Register)
    }

    pub fn add_socket(&mut self, socket: ListeningSocket) -> Result<(), ServerError> {
        self.add_sockets(vec![socket])
    }

    /// Bind `port` without accepting yet.
    ///
    /// Before `start` the sockets are queued; afterwards they are registered
    /// immediately. A bare port may produce several sockets (one per family).
    pub fn bind(
        &mut self,
        port: u16,
        address: Option<&str>,
        family: AddressFamily,
        backlog: u32,
    ) -> Result<(), ServerError> {
        let sockets = self.factory.bind_sockets(port, address, family, backlog)?;
        if self.started {
            self.add_sockets(sockets)
        } else {
            tracing::debug!(port, count = sockets.len(), "Sockets queued until start");
            self.pending.extend(sockets);
            Ok(())
        }
    }

    /// Start accepting on every socket queued by `bind`.
    ///
    /// `workers == 1` stays in this process. Any other value forks first:
    /// that many workers, or one per core for `0`. With the default fan-out
    /// this returns only in the workers.
    ///
    /// # Panics
    /// If called more than once.
    pub fn start(&mut self, workers: usize) -> Result<(), ServerError> {
        assert!(!self.started, "TcpServer::start called more than once");
        self.started = true;

        if workers != 1 {
            let count = resolve_worker_count(workers);
            let task_id = self.fanout.fork_processes(count)?;
            self.task_id = Some(task_id);
            tracing::info!(task_id, "Worker started");
        }

        let sockets = std::mem::take(&mut self.pending);
        self.add_sockets(sockets)
    }

    /// Stop accepting new connections.
    ///
    /// Every registered descriptor is removed from the reactor and closed.
    /// Connections already handed to the handler keep running.
    pub fn stop(&mut self) {
        let closed = self.registry.close_all();
        tracing::info!(closed, "Server stopped accepting");
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Worker task id when `start` forked, `None` otherwise.
    pub fn task_id(&self) -> Option<usize> {
        self.task_id
    }

    /// Addresses currently accepting connections.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.registry.local_addrs()
    }

    /// Sockets bound but waiting for `start`.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn handler(&self) -> &H {
        self.dispatcher.handler()
    }

    fn accept_callback(&self) -> AcceptCallback {
        let dispatcher = Rc::clone(&self.dispatcher);
        Rc::new(move |connection, peer| {
            dispatcher.handle_connection(connection, peer);
        })
    }
}
