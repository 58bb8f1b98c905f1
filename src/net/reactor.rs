//! Accept-event dispatch.
//!
//! The server only ever registers and deregisters descriptors; polling and
//! callback invocation belong to the `Reactor`. `TokioReactor` drives one
//! local accept task per descriptor on a `LocalSet`, so callbacks run one at a
//! time on a single thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::task::{JoinHandle, LocalSet};

use super::listener::ListeningSocket;

/// Invoked once per accepted connection.
pub type AcceptCallback = Rc<dyn Fn(TcpStream, SocketAddr)>;

/// Pause after an accept error that is not tied to a single connection
/// (descriptor exhaustion and the like).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Event dispatcher the server registers listening descriptors with.
pub trait Reactor {
    /// Start delivering connections accepted on `socket` to `callback`.
    fn add_accept_handler(&self, socket: &ListeningSocket, callback: AcceptCallback) -> io::Result<()>;

    /// Stop delivering connections for `fd`. Unknown descriptors are ignored.
    fn remove_handler(&self, fd: RawFd);
}

/// Single-threaded reactor on top of a Tokio `LocalSet`.
///
/// Handlers may be added before the set is running; their accept loops start
/// once the set is driven with [`TokioReactor::run_until`] or
/// [`TokioReactor::block_on`].
#[derive(Default)]
pub struct TokioReactor {
    local: LocalSet,
    handlers: RefCell<HashMap<RawFd, Registration>>,
}

/// An accept loop and the descriptor it accepts on.
///
/// The reactor holds the only strong reference to the listener; the task
/// borrows it per poll. Dropping the registration closes the descriptor
/// immediately, whether or not the task has been polled since.
struct Registration {
    listener: Rc<RefCell<AcceptSource>>,
    task: JoinHandle<()>,
}

impl Registration {
    fn cancel(self) {
        self.task.abort();
        drop(self.listener);
    }
}

enum AcceptSource {
    /// Not yet registered with the runtime's IO driver.
    Pending(std::net::TcpListener),
    Ready(TcpListener),
    Closed,
}

impl AcceptSource {
    /// `Ready(None)` once there is nothing left to accept on.
    fn poll_accept(
        &mut self,
        cx: &mut Context<'_>,
        local_addr: SocketAddr,
    ) -> Poll<Option<io::Result<(TcpStream, SocketAddr)>>> {
        loop {
            match std::mem::replace(self, AcceptSource::Closed) {
                AcceptSource::Pending(listener) => match TcpListener::from_std(listener) {
                    Ok(listener) => *self = AcceptSource::Ready(listener),
                    Err(e) => {
                        tracing::error!(address = %local_addr, error = %e, "Failed to register listener with runtime");
                        return Poll::Ready(None);
                    }
                },
                AcceptSource::Ready(listener) => {
                    let polled = listener.poll_accept(cx);
                    *self = AcceptSource::Ready(listener);
                    return polled.map(Some);
                }
                AcceptSource::Closed => return Poll::Ready(None),
            }
        }
    }
}

impl TokioReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive accept loops and other local tasks until `future` completes.
    pub async fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.local.run_until(future).await
    }

    /// Run `future` to completion on `runtime`, driving accept loops meanwhile.
    pub fn block_on<F: Future>(&self, runtime: &Runtime, future: F) -> F::Output {
        self.local.block_on(runtime, future)
    }

    /// Number of descriptors with an active accept loop.
    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.handlers.borrow().contains_key(&fd)
    }
}

impl Reactor for TokioReactor {
    fn add_accept_handler(&self, socket: &ListeningSocket, callback: AcceptCallback) -> io::Result<()> {
        let fd = socket.fd();
        let local_addr = socket.local_addr();
        let listener = Rc::new(RefCell::new(AcceptSource::Pending(socket.try_clone_listener()?)));

        let task = self
            .local
            .spawn_local(accept_loop(Rc::downgrade(&listener), local_addr, callback));
        let previous = self.handlers.borrow_mut().insert(fd, Registration { listener, task });
        if let Some(previous) = previous {
            previous.cancel();
        }

        tracing::debug!(fd, address = %local_addr, "Accept handler added");
        Ok(())
    }

    fn remove_handler(&self, fd: RawFd) {
        let removed = self.handlers.borrow_mut().remove(&fd);
        if let Some(registration) = removed {
            registration.cancel();
            tracing::debug!(fd, "Accept handler removed");
        }
    }
}

async fn accept_loop(listener: Weak<RefCell<AcceptSource>>, local_addr: SocketAddr, callback: AcceptCallback) {
    loop {
        let accepted = poll_fn(|cx| match listener.upgrade() {
            Some(source) => source.borrow_mut().poll_accept(cx, local_addr),
            None => Poll::Ready(None),
        })
        .await;

        match accepted {
            None => return,
            Some(Ok((stream, peer))) => callback(stream, peer),
            // The peer gave up while the connection sat in the backlog.
            Some(Err(e)) if matches!(e.kind(), io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset) => {
                tracing::debug!(address = %local_addr, error = %e, "Connection dropped before accept");
            }
            Some(Err(e)) => {
                tracing::error!(address = %local_addr, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}
