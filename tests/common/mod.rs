//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tcp_server::lifecycle::{FanoutError, ProcessFanout};
use tcp_server::net::{AcceptCallback, ListeningSocket, Reactor, Stream};
use tcp_server::server::HandlerError;

/// Path to a file under `tests/fixtures`.
pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Reactor that only records registrations.
#[derive(Default)]
pub struct RecordingReactor {
    pub added: RefCell<Vec<RawFd>>,
    pub removed: RefCell<Vec<RawFd>>,
}

impl Reactor for RecordingReactor {
    fn add_accept_handler(&self, socket: &ListeningSocket, _callback: AcceptCallback) -> io::Result<()> {
        self.added.borrow_mut().push(socket.fd());
        Ok(())
    }

    fn remove_handler(&self, fd: RawFd) {
        self.removed.borrow_mut().push(fd);
    }
}

/// Fan-out that records the requested count and pretends to be worker 0.
#[derive(Clone, Default)]
pub struct RecordingFanout {
    pub calls: Rc<RefCell<Vec<usize>>>,
}

impl ProcessFanout for RecordingFanout {
    fn fork_processes(&mut self, count: NonZeroUsize) -> Result<usize, FanoutError> {
        self.calls.borrow_mut().push(count.get());
        Ok(0)
    }
}

/// Peers seen by a recording handler.
pub type Seen = Rc<RefCell<Vec<SocketAddr>>>;

/// Handler that records each peer and drops the stream.
pub fn recording_handler() -> (Seen, impl Fn(Stream, SocketAddr) -> Result<(), HandlerError>) {
    let seen: Seen = Rc::default();
    let sink = Rc::clone(&seen);
    let handler = move |_stream: Stream, peer: SocketAddr| -> Result<(), HandlerError> {
        sink.borrow_mut().push(peer);
        Ok(())
    };
    (seen, handler)
}

/// Poll `cond` until it holds or `timeout` elapses, yielding to local tasks.
pub async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
