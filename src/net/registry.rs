//! Descriptor → listening socket bookkeeping.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use super::listener::ListeningSocket;
use super::reactor::{AcceptCallback, Reactor};
use crate::observability::metrics;

/// Sockets currently registered with the reactor, keyed by descriptor.
///
/// A descriptor is present exactly when its accept handler is registered.
pub struct ListeningSocketRegistry {
    sockets: HashMap<RawFd, ListeningSocket>,
    reactor: Rc<dyn Reactor>,
}

impl ListeningSocketRegistry {
    pub fn new(reactor: Rc<dyn Reactor>) -> Self {
        Self {
            sockets: HashMap::new(),
            reactor,
        }
    }

    /// Track `sockets` and register `callback` for each new descriptor.
    ///
    /// A descriptor that is already tracked keeps its existing reactor
    /// registration; only the tracked entry is replaced. A socket the reactor
    /// refuses is closed; the rest are still registered and the first
    /// failure is returned.
    pub fn register(&mut self, sockets: Vec<ListeningSocket>, callback: &AcceptCallback) -> io::Result<()> {
        let mut first_error = None;
        for socket in sockets {
            let fd = socket.fd();
            if !self.sockets.contains_key(&fd) {
                if let Err(e) = self.reactor.add_accept_handler(&socket, Rc::clone(callback)) {
                    tracing::error!(fd, address = %socket.local_addr(), error = %e, "Failed to register socket, closing it");
                    socket.close();
                    first_error.get_or_insert(e);
                    continue;
                }
                tracing::info!(fd, address = %socket.local_addr(), "Accepting connections");
            }
            if let Some(previous) = self.sockets.insert(fd, socket) {
                // Same descriptor number: the new entry owns it now.
                let _ = previous.release();
            }
        }
        metrics::set_listening_sockets(self.sockets.len());
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Deregister and close every tracked socket. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let count = self.sockets.len();
        for (fd, socket) in self.sockets.drain() {
            self.reactor.remove_handler(fd);
            socket.close();
            tracing::info!(fd, "Stopped accepting connections");
        }
        metrics::set_listening_sockets(0);
        count
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.sockets.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.values().map(ListeningSocket::local_addr).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::fd::FromRawFd;

    use crate::net::listener::{AddressFamily, SocketFactory, SystemSocketFactory};

    #[derive(Default)]
    struct CountingReactor {
        added: RefCell<Vec<RawFd>>,
        removed: RefCell<Vec<RawFd>>,
    }

    impl Reactor for CountingReactor {
        fn add_accept_handler(&self, socket: &ListeningSocket, _callback: AcceptCallback) -> io::Result<()> {
            self.added.borrow_mut().push(socket.fd());
            Ok(())
        }

        fn remove_handler(&self, fd: RawFd) {
            self.removed.borrow_mut().push(fd);
        }
    }

    /// Refuses one descriptor, accepts the rest.
    struct RefusingReactor {
        refused: RawFd,
        added: RefCell<Vec<RawFd>>,
    }

    impl Reactor for RefusingReactor {
        fn add_accept_handler(&self, socket: &ListeningSocket, _callback: AcceptCallback) -> io::Result<()> {
            if socket.fd() == self.refused {
                return Err(io::Error::other("registration refused"));
            }
            self.added.borrow_mut().push(socket.fd());
            Ok(())
        }

        fn remove_handler(&self, _fd: RawFd) {}
    }

    fn loopback_socket() -> ListeningSocket {
        SystemSocketFactory
            .bind_sockets(0, Some("127.0.0.1"), AddressFamily::Ipv4, 16)
            .unwrap()
            .remove(0)
    }

    fn noop_callback() -> AcceptCallback {
        Rc::new(|_, _| {})
    }

    #[test]
    fn repeated_descriptor_registers_once() {
        let reactor = Rc::new(CountingReactor::default());
        let mut registry = ListeningSocketRegistry::new(reactor.clone());
        let callback = noop_callback();

        let socket = loopback_socket();
        let fd = socket.fd();
        registry.register(vec![socket], &callback).unwrap();

        // A second owner of the same descriptor number.
        let duplicate = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        registry
            .register(vec![ListeningSocket::from_std(duplicate).unwrap()], &callback)
            .unwrap();

        assert_eq!(*reactor.added.borrow(), vec![fd]);
        assert_eq!(registry.len(), 1);

        // Close through the registry only; the released handle must not double-close.
        assert_eq!(registry.close_all(), 1);
        assert_eq!(*reactor.removed.borrow(), vec![fd]);
    }

    #[test]
    fn close_all_empties_registry() {
        let reactor = Rc::new(CountingReactor::default());
        let mut registry = ListeningSocketRegistry::new(reactor.clone());
        registry
            .register(vec![loopback_socket(), loopback_socket()], &noop_callback())
            .unwrap();
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(reactor.removed.borrow().len(), 2);
    }

    #[test]
    fn refused_socket_does_not_drop_the_rest() {
        let first = loopback_socket();
        let second = loopback_socket();
        let third = loopback_socket();
        let (refused, kept) = (second.fd(), [first.fd(), third.fd()]);
        let refused_addr = second.local_addr();

        let reactor = Rc::new(RefusingReactor {
            refused,
            added: RefCell::default(),
        });
        let mut registry = ListeningSocketRegistry::new(reactor.clone());
        let err = registry
            .register(vec![first, second, third], &noop_callback())
            .unwrap_err();

        assert_eq!(err.to_string(), "registration refused");
        assert_eq!(*reactor.added.borrow(), kept);
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains(refused));
        assert!(!registry.local_addrs().contains(&refused_addr));
    }

    #[test]
    fn released_socket_keeps_descriptor_open() {
        let socket = loopback_socket();
        let addr = socket.local_addr();
        let fd = socket.release();
        let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        assert_eq!(listener.local_addr().unwrap(), addr);
    }
}
