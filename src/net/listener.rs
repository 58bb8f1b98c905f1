//! Listening sockets and the factory that binds them.
//!
//! # Responsibilities
//! - Resolve a port/address/family triple into one or more bind addresses
//! - Create, configure, bind and listen on each socket
//! - Hand back owned `ListeningSocket`s; nothing here touches the reactor

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Address could not be resolved.
    Resolve(String, io::Error),
    /// Resolution succeeded but produced nothing matching the requested family.
    NoAddresses(String),
    /// Failed to create, bind or listen on a socket.
    Bind(SocketAddr, io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Resolve(host, e) => write!(f, "Failed to resolve {}: {}", host, e),
            ListenerError::NoAddresses(host) => write!(f, "No usable addresses for {}", host),
            ListenerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Resolve(_, e) | ListenerError::Bind(_, e) => Some(e),
            ListenerError::NoAddresses(_) => None,
        }
    }
}

/// Address family restriction for `bind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// Both IPv4 and IPv6, whichever are available.
    #[default]
    Unspec,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Unspec => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// A bound, listening, non-blocking socket.
///
/// The descriptor and local address are captured at construction and never
/// change for the lifetime of the value.
#[derive(Debug)]
pub struct ListeningSocket {
    inner: TcpListener,
    fd: RawFd,
    local_addr: SocketAddr,
}

impl ListeningSocket {
    /// Adopt an already listening std socket.
    pub fn from_std(listener: TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let fd = listener.as_raw_fd();
        Ok(Self {
            inner: listener,
            fd,
            local_addr,
        })
    }

    /// Descriptor identity of this socket.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Duplicate the descriptor for an accept loop. The duplicate shares the
    /// kernel listen queue with this socket.
    pub fn try_clone_listener(&self) -> io::Result<TcpListener> {
        let listener = self.inner.try_clone()?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Give up ownership of the descriptor without closing it.
    pub(crate) fn release(self) -> RawFd {
        self.inner.into_raw_fd()
    }

    /// Close the socket.
    pub fn close(self) {
        drop(self.inner);
    }
}

impl AsRawFd for ListeningSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Produces bound listening sockets.
pub trait SocketFactory {
    /// Bind every address `address` resolves to for `family`.
    ///
    /// `None` or an empty address means all interfaces.
    fn bind_sockets(
        &self,
        port: u16,
        address: Option<&str>,
        family: AddressFamily,
        backlog: u32,
    ) -> Result<Vec<ListeningSocket>, ListenerError>;
}

/// `SocketFactory` backed by the operating system via `socket2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSocketFactory;

impl SocketFactory for SystemSocketFactory {
    fn bind_sockets(
        &self,
        port: u16,
        address: Option<&str>,
        family: AddressFamily,
        backlog: u32,
    ) -> Result<Vec<ListeningSocket>, ListenerError> {
        let wildcard = address.map_or(true, str::is_empty);
        let host = address.filter(|a| !a.is_empty()).unwrap_or("*").to_string();
        let addrs = resolve(port, address, family)?;

        let mut sockets = Vec::with_capacity(addrs.len());
        // Port 0 across several addresses: every socket reuses the first assigned port.
        let mut bound_port = None;

        for mut addr in addrs {
            if port == 0 {
                if let Some(p) = bound_port {
                    addr.set_port(p);
                }
            }

            match bind_one(addr, backlog) {
                Ok(socket) => {
                    bound_port.get_or_insert(socket.local_addr().port());
                    tracing::info!(address = %socket.local_addr(), fd = socket.fd(), "Socket bound");
                    sockets.push(socket);
                }
                // Hosts without IPv6 still serve the IPv4 wildcard.
                Err(e) if wildcard && addr.is_ipv6() && is_family_unavailable(&e) => {
                    tracing::debug!(address = %addr, error = %e, "Skipping unavailable address family");
                }
                Err(e) => return Err(ListenerError::Bind(addr, e)),
            }
        }

        if sockets.is_empty() {
            return Err(ListenerError::NoAddresses(host));
        }
        Ok(sockets)
    }
}

fn resolve(port: u16, address: Option<&str>, family: AddressFamily) -> Result<Vec<SocketAddr>, ListenerError> {
    let candidates: Vec<SocketAddr> = match address.filter(|a| !a.is_empty()) {
        None => vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        ],
        Some(host) => (host, port)
            .to_socket_addrs()
            .map_err(|e| ListenerError::Resolve(host.to_string(), e))?
            .collect(),
    };

    let mut addrs: Vec<SocketAddr> = Vec::with_capacity(candidates.len());
    for addr in candidates.into_iter().filter(|a| family.admits(a)) {
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    if addrs.is_empty() {
        return Err(ListenerError::NoAddresses(
            address.unwrap_or("*").to_string(),
        ));
    }
    Ok(addrs)
}

fn bind_one(addr: SocketAddr, backlog: u32) -> io::Result<ListeningSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // Keep v6 sockets from claiming the v4 port too; v4 gets its own socket.
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    ListeningSocket::from_std(socket.into())
}

fn is_family_unavailable(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EAFNOSUPPORT) | Some(libc::EADDRNOTAVAIL))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_single_loopback_socket() {
        let sockets = SystemSocketFactory
            .bind_sockets(0, Some("127.0.0.1"), AddressFamily::Unspec, DEFAULT_BACKLOG)
            .unwrap();
        assert_eq!(sockets.len(), 1);
        assert!(sockets[0].local_addr().ip().is_loopback());
        assert_ne!(sockets[0].local_addr().port(), 0);
    }

    #[test]
    fn wildcard_sockets_share_assigned_port() {
        let sockets = SystemSocketFactory
            .bind_sockets(0, None, AddressFamily::Unspec, DEFAULT_BACKLOG)
            .unwrap();
        assert!(!sockets.is_empty());
        let port = sockets[0].local_addr().port();
        assert!(sockets.iter().all(|s| s.local_addr().port() == port));
    }

    #[test]
    fn family_filter_excludes_other_family() {
        let err = SystemSocketFactory
            .bind_sockets(0, Some("127.0.0.1"), AddressFamily::Ipv6, DEFAULT_BACKLOG)
            .unwrap_err();
        assert!(matches!(err, ListenerError::NoAddresses(_)));
    }

    #[test]
    fn descriptor_matches_raw_fd() {
        let socket = SystemSocketFactory
            .bind_sockets(0, Some("127.0.0.1"), AddressFamily::Ipv4, 16)
            .unwrap()
            .remove(0);
        assert_eq!(socket.fd(), socket.as_raw_fd());
    }
}
