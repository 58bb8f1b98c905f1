//! Application-facing connection stream.
//!
//! A `Stream` wraps either a plain TCP connection or a TLS session whose
//! handshake has not run yet. The handshake is driven on first use (or by
//! an explicit [`Stream::handshake`]), so nothing on the accept path blocks.

use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use super::tls::Transport;

/// Default cap on buffered, unconsumed input (100 MiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 100 * 1024 * 1024;
/// Default size of a single read (64 KiB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Size limits carried into every stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamOptions {
    pub max_buffer_size: usize,
    pub read_chunk_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

/// Error type for buffered stream reads.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("read buffer exceeded {limit} bytes")]
    BufferFull { limit: usize },
    #[error("stream closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum Inner {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Handshaking(tokio_rustls::Accept<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// TLS handshake failed; the connection is gone.
    Failed,
}

/// Buffered, optionally encrypted connection handed to a `StreamHandler`.
pub struct Stream {
    inner: Inner,
    peer_addr: SocketAddr,
    options: StreamOptions,
    buffer: Vec<u8>,
}

impl Stream {
    /// Wrap a negotiated transport.
    pub fn new(transport: Transport, peer_addr: SocketAddr, options: StreamOptions) -> io::Result<Self> {
        if options.read_chunk_size == 0 || options.read_chunk_size > options.max_buffer_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "read_chunk_size {} must be non-zero and at most max_buffer_size {}",
                    options.read_chunk_size, options.max_buffer_size
                ),
            ));
        }

        let inner = match transport {
            Transport::Plain(stream) => Inner::Plain(stream),
            #[cfg(feature = "tls")]
            Transport::Tls(accept) => Inner::Handshaking(accept),
        };

        Ok(Self {
            inner,
            peer_addr,
            options,
            buffer: Vec::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    /// Whether this stream carries TLS (handshaken or not).
    pub fn is_tls(&self) -> bool {
        match self.inner {
            Inner::Plain(_) => false,
            #[cfg(feature = "tls")]
            Inner::Handshaking(_) | Inner::Tls(_) => true,
            Inner::Failed => true,
        }
    }

    /// Bytes read from the connection but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Complete the TLS handshake. A no-op for plain streams.
    pub async fn handshake(&mut self) -> io::Result<()> {
        poll_fn(|cx| self.poll_handshake(cx)).await
    }

    /// Read at most `read_chunk_size` bytes. `None` on end of stream.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if self.buffer.is_empty() && self.fill_buffer().await? == 0 {
            return Ok(None);
        }
        let n = self.buffer.len().min(self.options.read_chunk_size);
        Ok(Some(self.buffer.drain(..n).collect()))
    }

    /// Read up to and including `delimiter`.
    ///
    /// Fails with [`StreamError::BufferFull`] once more than `max_buffer_size`
    /// bytes are buffered without the delimiter showing up.
    pub async fn read_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>, StreamError> {
        let mut searched = 0;
        loop {
            if let Some(pos) = find(&self.buffer[searched..], delimiter) {
                let end = searched + pos + delimiter.len();
                return Ok(self.buffer.drain(..end).collect());
            }
            if self.buffer.len() > self.options.max_buffer_size {
                return Err(StreamError::BufferFull {
                    limit: self.options.max_buffer_size,
                });
            }
            searched = self.buffer.len().saturating_sub(delimiter.len().saturating_sub(1));
            if self.fill_buffer().await? == 0 {
                return Err(StreamError::Closed);
            }
        }
    }

    async fn fill_buffer(&mut self) -> io::Result<usize> {
        let mut chunk = vec![0u8; self.options.read_chunk_size];
        let n = poll_fn(|cx: &mut Context<'_>| -> Poll<io::Result<usize>> {
            let mut buf = ReadBuf::new(&mut chunk);
            ready!(self.poll_read_transport(cx, &mut buf))?;
            Poll::Ready(Ok(buf.filled().len()))
        })
        .await?;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.inner {
            Inner::Plain(_) => Poll::Ready(Ok(())),
            #[cfg(feature = "tls")]
            Inner::Tls(_) => Poll::Ready(Ok(())),
            #[cfg(feature = "tls")]
            Inner::Handshaking(accept) => match ready!(Pin::new(accept).poll(cx)) {
                Ok(tls) => {
                    self.inner = Inner::Tls(Box::new(tls));
                    tracing::debug!(peer = %self.peer_addr, "TLS handshake completed");
                    Poll::Ready(Ok(()))
                }
                Err(e) => {
                    self.inner = Inner::Failed;
                    tracing::debug!(peer = %self.peer_addr, error = %e, "TLS handshake failed");
                    Poll::Ready(Err(e))
                }
            },
            Inner::Failed => Poll::Ready(Err(closed_after_handshake())),
        }
    }

    fn poll_read_transport(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_handshake(cx))?;
        match &mut self.inner {
            Inner::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Inner::Handshaking(_) => unreachable!("handshake completed above"),
            Inner::Failed => Poll::Ready(Err(closed_after_handshake())),
        }
    }
}

fn closed_after_handshake() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream closed after failed TLS handshake")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.is_tls())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffer.is_empty() {
            let n = this.buffer.len().min(buf.remaining());
            buf.put_slice(&this.buffer[..n]);
            this.buffer.drain(..n);
            return Poll::Ready(Ok(()));
        }
        this.poll_read_transport(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_handshake(cx))?;
        match &mut this.inner {
            Inner::Plain(s) => Pin::new(s).poll_write(cx, data),
            #[cfg(feature = "tls")]
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
            #[cfg(feature = "tls")]
            Inner::Handshaking(_) => unreachable!("handshake completed above"),
            Inner::Failed => Poll::Ready(Err(closed_after_handshake())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(feature = "tls")]
            Inner::Handshaking(_) => Poll::Ready(Ok(())),
            Inner::Failed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            // Nothing was negotiated; dropping closes the socket.
            #[cfg(feature = "tls")]
            Inner::Handshaking(_) => Poll::Ready(Ok(())),
            Inner::Failed => Poll::Ready(Ok(())),
        }
    }
}
