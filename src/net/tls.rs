//! TLS material and accept-time transport negotiation.
//!
//! Certificates are checked and loaded once, when the server is constructed.
//! At accept time the negotiator only prepares the TLS session; the handshake
//! itself is completed later by the [`Stream`](super::stream::Stream).

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::config::ConfigError;

/// TLS settings as supplied by the caller.
///
/// `cert_path` is optional only so that a TLS section without it can be
/// reported as a configuration error instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsOptions {
    /// PEM certificate chain.
    pub cert_path: Option<PathBuf>,
    /// PEM private key. When absent the key is read from `cert_path`.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl TlsOptions {
    pub fn new(cert_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: Some(cert_path.into()),
            key_path: None,
        }
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Check that the referenced files exist. Returns `(cert, key)` paths.
    pub fn validate(&self) -> Result<(&Path, &Path), ConfigError> {
        let cert = self.cert_path.as_deref().ok_or(ConfigError::MissingCertificate)?;
        if !cert.exists() {
            return Err(ConfigError::CertificateNotFound(cert.to_path_buf()));
        }

        let key = match self.key_path.as_deref() {
            Some(key) if !key.exists() => return Err(ConfigError::KeyNotFound(key.to_path_buf())),
            Some(key) => key,
            None => cert,
        };
        Ok((cert, key))
    }
}

/// Errors treated as the peer going away during TLS setup.
///
/// Which OS error codes show up here depends on the platform and the TLS
/// library, so extra raw codes can be added on top of the default kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenignErrors {
    kinds: Vec<io::ErrorKind>,
    os_codes: Vec<i32>,
}

impl Default for BenignErrors {
    fn default() -> Self {
        Self {
            kinds: vec![
                io::ErrorKind::ConnectionAborted,
                io::ErrorKind::ConnectionReset,
                io::ErrorKind::NotConnected,
                // EINVAL from getpeername on a socket the peer already closed.
                io::ErrorKind::InvalidInput,
                io::ErrorKind::UnexpectedEof,
            ],
            os_codes: Vec::new(),
        }
    }
}

impl BenignErrors {
    /// An empty set: every setup failure is unexpected.
    pub fn none() -> Self {
        Self {
            kinds: Vec::new(),
            os_codes: Vec::new(),
        }
    }

    /// Also treat these raw OS error codes as benign.
    pub fn with_os_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        for code in codes {
            if !self.os_codes.contains(&code) {
                self.os_codes.push(code);
            }
        }
        self
    }

    pub fn is_benign(&self, err: &io::Error) -> bool {
        if let Some(code) = err.raw_os_error() {
            if self.os_codes.contains(&code) {
                return true;
            }
        }
        self.kinds.contains(&err.kind())
    }
}

/// Failure during accept-time transport setup.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer went away; the connection is closed and nothing else happens.
    #[error("peer disconnected during TLS setup: {0}")]
    Benign(#[source] io::Error),

    #[error("TLS setup failed: {0}")]
    Unexpected(#[source] io::Error),
}

impl TransportError {
    pub fn is_benign(&self) -> bool {
        matches!(self, TransportError::Benign(_))
    }
}

/// A connection ready to be wrapped in a `Stream`.
pub enum Transport {
    Plain(TcpStream),
    /// TLS session prepared; handshake still pending.
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::Accept<TcpStream>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(s) => f.debug_tuple("Plain").field(s).finish(),
            #[cfg(feature = "tls")]
            Transport::Tls(_) => f.write_str("Tls(<handshake pending>)"),
        }
    }
}

/// Loaded TLS server state, shared by every accepted connection.
#[derive(Clone)]
pub struct TlsSettings {
    #[cfg(feature = "tls")]
    acceptor: tokio_rustls::TlsAcceptor,
}

impl TlsSettings {
    /// Validate `options` and load the certificate chain and key.
    pub fn load(options: &TlsOptions) -> Result<Self, ConfigError> {
        let (cert, key) = options.validate()?;
        Self::load_pem(cert, key)
    }

    #[cfg(feature = "tls")]
    fn load_pem(cert: &Path, key: &Path) -> Result<Self, ConfigError> {
        use std::sync::Arc;
        use tokio_rustls::rustls::{self, ServerConfig};

        let certs = pem::load_certs(cert)?;
        let key_der = pem::load_private_key(key)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ConfigError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key_der)
            .map_err(|e| ConfigError::Tls(e.to_string()))?;

        tracing::info!(cert = %cert.display(), key = %key.display(), "TLS material loaded");
        Ok(Self {
            acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        })
    }

    #[cfg(not(feature = "tls"))]
    fn load_pem(_cert: &Path, _key: &Path) -> Result<Self, ConfigError> {
        Err(ConfigError::TlsUnsupported)
    }
}

#[cfg(feature = "tls")]
mod pem {
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;

    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

    use crate::config::ConfigError;

    fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
        File::open(path)
            .map(BufReader::new)
            .map_err(|source| ConfigError::TlsMaterial {
                path: path.to_path_buf(),
                source,
            })
    }

    pub(super) fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
        let mut reader = open(path)?;
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ConfigError::TlsMaterial {
                path: path.to_path_buf(),
                source,
            })?;
        if certs.is_empty() {
            return Err(ConfigError::NoCertificates(path.to_path_buf()));
        }
        Ok(certs)
    }

    pub(super) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
        let mut reader = open(path)?;
        rustls_pemfile::private_key(&mut reader)
            .map_err(|source| ConfigError::TlsMaterial {
                path: path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| ConfigError::NoPrivateKey(path.to_path_buf()))
    }
}

/// Accept-time transport preparation.
#[derive(Clone, Default)]
pub struct TransportNegotiator {
    tls: Option<TlsSettings>,
    benign: BenignErrors,
}

impl TransportNegotiator {
    pub fn new(tls: Option<TlsSettings>, benign: BenignErrors) -> Self {
        Self { tls, benign }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Prepare `connection` for a `Stream`.
    ///
    /// On error the connection has already been closed. A
    /// [`TransportError::Benign`] needs no further action.
    pub fn negotiate(&self, connection: TcpStream, peer: SocketAddr) -> Result<Transport, TransportError> {
        let Some(tls) = &self.tls else {
            return Ok(Transport::Plain(connection));
        };

        if let Err(e) = probe(&connection) {
            drop(connection);
            if self.benign.is_benign(&e) {
                tracing::debug!(%peer, error = %e, "Peer went away during TLS setup");
                return Err(TransportError::Benign(e));
            }
            return Err(TransportError::Unexpected(e));
        }

        Ok(tls.prepare(connection))
    }
}

impl TlsSettings {
    #[cfg(feature = "tls")]
    fn prepare(&self, connection: TcpStream) -> Transport {
        Transport::Tls(self.acceptor.accept(connection))
    }

    #[cfg(not(feature = "tls"))]
    fn prepare(&self, connection: TcpStream) -> Transport {
        // Unreachable in practice: `load` refuses to build settings without TLS support.
        Transport::Plain(connection)
    }
}

/// Surface a pending socket error or a peer that is already gone.
fn probe(connection: &TcpStream) -> io::Result<()> {
    if let Some(e) = connection.take_error()? {
        return Err(e);
    }
    connection.peer_addr().map(|_| ())
}
