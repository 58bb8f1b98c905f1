//! Configuration errors.
//!
//! Everything here is fatal and surfaces before the server accepts anything:
//! bad config files as well as unusable TLS material.

use std::io;
use std::path::PathBuf;

use crate::config::validation::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("TLS configuration is missing `cert_path`")]
    MissingCertificate,

    #[error("certificate file {} does not exist", .0.display())]
    CertificateNotFound(PathBuf),

    #[error("key file {} does not exist", .0.display())]
    KeyNotFound(PathBuf),

    #[error("failed to read TLS material from {}: {source}", path.display())]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Tls(String),

    #[error("TLS requested but this build was compiled without the `tls` feature")]
    TlsUnsupported,
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
