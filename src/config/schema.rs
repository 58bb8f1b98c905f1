//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML. Every field
//! has a default except the listener list, which validation requires.

use serde::{Deserialize, Serialize};

use crate::net::listener::{AddressFamily, DEFAULT_BACKLOG};
use crate::net::stream::StreamOptions;
use crate::net::tls::{BenignErrors, TlsOptions};
use crate::observability::logging::LogFormat;
use crate::server::ServerOptions;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Worker processes. `1` runs in-process, `0` forks one per CPU core.
    pub workers: usize,

    /// Sockets to bind before starting.
    pub listeners: Vec<ListenerConfig>,

    /// Optional TLS on every accepted connection.
    pub tls: Option<TlsConfig>,

    /// Limits forwarded to each stream.
    pub stream: StreamOptions,

    pub observability: ObservabilityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            listeners: Vec::new(),
            tls: None,
            stream: StreamOptions::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Options for constructing a `TcpServer` from this config.
    pub fn server_options(&self) -> ServerOptions {
        let benign = match &self.tls {
            Some(tls) => BenignErrors::default().with_os_codes(tls.benign_os_errors.iter().copied()),
            None => BenignErrors::default(),
        };
        ServerOptions {
            tls: self.tls.as_ref().map(|t| t.options.clone()),
            stream: self.stream,
            benign_errors: benign,
        }
    }
}

/// One `bind` call.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub port: u16,

    /// Host or IP to bind; absent or empty means all interfaces.
    pub address: Option<String>,

    pub family: AddressFamily,

    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 8888,
            address: None,
            family: AddressFamily::Unspec,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// TLS section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(flatten)]
    pub options: TlsOptions,

    /// Raw OS error codes to treat as a peer disconnect during TLS setup,
    /// in addition to the built-in set.
    #[serde(default)]
    pub benign_os_errors: Vec<i32>,
}

/// Logging and metrics settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` overrides it.
    pub log_filter: String,

    pub log_format: LogFormat,

    /// Prometheus scrape address, e.g. "127.0.0.1:9000".
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "tcp_server=info".to_string(),
            log_format: LogFormat::Compact,
            metrics_address: None,
        }
    }
}
