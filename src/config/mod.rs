//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → ServerConfig::server_options() → TcpServer::new
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; there is no reload
//! - All fields have defaults to allow minimal configs
//! - TLS material is checked when the server is constructed, not when the
//!   file is parsed

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::ConfigError;
pub use loader::load_config;
pub use schema::{ListenerConfig, ObservabilityConfig, ServerConfig, TlsConfig};
pub use validation::{validate_stream_options, ValidationError};
