//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (backlog > 0, chunk size within buffer size)
//! - Check addresses that are parsed later (metrics endpoint)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - TLS file checks happen at server construction, not here, so that
//!   programmatic callers get the same checks

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ServerConfig;
use crate::net::stream::StreamOptions;

/// A single semantic problem in a config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listeners.is_empty() {
        errors.push(ValidationError::new("listeners", "at least one listener is required"));
    }

    for (i, listener) in config.listeners.iter().enumerate() {
        if listener.backlog == 0 {
            errors.push(ValidationError::new(format!("listeners[{i}].backlog"), "must be greater than 0"));
        }
    }

    check_stream_options(&config.stream, &mut errors);

    if let Some(addr) = config.observability.metrics_address.as_deref() {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "observability.metrics_address",
                format!("'{addr}' is not a socket address"),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Size limits every `Stream` is built with. Also checked by `TcpServer::new`.
pub fn validate_stream_options(options: &StreamOptions) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_stream_options(options, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_stream_options(options: &StreamOptions, errors: &mut Vec<ValidationError>) {
    if options.max_buffer_size == 0 {
        errors.push(ValidationError::new("stream.max_buffer_size", "must be greater than 0"));
    }
    if options.read_chunk_size == 0 {
        errors.push(ValidationError::new("stream.read_chunk_size", "must be greater than 0"));
    } else if options.read_chunk_size > options.max_buffer_size {
        errors.push(ValidationError::new(
            "stream.read_chunk_size",
            "must not exceed stream.max_buffer_size",
        ));
    }
}
