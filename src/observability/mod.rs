//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! listener / registry / dispatcher
//!     → logging.rs (tracing events, one span per connection)
//!     → metrics.rs (accept, benign close and error counters)
//! ```
//!
//! # Design Decisions
//! - Per-connection failures are logged, never raised
//! - Benign disconnects log at debug only

pub mod logging;
pub mod metrics;
