//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Construct server (TLS checked) → Bind listeners
//!
//! Fan-out (fanout.rs):
//!     start(n) → fork workers → each worker registers its sockets
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → stop() → drain in-flight connections → exit
//! ```
//!
//! # Design Decisions
//! - Everything that can fail on bad input happens before the fork
//! - Shutdown has a grace period, then the process exits regardless

pub mod fanout;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use fanout::{cpu_count, resolve_worker_count, FanoutError, ForkFanout, ProcessFanout};
pub use shutdown::graceful_stop;
