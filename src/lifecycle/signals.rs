//! OS signal handling.
//!
//! SIGINT and SIGTERM both request a graceful stop.

use std::io;

use tokio::signal::unix::{signal, SignalKind};

/// Wait for SIGINT or SIGTERM. Returns the signal name.
pub async fn shutdown_signal() -> io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    tracing::info!(signal = name, "Shutdown signal received");
    Ok(name)
}
