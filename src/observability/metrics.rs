//! Acceptor metrics.
//!
//! # Metrics
//! - `tcp_server_connections_accepted_total` (counter)
//! - `tcp_server_benign_closes_total` (counter): peers gone during TLS setup
//! - `tcp_server_transport_errors_total` (counter): unexpected TLS setup failures
//! - `tcp_server_handler_errors_total` (counter): failures caught by the error boundary
//! - `tcp_server_listening_sockets` (gauge)
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_accepted() {
    counter!("tcp_server_connections_accepted_total").increment(1);
}

pub fn record_benign_close() {
    counter!("tcp_server_benign_closes_total").increment(1);
}

pub fn record_transport_error() {
    counter!("tcp_server_transport_errors_total").increment(1);
}

/// `kind` is `"error"` or `"panic"`.
pub fn record_handler_error(kind: &'static str) {
    counter!("tcp_server_handler_errors_total", "kind" => kind).increment(1);
}

pub fn set_listening_sockets(count: usize) {
    gauge!("tcp_server_listening_sockets").set(count as f64);
}
