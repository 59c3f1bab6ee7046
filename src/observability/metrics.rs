//! Metrics collection and exposition.
//!
//! # Metrics
//! - `lload_connections_total{role}` (counter): connections created
//! - `lload_connections_active{role}` (gauge): connections not yet destroyed
//! - `lload_operations_total{op}` (counter): client requests by type
//! - `lload_operations_rejected_total{result}` (counter): results generated
//!   by the proxy instead of a backend
//! - `lload_upstream_connect_attempts_total{backend}` (counter)
//! - `lload_upstream_connect_failures_total{backend}` (counter)
//! - `lload_operations_timed_out_total` (counter)
//!
//! # Design Decisions
//! - Labels are low-cardinality: role, request type, result code, backend
//! - The Prometheus exporter runs its own HTTP listener

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_opened(role: &'static str) {
    ::metrics::counter!("lload_connections_total", "role" => role).increment(1);
    ::metrics::gauge!("lload_connections_active", "role" => role).increment(1.0);
}

pub fn record_connection_closed(role: &'static str) {
    ::metrics::gauge!("lload_connections_active", "role" => role).decrement(1.0);
}

pub fn record_operation(op: &'static str) {
    ::metrics::counter!("lload_operations_total", "op" => op).increment(1);
}

pub fn record_rejected(code: i32) {
    ::metrics::counter!("lload_operations_rejected_total", "result" => code.to_string()).increment(1);
}

pub fn record_connect_attempt(backend: &str) {
    ::metrics::counter!(
        "lload_upstream_connect_attempts_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

pub fn record_connect_failure(backend: &str) {
    ::metrics::counter!(
        "lload_upstream_connect_failures_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

pub fn record_timed_out() {
    ::metrics::counter!("lload_operations_timed_out_total").increment(1);
}
