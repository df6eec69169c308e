//! Metrics collection and export for hail.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use hail_core::RouterStats;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "hail_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "hail_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "hail_connections_rejected_total";
    pub const EVENTS_TOTAL: &str = "hail_events_total";
    pub const MESSAGES_TOTAL: &str = "hail_messages_total";
    pub const MESSAGES_BYTES: &str = "hail_messages_bytes";
    pub const NEGOTIATIONS_ACTIVE: &str = "hail_negotiations_active";
    pub const LATENCY_SECONDS: &str = "hail_latency_seconds";
    pub const ERRORS_TOTAL: &str = "hail_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused at the connection ceiling"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Inbound events by name and outcome");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(
        names::NEGOTIATIONS_ACTIVE,
        "Bid timers currently armed"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Event handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused at capacity.
pub fn record_rejection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a handled event.
pub fn record_event(event: &str, outcome: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => event.to_string(), "outcome" => outcome).increment(1);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Publish router gauges.
pub fn record_stats(stats: RouterStats) {
    gauge!(names::NEGOTIATIONS_ACTIVE).set(stats.negotiation_count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_event("homemap", "ok");
        record_stats(RouterStats {
            connection_count: 1,
            negotiation_count: 2,
        });
    }
}
