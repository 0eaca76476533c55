//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use huddle_core::RouterStats;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const EVENTS_TOTAL: &str = "huddle_events_total";
    pub const REJECTIONS_TOTAL: &str = "huddle_rejections_total";
    pub const OUTBOUND_FRAMES_TOTAL: &str = "huddle_outbound_frames_total";
    pub const OUTBOUND_BYTES: &str = "huddle_outbound_bytes";
    pub const SESSIONS_ACTIVE: &str = "huddle_sessions_active";
    pub const USERS_ONLINE: &str = "huddle_users_online";
    pub const DELIVERIES_TOTAL: &str = "huddle_deliveries_total";
    pub const DELIVERIES_DROPPED: &str = "huddle_deliveries_dropped";
    pub const GATEWAY_FAILURES: &str = "huddle_gateway_failures_total";
    pub const LATENCY_SECONDS: &str = "huddle_latency_seconds";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
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
    metrics::describe_counter!(names::EVENTS_TOTAL, "Inbound events by kind");
    metrics::describe_counter!(names::REJECTIONS_TOTAL, "Inbound events rejected by kind");
    metrics::describe_counter!(names::OUTBOUND_FRAMES_TOTAL, "Frames written to clients");
    metrics::describe_counter!(names::OUTBOUND_BYTES, "Bytes written to clients");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Connections that have joined");
    metrics::describe_gauge!(names::USERS_ONLINE, "Reachable usernames");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Events accepted by recipient queues");
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Events dropped for slow or departed recipients"
    );
    metrics::describe_counter!(names::GATEWAY_FAILURES, "Failed or timed out storage calls");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

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

/// Record an inbound event.
pub fn record_event(kind: &'static str) {
    counter!(names::EVENTS_TOTAL, "kind" => kind).increment(1);
}

/// Record a rejected inbound event.
pub fn record_rejection(kind: &'static str) {
    counter!(names::REJECTIONS_TOTAL, "kind" => kind).increment(1);
}

/// Record a frame written to a client.
pub fn record_outbound(bytes: usize) {
    counter!(names::OUTBOUND_FRAMES_TOTAL).increment(1);
    counter!(names::OUTBOUND_BYTES).increment(bytes as u64);
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Publish the router's current counters.
pub fn record_router_stats(stats: &RouterStats) {
    gauge!(names::SESSIONS_ACTIVE).set(stats.sessions as f64);
    gauge!(names::USERS_ONLINE).set(stats.online_users as f64);
    counter!(names::DELIVERIES_TOTAL).absolute(stats.delivered);
    counter!(names::DELIVERIES_DROPPED).absolute(stats.dropped);
    counter!(names::GATEWAY_FAILURES).absolute(stats.gateway_failures);
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
