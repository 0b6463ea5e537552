//! Metrics collection and export for roomcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use roomcast_core::{CloseReason, HubError, HubStats};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "roomcast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "roomcast_connections_active";
    pub const HANDSHAKE_FAILURES_TOTAL: &str = "roomcast_handshake_failures_total";
    pub const HANDSHAKE_SECONDS: &str = "roomcast_handshake_seconds";
    pub const FRAMES_TOTAL: &str = "roomcast_frames_total";
    pub const EVENTS_PUBLISHED_TOTAL: &str = "roomcast_events_published_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "roomcast_publish_failures_total";
    pub const CLOSES_TOTAL: &str = "roomcast_closes_total";
    pub const ROOMS_ACTIVE: &str = "roomcast_rooms_active";
    pub const BROKER_FEEDS_ACTIVE: &str = "roomcast_broker_feeds_active";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of accepted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::HANDSHAKE_FAILURES_TOTAL,
        "Handshakes refused, by error kind"
    );
    metrics::describe_histogram!(names::HANDSHAKE_SECONDS, "Handshake latency in seconds");
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames processed, by direction");
    metrics::describe_counter!(
        names::EVENTS_PUBLISHED_TOTAL,
        "Events published by clients, by kind"
    );
    metrics::describe_counter!(
        names::PUBLISH_FAILURES_TOTAL,
        "Failed client requests, by error kind"
    );
    metrics::describe_counter!(names::CLOSES_TOTAL, "Connection closes, by reason");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with local members");
    metrics::describe_gauge!(
        names::BROKER_FEEDS_ACTIVE,
        "Broker channels this instance consumes"
    );

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

/// Record a completed handshake.
pub fn record_handshake(seconds: f64) {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    histogram!(names::HANDSHAKE_SECONDS).record(seconds);
}

/// Record a refused handshake.
pub fn record_handshake_failure(kind: &'static str) {
    counter!(names::HANDSHAKE_FAILURES_TOTAL, "kind" => kind).increment(1);
}

/// Record a frame.
pub fn record_frame(direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
}

/// Record a published event.
pub fn record_published(kind: &'static str) {
    counter!(names::EVENTS_PUBLISHED_TOTAL, "kind" => kind).increment(1);
}

/// Record a failed request.
pub fn record_failure(error: &HubError) {
    counter!(names::PUBLISH_FAILURES_TOTAL, "kind" => error.kind()).increment(1);
}

/// Record why a connection ended.
pub fn record_close(reason: CloseReason) {
    let reason = match reason {
        CloseReason::ClientClosed => "client_closed",
        CloseReason::IdleTimeout => "idle_timeout",
        CloseReason::Backpressure => "backpressure",
        CloseReason::Shutdown => "shutdown",
    };
    counter!(names::CLOSES_TOTAL, "reason" => reason).increment(1);
}

/// Publish hub gauges.
pub fn set_hub_stats(stats: &HubStats) {
    gauge!(names::CONNECTIONS_ACTIVE).set(stats.connections as f64);
    gauge!(names::ROOMS_ACTIVE).set(stats.rooms as f64);
    gauge!(names::BROKER_FEEDS_ACTIVE).set(stats.broker_feeds as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_protocol::ConnectionId;

    #[test]
    fn test_recording_without_exporter() {
        // No recorder installed; every call is a no-op
        init_metrics();
        record_handshake(0.01);
        record_failure(&HubError::ConnectionNotFound(ConnectionId::new("c1")));
        record_close(CloseReason::Backpressure);
        set_hub_stats(&HubStats {
            connections: 1,
            rooms: 2,
            memberships: 2,
            broker_feeds: 2,
            tracked_identities: 1,
        });
    }
}
