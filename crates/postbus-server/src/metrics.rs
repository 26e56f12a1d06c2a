//! Metrics collection and export for postbus.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use postbus_core::MessageBus;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Metric names.
pub mod names {
    pub const POLLS_TOTAL: &str = "postbus_polls_total";
    pub const POLLS_ACTIVE: &str = "postbus_polls_active";
    pub const POLL_LATENCY_SECONDS: &str = "postbus_poll_latency_seconds";
    pub const MESSAGES_PUBLISHED: &str = "postbus_messages_published_total";
    pub const MESSAGES_DELIVERED: &str = "postbus_messages_delivered_total";
    pub const PARKED_CLIENTS: &str = "postbus_parked_clients";
    pub const LISTENER_DEGRADED: &str = "postbus_listener_degraded";
    pub const LISTENER_RECONNECTS: &str = "postbus_listener_reconnects";
    pub const ERRORS_TOTAL: &str = "postbus_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(names::POLLS_TOTAL, "Total number of polls by outcome");
    metrics::describe_gauge!(names::POLLS_ACTIVE, "Polls currently being served");
    metrics::describe_histogram!(
        names::POLL_LATENCY_SECONDS,
        "Time from poll request to response in seconds"
    );
    metrics::describe_counter!(
        names::MESSAGES_PUBLISHED,
        "Total number of messages published over HTTP"
    );
    metrics::describe_counter!(
        names::MESSAGES_DELIVERED,
        "Total number of messages sent in poll responses"
    );
    metrics::describe_gauge!(names::PARKED_CLIENTS, "Current number of parked clients");
    metrics::describe_gauge!(
        names::LISTENER_DEGRADED,
        "1 while the substrate listener is disconnected"
    );
    metrics::describe_gauge!(
        names::LISTENER_RECONNECTS,
        "Listener reconnect attempts since start"
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

/// Record a finished poll.
pub fn record_poll(outcome: &str, delivered: usize) {
    counter!(names::POLLS_TOTAL, "outcome" => outcome.to_string()).increment(1);
    if delivered > 0 {
        counter!(names::MESSAGES_DELIVERED).increment(delivered as u64);
    }
}

/// Record an HTTP publish.
pub fn record_published() {
    counter!(names::MESSAGES_PUBLISHED).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Sample bus state into gauges every `interval`.
pub fn spawn_sampler(bus: Arc<MessageBus>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let status = bus.listener_status();
            gauge!(names::PARKED_CLIENTS).set(bus.connections().len() as f64);
            gauge!(names::LISTENER_DEGRADED).set(if status.is_degraded() { 1.0 } else { 0.0 });
            gauge!(names::LISTENER_RECONNECTS).set(status.reconnects() as f64);
        }
    })
}

/// Metrics guard that tracks an in-flight poll and records its latency on drop.
pub struct PollMetricsGuard {
    started: Instant,
}

impl PollMetricsGuard {
    /// Create a new metrics guard, recording a poll start.
    #[must_use]
    pub fn new() -> Self {
        gauge!(names::POLLS_ACTIVE).increment(1.0);
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for PollMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::POLLS_ACTIVE).decrement(1.0);
        histogram!(names::POLL_LATENCY_SECONDS).record(self.started.elapsed().as_secs_f64());
    }
}
