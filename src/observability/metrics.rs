//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, route, status
//! - `gateway_request_duration_seconds` (histogram): dispatch latency
//! - `gateway_cgi_invocations_total` (counter): subprocess runs by outcome
//!
//! # Design Decisions
//! - Labels for method, route pattern, status code
//! - Recording works with or without the exporter installed

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape listener.
pub fn init_metrics(address: SocketAddr) {
    match PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
    {
        Ok(()) => tracing::info!(address = %address, "metrics exporter listening"),
        Err(error) => tracing::error!(%error, "failed to install metrics exporter"),
    }
}

/// Record one dispatched request.
pub fn record_request(method: &str, route: &str, status: u16, started: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("status", status.to_string()),
    ];
    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());
}

/// Record one CGI subprocess run by outcome.
pub fn record_cgi_invocation(outcome: &'static str) {
    counter!("gateway_cgi_invocations_total", "outcome" => outcome).increment(1);
}
