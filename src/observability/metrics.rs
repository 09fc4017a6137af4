//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by mode and status class
//! - `proxy_request_duration_seconds` (histogram): latency by mode
//! - `proxy_upstream_errors_total` (counter): upstream failures by kind
//! - `proxy_client_aborts_total` (counter): exchanges cut short by the client
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so the pipeline
//!   records unconditionally and tests need no setup
//! - The Prometheus exporter serves its own HTTP listener

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    describe_counter!("proxy_requests_total", "Requests handled by the proxy middleware");
    describe_histogram!(
        "proxy_request_duration_seconds",
        "Time spent in the proxy middleware, in seconds"
    );
    describe_counter!("proxy_upstream_errors_total", "Failed upstream exchanges");
    describe_counter!("proxy_client_aborts_total", "Requests aborted by the client");

    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}

/// Record a finished request for `mode` (`skip`, `direct`, `transform`).
pub fn record_request(mode: &'static str, status: u16, start: Instant) {
    counter!("proxy_requests_total", "mode" => mode, "status" => status_class(status)).increment(1);
    histogram!("proxy_request_duration_seconds", "mode" => mode)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error(kind: &'static str) {
    counter!("proxy_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn record_client_abort() {
    counter!("proxy_client_aborts_total").increment(1);
}
