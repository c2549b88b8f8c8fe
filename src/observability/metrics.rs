//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): logical requests by method, status
//! - `proxy_request_duration_seconds` (histogram): end-to-end latency, retries included
//! - `proxy_upstream_attempts_total` (counter): pipeline attempts by kind
//! - `proxy_retries_total` (counter): scheduled retries by reason
//! - `proxy_retry_disabled_total` (counter): requests where retry was bypassed
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so library users
//!   and tests pay nothing
//! - Labels stay low-cardinality: no paths, no hosts

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
///
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to install metrics exporter"),
    }
}

/// One finished logical request.
pub fn record_request(method: &str, status: u16, start: Instant) {
    metrics::counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("proxy_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

/// One pipeline attempt started. `kind` is `initial`, `retry` or `replay`.
pub fn record_attempt(kind: &'static str) {
    metrics::counter!("proxy_upstream_attempts_total", "outcome" => kind).increment(1);
}

/// One retry scheduled by the built-in policy. `reason` is `status` or `error`.
pub fn record_retry(reason: &'static str) {
    metrics::counter!("proxy_retries_total", "reason" => reason).increment(1);
}

/// Retry bypassed for a logical request.
pub fn record_retry_disabled(reason: &'static str) {
    metrics::counter!("proxy_retry_disabled_total", "reason" => reason).increment(1);
}
