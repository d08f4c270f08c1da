//! Prometheus metrics exposition
//!
//! The client crate records through the `metrics` facade; this module installs
//! the exporter and adds the agent's own series:
//!
//! - `agent_forwarded_total` (counter): labels `status`, `method`
//! - `agent_upstream_connected` (gauge): 1 when the last probe succeeded

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries for `client_request_duration_seconds`, 5ms to 120s so a
/// request that spent its whole backoff schedule still lands in a bucket.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(resilient_client::metrics::REQUEST_DURATION.to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a forwarded request with the status returned to the local caller.
pub fn record_forward(status: u16, method: &str) {
    metrics::counter!(
        "agent_forwarded_total",
        "status" => status.to_string(),
        "method" => method.to_string()
    )
    .increment(1);
}

pub fn set_upstream_connected(connected: bool) {
    metrics::gauge!("agent_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}
