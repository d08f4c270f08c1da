//! Client metrics
//!
//! - `client_requests_total` (counter): label `outcome` (`success` or an error kind)
//! - `client_request_duration_seconds` (histogram): label `outcome`
//! - `client_retries_total` (counter): label `classification`
//! - `client_refresh_total` (counter): label `result`
//! - `client_offline_queue_depth` (gauge)
//!
//! Without an installed recorder these are no-ops, so embedders that do not
//! export metrics pay nothing.

/// Histogram name, exported so exporters can configure buckets for it.
pub const REQUEST_DURATION: &str = "client_request_duration_seconds";

/// Record a logical request reaching a terminal state.
pub fn record_request(outcome: &'static str, duration_secs: f64) {
    metrics::counter!("client_requests_total", "outcome" => outcome).increment(1);
    metrics::histogram!(REQUEST_DURATION, "outcome" => outcome).record(duration_secs);
}

/// Record a scheduled retry.
pub fn record_retry(classification: &'static str) {
    metrics::counter!("client_retries_total", "classification" => classification).increment(1);
}

/// Record a completed credential refresh (`success` or `failure`).
pub fn record_refresh(result: &'static str) {
    metrics::counter!("client_refresh_total", "result" => result).increment(1);
}

pub fn set_queue_depth(depth: usize) {
    metrics::gauge!("client_offline_queue_depth").set(depth as f64);
}
