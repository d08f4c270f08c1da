//! Upstream reachability probe
//!
//! A TCP connect to the upstream host is the agent's connectivity signal: if
//! the handshake completes within the timeout we are online. Results feed the
//! `WatchConnectivity` the client and its reconnect listener observe.

use std::sync::Arc;
use std::time::Duration;

use resilient_client::WatchConnectivity;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

/// Whether a TCP connection to `addr` completes within `timeout`.
pub async fn probe(addr: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(addr, error = %e, "probe connect failed");
            false
        }
        Err(_) => {
            debug!(addr, timeout_ms = timeout.as_millis() as u64, "probe timed out");
            false
        }
    }
}

/// Probe `addr` every `interval` and publish the result.
///
/// The first probe runs immediately so a fresh agent does not report a stale
/// flag for a whole interval.
pub fn spawn_probe_task(
    monitor: Arc<WatchConnectivity>,
    addr: String,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let connected = probe(&addr, timeout).await;
            monitor.set_connected(connected);
            crate::metrics::set_upstream_connected(connected);
        }
    })
}
