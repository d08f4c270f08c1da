//! Connectivity signal
//!
//! The client only needs "are we online now" and "tell me when that changes".
//! `WatchConnectivity` backs both with a `tokio::sync::watch` channel; a probe
//! task or platform callback drives it through `set_connected`. Dropping a
//! receiver is the unsubscribe.

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

pub trait ConnectivityMonitor: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Receiver that observes every later change of the connected flag.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity flag shared through a watch channel.
#[derive(Debug)]
pub struct WatchConnectivity {
    tx: watch::Sender<bool>,
}

impl WatchConnectivity {
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_connected);
        Self { tx }
    }

    /// Update the flag. Returns `true` if it changed.
    pub fn set_connected(&self, connected: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
        if changed {
            info!(connected, "connectivity changed");
        }
        changed
    }
}

impl ConnectivityMonitor for WatchConnectivity {
    fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Wait up to `limit` for the monitor to report connectivity.
pub async fn wait_for_connection(monitor: &dyn ConnectivityMonitor, limit: Duration) -> bool {
    let mut rx = monitor.subscribe();
    if *rx.borrow_and_update() {
        return true;
    }
    matches!(
        tokio::time::timeout(limit, rx.wait_for(|connected| *connected)).await,
        Ok(Ok(_))
    )
}
