//! Resilient request layer
//!
//! Sits between application code and a `Transport`. Every request goes through
//! `Client`, which attaches the session credential, refreshes it (once, shared)
//! on 401, retries transient failures with jittered exponential backoff, and
//! parks offline-eligible requests in a bounded priority queue until
//! connectivity returns. Callers see a response or exactly one `Error` kind.

pub mod client;
pub mod config;
pub mod connectivity;
pub mod descriptor;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod queue;
pub mod refresh;
pub mod retry;
pub mod timeout;

pub use client::{Client, ClientBuilder, ClientStats};
pub use config::ClientConfig;
pub use connectivity::{ConnectivityMonitor, WatchConnectivity, wait_for_connection};
pub use descriptor::{Priority, RequestDescriptor, RequestOptions};
pub use error::{Error, Result};
pub use handle::{Canceller, RequestHandle};
pub use queue::{DrainReport, RequestQueue};
pub use refresh::{RefreshCoordinator, SessionExpiredHook, spawn_refresh_task};
pub use retry::{RetryDecision, RetryPolicy};
pub use timeout::RttTracker;

/// Successful (or at least status-bearing) transport response.
pub use transport::TransportResponse as Response;
