//! Logical request descriptors
//!
//! A `RequestDescriptor` outlives individual transport attempts: it is what
//! gets retried, parked in the offline queue and replayed. Attempt counters
//! and per-request overrides travel with it.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use transport::Body;
use uuid::Uuid;

/// Offline queue priority. Higher priorities drain first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" | "normal" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Per-request options accepted by the client convenience methods.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Do not attach the credential and do not refresh on 401
    pub skip_auth: bool,
    /// Fail on the first error instead of consulting the retry policy
    pub skip_retry: bool,
    /// Override the policy's retry count
    pub max_retries: Option<u32>,
    /// Override the policy's base backoff delay
    pub retry_delay: Option<Duration>,
    /// Park the request in the offline queue instead of failing when offline
    pub offline_support: bool,
    pub priority: Priority,
    /// Fixed timeout instead of the adaptive one
    pub timeout: Option<Duration>,
    pub headers: HeaderMap,
}

impl RequestOptions {
    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn skip_retry(mut self) -> Self {
        self.skip_retry = true;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline_support = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One logical request, possibly spanning many transport attempts.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub id: Uuid,
    pub method: Method,
    pub path: String,
    pub body: Body,
    pub headers: HeaderMap,
    pub priority: Priority,
    /// 1-based number of the attempt currently in progress
    pub attempt: u32,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub created_at: Instant,
    pub skip_auth: bool,
    pub skip_retry: bool,
    pub offline_eligible: bool,
    pub timeout: Option<Duration>,
    /// Uploads get a longer adaptive timeout floor
    pub upload: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>, body: Body, options: RequestOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            path: path.into(),
            body,
            headers: options.headers,
            priority: options.priority,
            attempt: 1,
            max_retries: options.max_retries,
            retry_delay: options.retry_delay,
            created_at: Instant::now(),
            skip_auth: options.skip_auth,
            skip_retry: options.skip_retry,
            offline_eligible: options.offline_support,
            timeout: options.timeout,
            upload: false,
        }
    }

    pub fn upload(
        method: Method,
        path: impl Into<String>,
        content_type: impl Into<String>,
        data: bytes::Bytes,
        options: RequestOptions,
    ) -> Self {
        let body = Body::Bytes {
            content_type: content_type.into(),
            data,
        };
        Self {
            upload: true,
            ..Self::new(method, path, body, options)
        }
    }

    /// Replays start from a fresh retry budget.
    pub fn reset_for_replay(&mut self) {
        self.attempt = 1;
    }
}
