//! Transport abstraction for the resilient network layer
//!
//! Defines the `Transport` capability the request executor sends through. The
//! executor never touches HTTP directly: it hands a `TransportRequest` to a
//! transport and interprets the `TransportResponse` (status + body) or the
//! `TransportError` that comes back. `HttpTransport` is the reqwest-backed
//! implementation; tests substitute scripted transports.

pub mod classify;
pub mod http;

pub use classify::{ErrorClassification, classify_response, classify_status, classify_transport_error};
pub use http::HttpTransport;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;

/// Request payload.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    /// Serialized as `application/json`
    Json(serde_json::Value),
    /// Raw payload with an explicit content type (uploads)
    Bytes { content_type: String, data: Bytes },
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

/// A single transport-level call.
///
/// `path` is appended to the transport's base URL unless it is already an
/// absolute `http(s)://` URL.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Body,
    pub timeout: Duration,
}

/// Raw outcome of a transport call that reached the server.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Server-provided retry hint, in seconds.
    ///
    /// Reads the `Retry-After` header (delta-seconds form only), falling back
    /// to a numeric `retryAfter` / `retry_after` field at the top level of a
    /// JSON body or under its `error` object.
    pub fn retry_after(&self) -> Option<Duration> {
        if let Some(secs) = self
            .headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            return Some(Duration::from_secs(secs));
        }

        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        [&value, &value["error"]].into_iter().find_map(|v| {
            v.get("retryAfter")
                .or_else(|| v.get("retry_after"))
                .and_then(|s| s.as_f64())
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
        })
    }
}

/// Failures where no HTTP status was obtained.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("response body read failed: {0}")]
    Body(String),

    #[error("request could not be built: {0}")]
    Request(String),
}

/// Result alias for transport calls.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Capability that sends a request and returns a status + body.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>>;
}
