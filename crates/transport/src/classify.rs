//! Failure classification for transport outcomes
//!
//! Every failed attempt is classified exactly once, from either the HTTP status
//! of a non-2xx response or the transport error that prevented one. The
//! classification drives the executor: refresh on `Unauthorized`, retry on the
//! transient kinds, queue on `NetworkUnreachable`, fail on everything else.

use std::time::Duration;

use crate::{TransportError, TransportResponse};

/// Classification of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClassification {
    /// 401: credential rejected, recover through refresh
    Unauthorized,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 429, with the server's retry hint when present
    RateLimited { retry_after: Option<Duration> },
    /// 5xx
    ServerError { status: u16 },
    /// No response: timeout, refused or dropped connection, 408
    NetworkUnreachable,
    /// Attempt abandoned by the caller
    Cancelled,
    /// Any other non-success status
    Unknown { status: Option<u16> },
}

impl ErrorClassification {
    /// Transient kinds that a retry may fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorClassification::RateLimited { .. }
                | ErrorClassification::ServerError { .. }
                | ErrorClassification::NetworkUnreachable
        )
    }

    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Unauthorized => "unauthorized",
            ErrorClassification::Forbidden => "forbidden",
            ErrorClassification::NotFound => "not_found",
            ErrorClassification::RateLimited { .. } => "rate_limited",
            ErrorClassification::ServerError { .. } => "server_error",
            ErrorClassification::NetworkUnreachable => "network_unreachable",
            ErrorClassification::Cancelled => "cancelled",
            ErrorClassification::Unknown { .. } => "unknown",
        }
    }
}

/// Classify a non-success HTTP status.
///
/// `retry_after` is only consulted for 429.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> ErrorClassification {
    match status {
        401 => ErrorClassification::Unauthorized,
        403 => ErrorClassification::Forbidden,
        404 => ErrorClassification::NotFound,
        429 => ErrorClassification::RateLimited { retry_after },
        408 => ErrorClassification::NetworkUnreachable,
        500..=599 => ErrorClassification::ServerError { status },
        _ => ErrorClassification::Unknown {
            status: Some(status),
        },
    }
}

/// Classify a response that reached the server with a non-success status.
pub fn classify_response(response: &TransportResponse) -> ErrorClassification {
    let retry_after = if response.status == 429 {
        response.retry_after()
    } else {
        None
    };
    classify_status(response.status, retry_after)
}

/// Classify a failure where no status was obtained.
pub fn classify_transport_error(error: &TransportError) -> ErrorClassification {
    match error {
        TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Body(_) => {
            ErrorClassification::NetworkUnreachable
        }
        TransportError::Request(_) => ErrorClassification::Unknown { status: None },
    }
}
