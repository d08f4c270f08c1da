//! Caller-facing error taxonomy
//!
//! Transport failures never reach callers raw. Each failed request ends in
//! exactly one of these kinds so UI code can branch on the variant instead of
//! matching message strings.

use std::time::Duration;

use transport::ErrorClassification;

/// Terminal failure of a logical request.
///
/// `Clone` because one failure (e.g. a failed refresh, or a session clear)
/// is delivered to many waiting requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// 401 on a request that bypasses credential refresh
    #[error("unauthorized")]
    Unauthorized,

    /// The refresh itself failed, or the refreshed credential was rejected
    #[error("session expired")]
    SessionExpired,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error (status {status})")]
    ServerError { status: u16 },

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request queue is full")]
    QueueFull,

    #[error("request cancelled")]
    Cancelled,

    /// Application-level failure carried inside a 2xx response
    #[error("business error: {message}")]
    Business { code: Option<i64>, message: String },

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Map a final attempt classification to the caller-facing kind.
    ///
    /// `detail` is kept for kinds that carry a message.
    pub fn from_classification(classification: ErrorClassification, detail: &str) -> Self {
        match classification {
            ErrorClassification::Unauthorized => Error::Unauthorized,
            ErrorClassification::Forbidden => Error::Forbidden,
            ErrorClassification::NotFound => Error::NotFound,
            ErrorClassification::RateLimited { retry_after } => Error::RateLimited { retry_after },
            ErrorClassification::ServerError { status } => Error::ServerError { status },
            ErrorClassification::NetworkUnreachable => Error::NetworkUnreachable(detail.to_string()),
            ErrorClassification::Cancelled => Error::Cancelled,
            ErrorClassification::Unknown { status: Some(status) } => {
                Error::Unknown(format!("unexpected status {status}: {detail}"))
            }
            ErrorClassification::Unknown { status: None } => Error::Unknown(detail.to_string()),
        }
    }

    /// Stable snake_case kind for logs, metrics and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unauthorized => "unauthorized",
            Error::SessionExpired => "session_expired",
            Error::Forbidden => "forbidden",
            Error::NotFound => "not_found",
            Error::RateLimited { .. } => "rate_limited",
            Error::ServerError { .. } => "server_error",
            Error::NetworkUnreachable(_) => "network_unreachable",
            Error::QueueFull => "queue_full",
            Error::Cancelled => "cancelled",
            Error::Business { .. } => "business_error",
            Error::Unknown(_) => "unknown",
        }
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_maps_to_kind() {
        assert_eq!(
            Error::from_classification(ErrorClassification::Forbidden, ""),
            Error::Forbidden
        );
        assert_eq!(
            Error::from_classification(ErrorClassification::ServerError { status: 503 }, ""),
            Error::ServerError { status: 503 }
        );
        assert_eq!(
            Error::from_classification(ErrorClassification::NetworkUnreachable, "connection refused"),
            Error::NetworkUnreachable("connection refused".into())
        );
        assert_eq!(
            Error::from_classification(
                ErrorClassification::RateLimited {
                    retry_after: Some(Duration::from_secs(2))
                },
                ""
            ),
            Error::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
    }

    #[test]
    fn unknown_status_keeps_status_in_message() {
        let err = Error::from_classification(ErrorClassification::Unknown { status: Some(418) }, "teapot");
        assert_eq!(err.to_string(), "unknown error: unexpected status 418: teapot");
    }

    #[test]
    fn kinds_are_distinct() {
        let all = [
            Error::Unauthorized,
            Error::SessionExpired,
            Error::Forbidden,
            Error::NotFound,
            Error::RateLimited { retry_after: None },
            Error::ServerError { status: 500 },
            Error::NetworkUnreachable(String::new()),
            Error::QueueFull,
            Error::Cancelled,
            Error::Business {
                code: None,
                message: String::new(),
            },
            Error::Unknown(String::new()),
        ];
        let mut kinds: Vec<_> = all.iter().map(Error::kind).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), all.len());
    }

    #[test]
    fn business_error_display_uses_message() {
        let err = Error::Business {
            code: Some(4001),
            message: "insufficient balance".into(),
        };
        assert_eq!(err.to_string(), "business error: insufficient balance");
    }
}
