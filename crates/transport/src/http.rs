//! reqwest-backed transport
//!
//! Resolves the request path against a base URL, strips hop-by-hop headers,
//! applies the per-call timeout and maps reqwest failures onto
//! `TransportError` so the classifier never sees a raw reqwest error.

use std::future::Future;
use std::pin::Pin;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use tracing::{debug, instrument};

use crate::{Body, Result, Transport, TransportError, TransportRequest, TransportResponse};

/// Headers that must not be forwarded (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// HTTP transport over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a request path.
    pub fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    async fn send_inner(&self, request: TransportRequest) -> Result<TransportResponse> {
        let url = self.resolve(&request.path);

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name.as_str()) {
                headers.insert(name.clone(), value.clone());
            }
        }

        let builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(request.timeout);

        let builder = match request.body {
            Body::Empty => builder,
            Body::Json(value) => {
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| TransportError::Request(format!("serializing body: {e}")))?;
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                builder.body(bytes)
            }
            Body::Bytes { content_type, data } => {
                let value = HeaderValue::from_str(&content_type)
                    .map_err(|e| TransportError::Request(format!("invalid content type: {e}")))?;
                headers.insert(CONTENT_TYPE, value);
                builder.body(data)
            }
        };

        let response = builder
            .headers(headers)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| match map_reqwest_error(e, request.timeout) {
                TransportError::Timeout(d) => TransportError::Timeout(d),
                other => TransportError::Body(other.to_string()),
            })?;

        debug!(status, bytes = body.len(), "transport call completed");
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>> {
        Box::pin(self.send_inner(request))
    }
}

fn map_reqwest_error(error: reqwest::Error, timeout: std::time::Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else if error.is_builder() {
        TransportError::Request(error.to_string())
    } else {
        TransportError::Connect(error.to_string())
    }
}

/// Check if a header is hop-by-hop (stripped before sending)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use reqwest::Method;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn request(method: Method, path: &str, body: Body) -> TransportRequest {
        TransportRequest {
            method,
            path: path.to_string(),
            headers: HeaderMap::new(),
            body,
            timeout: Duration::from_secs(5),
        }
    }

    /// Start a server that echoes method, path, headers and body as JSON.
    async fn start_echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app = axum::Router::new()
                .route(
                    "/slow",
                    axum::routing::get(|| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        "late"
                    }),
                )
                .route(
                    "/limited",
                    axum::routing::get(|| async {
                        (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "2")], "slow down")
                    }),
                )
                .fallback(|request: axum::http::Request<axum::body::Body>| async move {
                    let mut headers_map = serde_json::Map::new();
                    for (name, value) in request.headers() {
                        headers_map.insert(
                            name.to_string(),
                            serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                        );
                    }
                    let method = request.method().to_string();
                    let path = request.uri().path().to_string();
                    let body_bytes = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                        .await
                        .unwrap();
                    axum::Json(serde_json::json!({
                        "headers": headers_map,
                        "method": method,
                        "path": path,
                        "body": String::from_utf8_lossy(&body_bytes),
                    }))
                });
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
    }

    #[test]
    fn resolve_joins_base_and_path() {
        let transport = HttpTransport::new(reqwest::Client::new(), "https://api.example.com/");
        assert_eq!(
            transport.resolve("/v1/orders"),
            "https://api.example.com/v1/orders"
        );
        assert_eq!(
            transport.resolve("v1/orders"),
            "https://api.example.com/v1/orders"
        );
        assert_eq!(
            transport.resolve("https://cdn.example.com/file"),
            "https://cdn.example.com/file"
        );
    }

    #[tokio::test]
    async fn sends_json_body_and_headers() {
        let (url, _server) = start_echo_server().await;
        let transport = HttpTransport::new(reqwest::Client::new(), url);

        let mut req = request(
            Method::POST,
            "/orders",
            Body::Json(serde_json::json!({"sku": "A-1"})),
        );
        req.headers
            .insert("authorization", HeaderValue::from_static("Bearer at_1"));
        req.headers
            .insert("connection", HeaderValue::from_static("keep-alive"));

        let resp = transport.send(req).await.unwrap();
        assert_eq!(resp.status, 200);

        let echoed: serde_json::Value = resp.json().unwrap();
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["path"], "/orders");
        assert_eq!(echoed["headers"]["authorization"], "Bearer at_1");
        assert_eq!(echoed["headers"]["content-type"], "application/json");
        assert_eq!(echoed["body"], r#"{"sku":"A-1"}"#);
    }

    #[tokio::test]
    async fn sends_raw_bytes_with_content_type() {
        let (url, _server) = start_echo_server().await;
        let transport = HttpTransport::new(reqwest::Client::new(), url);

        let req = request(
            Method::PUT,
            "/avatar",
            Body::Bytes {
                content_type: "image/png".into(),
                data: bytes::Bytes::from_static(b"png"),
            },
        );
        let resp = transport.send(req).await.unwrap();
        let echoed: serde_json::Value = resp.json().unwrap();
        assert_eq!(echoed["headers"]["content-type"], "image/png");
        assert_eq!(echoed["body"], "png");
    }

    #[tokio::test]
    async fn non_success_status_is_returned_not_errored() {
        let (url, _server) = start_echo_server().await;
        let transport = HttpTransport::new(reqwest::Client::new(), url);

        let resp = transport
            .send(request(Method::GET, "/limited", Body::Empty))
            .await
            .unwrap();
        assert_eq!(resp.status, 429);
        assert_eq!(resp.retry_after(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn timeout_maps_to_timeout_error() {
        let (url, _server) = start_echo_server().await;
        let transport = HttpTransport::new(reqwest::Client::new(), url);

        let mut req = request(Method::GET, "/slow", Body::Empty);
        req.timeout = Duration::from_millis(100);
        let err = transport.send(req).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn dead_upstream_maps_to_connect_error() {
        // Bind then drop to obtain a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(reqwest::Client::new(), format!("http://{addr}"));
        let err = transport
            .send(request(Method::GET, "/", Body::Empty))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "got: {err:?}");
    }
}
