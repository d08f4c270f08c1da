//! Forwarding local calls through the resilient client
//!
//! Every request that does not hit an agent route is turned into a
//! `RequestDescriptor` and executed by the client, so local callers get
//! credential attach, refresh, retry and offline queueing without knowing
//! about any of it. Per-request behavior is selected with `x-*` headers;
//! failures come back as a JSON error body with a fixed status per kind.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use resilient_client::{Canceller, Client, Error, Priority, RequestDescriptor, RequestOptions};
use tracing::{instrument, warn};
use transport::Body;
use transport::http::is_hop_by_hop;

/// Largest request body accepted from a local caller.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const PRIORITY: &str = "x-priority";
const OFFLINE_SUPPORT: &str = "x-offline-support";
const SKIP_AUTH: &str = "x-skip-auth";
const SKIP_RETRY: &str = "x-skip-retry";
const MAX_RETRIES: &str = "x-max-retries";
const RETRY_DELAY_MS: &str = "x-retry-delay-ms";
const TIMEOUT_MS: &str = "x-timeout-ms";

const CONTROL_HEADERS: &[&str] = &[
    PRIORITY,
    OFFLINE_SUPPORT,
    SKIP_AUTH,
    SKIP_RETRY,
    MAX_RETRIES,
    RETRY_DELAY_MS,
    TIMEOUT_MS,
];

/// JSON error body: {"error":{"type":"<kind>","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Status returned to the local caller for each terminal error kind.
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Unauthorized | Error::SessionExpired => StatusCode::UNAUTHORIZED,
        Error::Forbidden => StatusCode::FORBIDDEN,
        Error::NotFound => StatusCode::NOT_FOUND,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::ServerError { .. } | Error::Unknown(_) => StatusCode::BAD_GATEWAY,
        Error::NetworkUnreachable(_) | Error::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        Error::Business { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        // nginx's "client closed request"
        Error::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
    }
}

/// Render a client error for the local caller.
pub fn client_error_response(error: &Error, request_id: &str) -> Response {
    let mut response = error_response(
        status_for(error),
        error.kind(),
        &error.to_string(),
        request_id,
    );
    if let Error::RateLimited {
        retry_after: Some(delay),
    } = error
    {
        let secs = delay.as_secs().max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

/// Parse the `x-*` control headers into request options.
pub fn options_from_headers(headers: &HeaderMap) -> Result<RequestOptions, String> {
    let mut options = RequestOptions::default();

    if let Some(priority) = header_str(headers, PRIORITY)? {
        options.priority = priority.parse::<Priority>()?;
    }
    options.offline_support = header_flag(headers, OFFLINE_SUPPORT)?;
    options.skip_auth = header_flag(headers, SKIP_AUTH)?;
    options.skip_retry = header_flag(headers, SKIP_RETRY)?;
    if let Some(retries) = header_number(headers, MAX_RETRIES)? {
        options.max_retries = Some(
            u32::try_from(retries).map_err(|_| format!("{MAX_RETRIES} is out of range"))?,
        );
    }
    if let Some(ms) = header_number(headers, RETRY_DELAY_MS)? {
        options.retry_delay = Some(Duration::from_millis(ms));
    }
    if let Some(ms) = header_number(headers, TIMEOUT_MS)? {
        if ms == 0 {
            return Err(format!("{TIMEOUT_MS} must be greater than 0"));
        }
        options.timeout = Some(Duration::from_millis(ms));
    }

    options.headers = forwarded_headers(headers, options.skip_auth);
    Ok(options)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, String> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map(str::trim)
                .map_err(|_| format!("{name} is not valid text"))
        })
        .transpose()
}

fn header_flag(headers: &HeaderMap, name: &str) -> Result<bool, String> {
    match header_str(headers, name)? {
        None => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
        Some(v) => Err(format!("{name} must be true or false, got: {v}")),
    }
}

fn header_number(headers: &HeaderMap, name: &str) -> Result<Option<u64>, String> {
    header_str(headers, name)?
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| format!("{name} must be a non-negative integer, got: {v}"))
        })
        .transpose()
}

/// Caller headers that travel upstream.
///
/// The body encoding sets its own content headers and the client owns the
/// authorization header unless the caller opted out of auth.
fn forwarded_headers(headers: &HeaderMap, skip_auth: bool) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || is_control_header(name) {
            continue;
        }
        if *name == header::HOST || *name == header::CONTENT_LENGTH || *name == header::CONTENT_TYPE
        {
            continue;
        }
        if *name == header::AUTHORIZATION && !skip_auth {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

fn is_control_header(name: &HeaderName) -> bool {
    CONTROL_HEADERS.contains(&name.as_str())
}

/// Build the descriptor for a forwarded call.
fn descriptor_for(
    method: axum::http::Method,
    path: String,
    content_type: Option<&str>,
    body: Bytes,
    options: RequestOptions,
) -> Result<RequestDescriptor, String> {
    if body.is_empty() {
        return Ok(RequestDescriptor::new(method, path, Body::Empty, options));
    }
    match content_type {
        Some(ct) if ct.starts_with("application/json") => {
            let value = serde_json::from_slice(&body).map_err(|e| format!("invalid JSON body: {e}"))?;
            Ok(RequestDescriptor::new(method, path, Body::Json(value), options))
        }
        Some(ct) if ct.starts_with("multipart/") || ct == "application/octet-stream" => {
            Ok(RequestDescriptor::upload(method, path, ct, body, options))
        }
        other => {
            let body = Body::Bytes {
                content_type: other.unwrap_or("application/octet-stream").to_string(),
                data: body,
            };
            Ok(RequestDescriptor::new(method, path, body, options))
        }
    }
}

/// Cancels the request if the local caller goes away before it settles.
struct CancelOnDrop(Canceller);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Forward one local request through the client.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn forward_request(
    client: &Client,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();

    let options = match options_from_headers(&parts.headers) {
        Ok(options) => options,
        Err(message) => {
            warn!(error = %message, "rejecting request with invalid control header");
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", &message, &request_id);
        }
    };

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let descriptor = match descriptor_for(method.clone(), path, content_type, body, options) {
        Ok(descriptor) => descriptor,
        Err(message) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", &message, &request_id);
        }
    };

    let handle = client.submit(descriptor);
    let _cancel_on_drop = CancelOnDrop(handle.canceller());

    let response = match handle.response().await {
        Ok(upstream) => upstream_response(upstream, &request_id),
        Err(error) => {
            warn!(kind = error.kind(), error = %error, "forwarded request failed");
            client_error_response(&error, &request_id)
        }
    };
    crate::metrics::record_forward(response.status().as_u16(), method.as_str());
    response
}

/// Relay an upstream response, minus hop-by-hop headers.
fn upstream_response(upstream: resilient_client::Response, request_id: &str) -> Response {
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) && *name != header::CONTENT_LENGTH {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "unknown",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}
