//! Session endpoints
//!
//! `POST /session` installs a token pair obtained by the local app's own sign-in
//! flow; `DELETE /session` ends the session and rejects everything parked in the
//! offline queue.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::Secret;
use session_auth::{Credential, TokenResponse, now_millis};
use tracing::info;

use crate::AppState;
use crate::forward::{client_error_response, error_response};

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Turn a login body into a credential.
///
/// The body has the token endpoint's shape, but the refresh token is mandatory
/// since the agent must be able to renew the session on its own.
pub fn credential_from_login(token: TokenResponse) -> Result<Credential, String> {
    let refresh = match token.refresh_token.as_deref().map(str::trim) {
        Some(refresh) if !refresh.is_empty() => Secret::from(refresh),
        _ => return Err("refresh_token is required".into()),
    };
    if token.access_token.trim().is_empty() {
        return Err("access_token is required".into());
    }
    Ok(Credential::from_token_response(token, &refresh, now_millis()))
}

pub async fn login_handler(
    State(state): State<AppState>,
    Json(token): Json<TokenResponse>,
) -> Response {
    let request_id = request_id();
    let credential = match credential_from_login(token) {
        Ok(credential) => credential,
        Err(message) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", &message, &request_id);
        }
    };
    let expires_at = credential.expires_at;
    match state.client.login(credential).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "logged_in",
                "expires_at": expires_at,
            })),
        )
            .into_response(),
        Err(error) => client_error_response(&error, &request_id),
    }
}

pub async fn logout_handler(State(state): State<AppState>) -> Response {
    let request_id = request_id();
    let cleared = state.client.stats().offline_queue_size;
    match state.client.logout().await {
        Ok(()) => {
            info!(cleared, "session ended by local caller");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "logged_out",
                    "cleared_requests": cleared,
                })),
            )
                .into_response()
        }
        Err(error) => client_error_response(&error, &request_id),
    }
}
