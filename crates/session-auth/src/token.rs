//! Token refresh against the session's token endpoint
//!
//! `RefreshTransport` is the capability the refresh coordinator consumes:
//! refresh token in, `{access_token, refresh_token, expires_in}` out.
//! `HttpRefreshTransport` implements it as an OAuth2 `refresh_token` grant.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. Accepts both
/// snake_case and camelCase field names.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(alias = "expiresIn")]
    pub expires_in: u64,
    #[serde(default, alias = "tokenType")]
    pub token_type: Option<String>,
}

/// Exchanges a refresh token for a new token pair.
///
/// Implementations return `Error::InvalidCredentials` when the server rejects
/// the refresh token itself; any other error is treated the same by the
/// coordinator (the session ends) but is logged differently.
pub trait RefreshTransport: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;
}

/// OAuth2 refresh-token grant over HTTP.
#[derive(Clone)]
pub struct HttpRefreshTransport {
    client: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
}

impl HttpRefreshTransport {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, client_id: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            client_id,
        }
    }

    async fn refresh_inner(&self, refresh: &str) -> Result<TokenResponse> {
        let mut form = vec![("grant_type", "refresh_token"), ("refresh_token", refresh)];
        if let Some(client_id) = &self.client_id {
            form.push(("client_id", client_id.as_str()));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 400 invalid_grant, 401 and 403 all mean the refresh token is dead
            if matches!(status.as_u16(), 400 | 401 | 403) {
                return Err(Error::InvalidCredentials(format!(
                    "refresh token rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "token refresh returned {status}: {body}"
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;
        debug!(expires_in = token.expires_in, "token endpoint issued new credential");
        Ok(token)
    }
}

impl RefreshTransport for HttpRefreshTransport {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>> {
        Box::pin(self.refresh_inner(refresh_token))
    }
}
