//! Login and refresh exchanges against the token endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use super::session::{RefreshGrant, TokenPair, TokenResponse};
use crate::api::error::extract_detail;

/// Token endpoint, relative to the API base URL
const LOGIN_PATH: &str = "auth/token/";

/// Refresh endpoint, relative to the API base URL
const REFRESH_PATH: &str = "auth/token/refresh/";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Rejected by server (status {status}){}", detail_suffix(.detail))]
    Rejected { status: u16, detail: Option<String> },

    #[error("Token response is missing {0}")]
    MalformedResponse(&'static str),

    #[error("Authentication request timed out")]
    Timeout,

    #[error("Authentication request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
}

impl AuthError {
    /// Message suitable for showing next to a login form
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Rejected { detail: Some(detail), .. } => detail.clone(),
            AuthError::Rejected { .. } => "Invalid username or password".to_string(),
            AuthError::MalformedResponse(_) => "The server sent an unexpected response".to_string(),
            AuthError::Timeout => "Connection timed out. Please try again.".to_string(),
            AuthError::Transport(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
        }
    }
}

/// The two network operations the session store depends on.
#[async_trait]
pub trait AuthExchange: Send + Sync {
    /// Trade credentials for a token pair
    async fn login(&self, username: &str, password: &str) -> Result<TokenPair, AuthError>;

    /// Trade a refresh token for a new access token
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshGrant, AuthError>;
}

/// `AuthExchange` over HTTP JSON token endpoints.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthExchange {
    client: Client,
    base_url: String,
}

impl HttpAuthExchange {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Share an existing connection pool
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_tokens(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<TokenResponse, AuthError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(url = %url, status = status.as_u16(), "Token endpoint rejected request");
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                detail: extract_detail(&body),
            });
        }

        let text = response.text().await.map_err(transport_error)?;
        serde_json::from_str(&text).map_err(|_| AuthError::MalformedResponse("a JSON body"))
    }
}

fn transport_error(error: reqwest::Error) -> AuthError {
    if error.is_timeout() {
        AuthError::Timeout
    } else {
        AuthError::Transport(error)
    }
}

#[async_trait]
impl AuthExchange for HttpAuthExchange {
    async fn login(&self, username: &str, password: &str) -> Result<TokenPair, AuthError> {
        let body = json!({ "username": username, "password": password });
        self.post_tokens(LOGIN_PATH, body)
            .await?
            .into_pair()
            .ok_or(AuthError::MalformedResponse("the access or refresh token"))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshGrant, AuthError> {
        let body = json!({ "refresh": refresh_token });
        self.post_tokens(REFRESH_PATH, body)
            .await?
            .into_grant()
            .ok_or(AuthError::MalformedResponse("the access token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let exchange = HttpAuthExchange::with_client(Client::new(), "http://localhost:8000/api/");
        assert_eq!(exchange.base_url, "http://localhost:8000/api");
    }

    #[test]
    fn test_rejected_message_includes_detail() {
        let err = AuthError::Rejected {
            status: 401,
            detail: Some("No active account found with the given credentials".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Rejected by server (status 401): No active account found with the given credentials"
        );
        assert_eq!(
            err.user_message(),
            "No active account found with the given credentials"
        );

        let bare = AuthError::Rejected { status: 400, detail: None };
        assert_eq!(bare.to_string(), "Rejected by server (status 400)");
        assert_eq!(bare.user_message(), "Invalid username or password");
    }
}
