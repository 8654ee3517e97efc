//! History loader and the messaging REST client.
//!
//! DESIGN
//! ======
//! [`MessageApi`] is the seam to the external messaging API; [`ApiClient`]
//! implements it over reqwest. [`HistoryLoader`] runs fetches as independent
//! tasks and hands back a [`HistoryLoaded`] tagged with the generation it was
//! issued under. It never decides whether a result is still wanted; the
//! conversation re-validates the generation when the result is applied.
//!
//! ERROR HANDLING
//! ==============
//! Non-success statuses become typed [`ApiError`]s; 401/403 are reported as
//! `Unauthorized` so callers can route to re-authentication.

use std::sync::Arc;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::conversation::HistoryTicket;
use crate::error::ErrorCode;
use crate::model::{Message, Peer, UserId};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unauthorized: status {status}")]
    Unauthorized { status: u16 },

    #[error("API response error: status {status}")]
    Status { status: u16, body: String },

    #[error("API response parse failed: {0}")]
    Decode(String),

    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl ErrorCode for ApiError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Request(_) => "E_API_REQUEST",
            Self::Unauthorized { .. } => "E_UNAUTHORIZED",
            Self::Status { .. } => "E_API_RESPONSE",
            Self::Decode(_) => "E_API_PARSE",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Status { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// API SEAM
// =============================================================================

#[async_trait::async_trait]
pub trait MessageApi: Send + Sync + 'static {
    /// Backlog between the token's user and `peer_id`, oldest first.
    async fn fetch_history(&self, peer_id: UserId, auth_token: &str) -> Result<Vec<Message>, ApiError>;
}

/// reqwest client for the messaging REST API.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// # Errors
    ///
    /// Returns [`ApiError::HttpClientBuild`] if the HTTP client cannot be
    /// constructed.
    pub fn new(config: &EngineConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ApiError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: config.api_url.trim_end_matches('/').to_owned() })
    }

    /// `GET /users`: the user directory.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] on transport failure, non-success status, or
    /// an unparseable body.
    pub async fn list_users(&self, auth_token: &str) -> Result<Vec<Peer>, ApiError> {
        self.get_json("/users", &[], auth_token).await
    }

    /// `GET /users/{id}`: a single user.
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::list_users`].
    pub async fn get_user(&self, user_id: UserId, auth_token: &str) -> Result<Peer, ApiError> {
        self.get_json(&format!("/users/{user_id}"), &[], auth_token).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        auth_token: &str,
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).query(query).bearer_auth(auth_token).send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized { status: status.as_u16() });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status: status.as_u16(), body });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait::async_trait]
impl MessageApi for ApiClient {
    async fn fetch_history(&self, peer_id: UserId, auth_token: &str) -> Result<Vec<Message>, ApiError> {
        self.get_json("/messages", &[("recipient_id", peer_id.to_string())], auth_token).await
    }
}

// =============================================================================
// LOADER
// =============================================================================

/// Completion of one backlog fetch.
#[derive(Debug)]
pub struct HistoryLoaded {
    pub ticket: HistoryTicket,
    pub result: Result<Vec<Message>, ApiError>,
}

#[derive(Clone)]
pub struct HistoryLoader {
    api: Arc<dyn MessageApi>,
}

impl HistoryLoader {
    #[must_use]
    pub fn new(api: Arc<dyn MessageApi>) -> Self {
        Self { api }
    }

    /// Fetch a backlog inline.
    ///
    /// # Errors
    ///
    /// Propagates the [`ApiError`] from the underlying API.
    pub async fn fetch(&self, peer_id: UserId, auth_token: &str) -> Result<Vec<Message>, ApiError> {
        self.api.fetch_history(peer_id, auth_token).await
    }

    /// Run the fetch for `ticket` on its own task and pass the tagged result
    /// to `done`. The request always runs to completion.
    pub fn spawn_fetch(
        &self,
        ticket: HistoryTicket,
        auth_token: String,
        done: impl FnOnce(HistoryLoaded) + Send + 'static,
    ) -> JoinHandle<()> {
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            debug!(peer_id = %ticket.peer_id, generation = ticket.generation.0, "history: fetch started");
            let result = api.fetch_history(ticket.peer_id, &auth_token).await;
            match &result {
                Ok(messages) => debug!(peer_id = %ticket.peer_id, count = messages.len(), "history: fetch finished"),
                Err(error) => warn!(peer_id = %ticket.peer_id, %error, "history: fetch failed"),
            }
            done(HistoryLoaded { ticket, result });
        })
    }
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
