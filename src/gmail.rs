//! Mailbox provider boundary and the Gmail REST v1 client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::GoogleConfig;

/// Errors returned by a [`MailProvider`]
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Access or refresh token rejected; the user must re-authenticate
    #[error("Credentials rejected: {0}")]
    AuthRejected(String),

    /// The history cursor is too old or unknown to the provider
    #[error("History cursor expired")]
    CursorExpired,

    /// Any other non-success response
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status
        status: u16,
        /// Response body
        message: String,
    },

    /// Transport failure, including timeouts
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body did not match the expected shape
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of exchanging a refresh token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// New access token
    pub access_token: String,
    /// Instant at which the access token stops being valid
    pub expires_at: DateTime<Utc>,
}

/// Message ids added since a cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    /// Added message ids, in provider order (may repeat)
    pub message_ids: Vec<String>,
    /// Cursor to resume from next time, if the provider returned one
    pub cursor: Option<String>,
}

/// Remote mailbox operations used by the sync engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Exchange a refresh token for a fresh access token
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError>;

    /// List "message added" history since `cursor`. HTTP 404 maps to
    /// [`ProviderError::CursorExpired`].
    async fn list_history(
        &self,
        access_token: &str,
        cursor: &str,
        max_results: u32,
    ) -> Result<HistoryPage, ProviderError>;

    /// List ids of messages dated after `after`
    async fn list_messages_after(
        &self,
        access_token: &str,
        after: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<String>, ProviderError>;

    /// Fetch one full message
    async fn get_message(&self, access_token: &str, message_id: &str) -> Result<GmailMessage, ProviderError>;
}

// ============================================================================
// Wire types
// ============================================================================

/// A full Gmail message (`format=full`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub history_id: Option<String>,
    /// Milliseconds since the epoch, as a decimal string
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub size_estimate: u64,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

/// One node of the MIME tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    /// Base64url content, absent for attachment stubs and containers
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub size: u64,
}

impl MessagePart {
    /// Case-insensitive header lookup, trimmed
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.trim())
    }
}

impl GmailMessage {
    /// Top-level header value, or `""`
    #[must_use]
    pub fn header(&self, name: &str) -> &str {
        self.payload
            .as_ref()
            .and_then(|p| p.header(name))
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(default)]
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageStub,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

// ============================================================================
// Gmail API
// ============================================================================

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// `now + secs`, or `None` when the result does not fit a timestamp
#[must_use]
pub fn expiry_after(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_seconds(secs).and_then(|delta| now.checked_add_signed(delta))
}

/// Gmail REST v1 implementation of [`MailProvider`]
#[derive(Debug, Clone)]
pub struct GmailClient {
    http: reqwest::Client,
    api_base_url: String,
    token_uri: String,
    client_id: String,
    client_secret: String,
}

impl GmailClient {
    /// Build a client with the configured endpoints and request timeout
    pub fn new(config: &GoogleConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token_uri: config.token_uri.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.api_base_url, path)
    }

    /// Map 401 to [`ProviderError::AuthRejected`] and other failures to `Api`
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::AuthRejected("access token rejected".to_string()));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let resp = self.http.post(&self.token_uri).form(&form).send().await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::AuthRejected(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        debug!(expires_in, "Access token refreshed");

        let expires_at = expiry_after(Utc::now(), expires_in).ok_or_else(|| ProviderError::Api {
            status: status.as_u16(),
            message: format!("expires_in out of range: {expires_in}"),
        })?;

        Ok(TokenGrant {
            access_token: token.access_token,
            expires_at,
        })
    }

    async fn list_history(
        &self,
        access_token: &str,
        cursor: &str,
        max_results: u32,
    ) -> Result<HistoryPage, ProviderError> {
        let max = max_results.to_string();
        let resp = self
            .http
            .get(self.url("history"))
            .bearer_auth(access_token)
            .query(&[
                ("startHistoryId", cursor),
                ("historyTypes", "messageAdded"),
                ("maxResults", max.as_str()),
            ])
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::CursorExpired);
        }
        let list: HistoryListResponse = Self::check(resp).await?.json().await?;

        let message_ids = list
            .history
            .into_iter()
            .flat_map(|record| record.messages_added)
            .map(|added| added.message.id)
            .filter(|id| !id.is_empty())
            .collect();

        Ok(HistoryPage {
            message_ids,
            cursor: list.history_id.filter(|id| !id.is_empty()),
        })
    }

    async fn list_messages_after(
        &self,
        access_token: &str,
        after: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<String>, ProviderError> {
        let query = format!("after:{}", after.timestamp());
        let max = max_results.to_string();
        let resp = self
            .http
            .get(self.url("messages"))
            .bearer_auth(access_token)
            .query(&[("q", query.as_str()), ("maxResults", max.as_str())])
            .send()
            .await?;

        let list: MessageListResponse = Self::check(resp).await?.json().await?;
        Ok(list
            .messages
            .into_iter()
            .map(|stub| stub.id)
            .filter(|id| !id.is_empty())
            .collect())
    }

    async fn get_message(&self, access_token: &str, message_id: &str) -> Result<GmailMessage, ProviderError> {
        let resp = self
            .http
            .get(self.url(&format!("messages/{message_id}")))
            .bearer_auth(access_token)
            .query(&[("format", "full")])
            .send()
            .await?;

        Ok(Self::check(resp).await?.json().await?)
    }
}
