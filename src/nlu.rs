//! Language-model boundary used for fact extraction, intent parsing and answer
//! narration, plus an OpenAI-compatible chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::NluConfig;

/// NLU service error types
#[derive(Debug, Error)]
pub enum NluError {
    /// Network-level error (connection failed, etc.)
    #[error("Network error: {0}")]
    Network(String),

    /// The service returned an error response
    #[error("API error (status {status}): {message}")]
    Api {
        /// HTTP status
        status: u16,
        /// Response body
        message: String,
    },

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Authentication failed (invalid API key)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Response body doesn't match expected schema
    #[error("Invalid response schema: {0}")]
    InvalidSchema(String),

    /// Request timeout
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),
}

/// One completion request
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Instructions
    pub system: String,
    /// Input
    pub user: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Completion token cap
    pub max_tokens: u32,
}

/// Structured and free-text completions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NluService: Send + Sync {
    /// Request a JSON object response and parse it
    async fn complete_json(&self, request: CompletionRequest) -> Result<Value, NluError>;

    /// Request a free-text response
    async fn complete_text(&self, request: CompletionRequest) -> Result<String, NluError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
    model: String,
    timeout: Duration,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("api_key", &"[REDACTED]")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiClient {
    /// Create a client from configuration
    pub fn new(config: &NluConfig) -> Result<Self, NluError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NluError::Network(e.to_string()))?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            timeout,
        })
    }

    async fn call_api(&self, request: &CompletionRequest, json_mode: bool) -> Result<String, NluError> {
        let payload = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NluError::Timeout(self.timeout)
                } else {
                    NluError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        debug!(status = status.as_u16(), "Received NLU response");

        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(match status.as_u16() {
                401 | 403 => NluError::Authentication(format!("Invalid API key ({status})")),
                429 => NluError::RateLimit,
                code => NluError::Api { status: code, message },
            });
        }

        let chat: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| NluError::InvalidSchema(format!("Failed to parse response: {e}")))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| NluError::InvalidSchema("Response contained no content".to_string()))
    }
}

#[async_trait]
impl NluService for OpenAiClient {
    async fn complete_json(&self, request: CompletionRequest) -> Result<Value, NluError> {
        let content = self.call_api(&request, true).await?;
        serde_json::from_str(&content)
            .map_err(|e| NluError::InvalidSchema(format!("Content is not JSON: {e}")))
    }

    async fn complete_text(&self, request: CompletionRequest) -> Result<String, NluError> {
        let content = self.call_api(&request, false).await?;
        Ok(content.trim().to_string())
    }
}
