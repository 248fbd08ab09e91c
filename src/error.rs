//! Error types for the mailfacts library.
//!
//! This module provides custom error types using `thiserror` for better error handling
//! and more specific error messages throughout the pipeline. Every error carries a
//! classification ([`ErrorKind`]) so callers can report a small structured outcome
//! instead of a raw internal fault.

use serde::Serialize;
use thiserror::Error;

use crate::gmail::ProviderError;
use crate::nlu::NluError;

/// Errors that can occur while running a pipeline operation.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection pool errors
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The user has no record in the store
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// A sync run is already in progress for the user
    #[error("Sync already in progress for user {0}")]
    Conflict(String),

    /// Stored credentials are unusable or the provider rejected them
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Mail provider failure outside of a per-message step
    #[error("Mail provider error: {0}")]
    Provider(ProviderError),

    /// NLU service failure outside of an isolated step
    #[error("NLU service error: {0}")]
    Nlu(#[from] NluError),

    /// The question could not be turned into a valid intent
    #[error("Could not understand query: {0}")]
    NotUnderstood(String),

    /// The intent was valid but reading the store failed
    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    /// Caller supplied an invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Credential vault errors
    #[error("Vault error: {0}")]
    Vault(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Result with `PipelineError`
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A precondition already holds (sync running); not retryable until it clears
    Conflict,
    /// Upstream credentials rejected; requires re-authentication
    Auth,
    /// Bad caller input
    InvalidInput,
    /// Unknown user
    NotFound,
    /// NLU output failed schema validation
    NotUnderstood,
    /// Store read failed while executing a valid intent
    QueryFailed,
    /// Anything else; aborts the current run
    Fatal,
}

impl PipelineError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Auth(_) => ErrorKind::Auth,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::UserNotFound(_) => ErrorKind::NotFound,
            Self::NotUnderstood(_) => ErrorKind::NotUnderstood,
            Self::QueryFailed(_) => ErrorKind::QueryFailed,
            _ => ErrorKind::Fatal,
        }
    }

    /// HTTP-style status code for the error classification.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Conflict => 409,
            ErrorKind::Auth => 401,
            ErrorKind::InvalidInput => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::NotUnderstood => 422,
            ErrorKind::QueryFailed | ErrorKind::Fatal => 500,
        }
    }
}

impl From<ProviderError> for PipelineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::AuthRejected(msg) => Self::Auth(msg),
            other => Self::Provider(other),
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
