//! Database schema definitions
//!
//! This module provides constants for table and column names used with rusqlite.
//! The tables themselves are created by the SQL files under `migrations/`.

/// Users table schema
pub mod users {
    /// Table name
    pub const TABLE: &str = "users";
    /// Identity key column
    pub const ID: &str = "id";
    /// Sealed access token column
    pub const ACCESS_TOKEN_ENC: &str = "access_token_enc";
    /// Sealed refresh token column
    pub const REFRESH_TOKEN_ENC: &str = "refresh_token_enc";
    /// Access token expiry column (nullable)
    pub const TOKEN_EXPIRES_AT: &str = "token_expires_at";
    /// Provider history cursor column
    pub const HISTORY_CURSOR: &str = "history_cursor";
    /// Last completed sync column (nullable)
    pub const LAST_SYNCED_AT: &str = "last_synced_at";
    /// Lock state column
    pub const SYNC_STATUS: &str = "sync_status";
    /// Registration timestamp column
    pub const CREATED_AT: &str = "created_at";
}

/// Messages table schema
pub mod messages {
    /// Table name
    pub const TABLE: &str = "messages";
    /// Primary key column
    pub const ID: &str = "id";
    /// Owner column
    pub const USER_ID: &str = "user_id";
    /// Provider message id column, unique per user
    pub const PROVIDER_MESSAGE_ID: &str = "provider_message_id";
    /// Provider thread id column
    pub const THREAD_ID: &str = "thread_id";
    /// Provider history id column
    pub const HISTORY_ID: &str = "history_id";
    /// `From` header column
    pub const SENDER: &str = "sender";
    /// `To` header column
    pub const RECIPIENT: &str = "recipient";
    /// Subject column
    pub const SUBJECT: &str = "subject";
    /// Plain-text body column
    pub const BODY: &str = "body";
    /// Snippet column
    pub const SNIPPET: &str = "snippet";
    /// Message time column
    pub const TIMESTAMP: &str = "timestamp";
    /// JSON-encoded label list column
    pub const LABELS: &str = "labels";
    /// Attachment flag column
    pub const HAS_ATTACHMENTS: &str = "has_attachments";
    /// Size estimate column
    pub const SIZE_ESTIMATE: &str = "size_estimate";
    /// Extraction done flag column
    pub const PROCESSED: &str = "processed";
    /// Terminal extraction error column
    pub const PROCESSING_ERROR: &str = "processing_error";
    /// Insert timestamp column
    pub const CREATED_AT: &str = "created_at";
}

/// Facts table schema
pub mod facts {
    /// Table name
    pub const TABLE: &str = "facts";
    /// Primary key column
    pub const ID: &str = "id";
    /// Foreign key to messages table
    pub const MESSAGE_ID: &str = "message_id";
    /// Owner column
    pub const USER_ID: &str = "user_id";
    /// Fact type column
    pub const TYPE: &str = "type";
    /// Value column
    pub const VALUE: &str = "value";
    /// Confidence column
    pub const CONFIDENCE: &str = "confidence";
    /// JSON-encoded metadata column
    pub const METADATA: &str = "metadata";
    /// Insert timestamp column
    pub const CREATED_AT: &str = "created_at";
}
