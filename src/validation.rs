use unicode_normalization::UnicodeNormalization;

use crate::error::{PipelineError, Result};

/// Longest accepted user identifier, in bytes
pub const MAX_USER_ID_LEN: usize = 128;

/// Largest accepted extraction batch
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Validation utilities for input sanitization and edge case handling
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate a user identifier
    pub fn validate_user_id(user_id: &str) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("user id cannot be empty".to_string()));
        }

        if user_id.len() > MAX_USER_ID_LEN {
            return Err(PipelineError::InvalidInput(format!(
                "user id too long (max {MAX_USER_ID_LEN} bytes)"
            )));
        }

        if user_id.chars().any(char::is_control) {
            return Err(PipelineError::InvalidInput(
                "user id contains invalid characters".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate a natural-language question, returning it trimmed
    pub fn validate_question(question: &str, max_chars: usize) -> Result<&str> {
        let trimmed = question.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidInput("query is required".to_string()));
        }

        if trimmed.chars().count() > max_chars {
            return Err(PipelineError::InvalidInput(format!(
                "query too long (max {max_chars} chars)"
            )));
        }

        Ok(trimmed)
    }

    /// Validate batch size for extraction
    pub fn validate_batch_size(batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(PipelineError::InvalidInput(
                "batch size must be greater than 0".to_string(),
            ));
        }

        if batch_size > MAX_BATCH_SIZE {
            return Err(PipelineError::InvalidInput(format!(
                "batch size too large (max {MAX_BATCH_SIZE})"
            )));
        }

        Ok(())
    }

    /// Longest prefix of `text` that fits in `max_bytes` without splitting a character
    #[must_use]
    pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
        if text.len() <= max_bytes {
            return text;
        }
        let mut end = max_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }

    /// First `max_chars` characters of `text`
    #[must_use]
    pub fn truncate_chars(text: &str, max_chars: usize) -> String {
        text.chars().take(max_chars).collect()
    }

    /// NFC-normalize, drop control characters other than line breaks and tabs, trim
    #[must_use]
    pub fn sanitize_text(text: &str) -> String {
        text.nfc()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
            .collect::<String>()
            .trim()
            .to_string()
    }
}
