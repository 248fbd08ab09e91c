//! mailfacts - Mailbox Sync, Fact Extraction and Natural-Language Queries
//!
//! A Rust library that keeps a local copy of a user's Gmail mailbox, extracts typed
//! facts (prices, merchants, one-time codes, flights, job updates, ...) from each
//! message with a language model, and answers questions about them.
//!
//! # Features
//!
//! - Incremental sync keyed by the provider history cursor, with a date-bounded fallback
//! - Per-user sync lock and natural-key message dedup
//! - Defensive validation of model output into typed facts
//! - Intent parsing, parameterized execution and narrated answers with a template fallback
//! - AES-256-GCM sealed OAuth tokens

/// Configuration management
pub mod config;
/// Database operations and connection pooling
pub mod db;
/// Error types
pub mod error;
/// Fact extraction pipeline
pub mod extraction;
/// Gmail REST client and mailbox provider boundary
pub mod gmail;
/// Question parsing, execution and answers
pub mod intent;
/// Logging setup and utilities
pub mod logging;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Language-model boundary
pub mod nlu;
/// Provider message normalization
pub mod normalize;
/// Database schema definitions
pub mod schema;
/// Pipeline facade
pub mod service;
/// Incremental mailbox sync
pub mod sync;
/// Input validation and sanitization
pub mod validation;
/// Token encryption
pub mod vault;

// Re-export key components for easier access
pub use db::Database;
pub use error::{ErrorKind, PipelineError, Result};
pub use models::{ExtractionStats, Fact, FactType, Intent, QueryAnswer, SyncStats};
pub use service::{ErrorResponse, Pipeline};
