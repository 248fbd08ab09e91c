//! Data models for the sync, extraction and query stages
//!
//! This module contains the records persisted in the store (users, messages, facts),
//! the per-run statistics returned by the pipeline operations, the structured query
//! intent, and the small query builder used by the store layer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Users
// ============================================================================

/// Per-user sync lock state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No sync running; last run succeeded or none has run
    Idle,
    /// A sync run holds the lock
    Syncing,
    /// The last run ended with a fatal error
    Error,
}

impl SyncStatus {
    /// Stored representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "syncing" => Ok(Self::Syncing),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mailbox owner with encrypted provider credentials and sync state
#[derive(Debug, Clone)]
pub struct User {
    /// Identity key
    pub id: String,
    /// Sealed access token
    pub access_token_enc: String,
    /// Sealed refresh token
    pub refresh_token_enc: String,
    /// Access token expiry, unknown when `None`
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Opaque provider history cursor, empty when none is known
    pub history_cursor: String,
    /// Completion time of the last sync run
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Lock state
    pub sync_status: SyncStatus,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

/// Data for registering a user
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Identity key
    pub id: String,
    /// Sealed access token
    pub access_token_enc: String,
    /// Sealed refresh token
    pub refresh_token_enc: String,
    /// Access token expiry if known
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// How releasing the sync lock treats the stored cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorUpdate {
    /// Leave the stored cursor as is
    Keep,
    /// Overwrite with a new non-empty cursor
    Set(String),
    /// Discard the stored cursor (it expired upstream)
    Clear,
}

// ============================================================================
// Messages
// ============================================================================

/// A normalized message ready to insert
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    /// Owner
    pub user_id: String,
    /// Provider message id; unique per user
    pub provider_message_id: String,
    /// Provider thread id
    pub thread_id: String,
    /// Provider history id at fetch time, empty if absent
    pub history_id: String,
    /// `From` header
    pub sender: String,
    /// `To` header
    pub recipient: String,
    /// `Subject` header
    pub subject: String,
    /// Plain-text body
    pub body: String,
    /// Provider snippet
    pub snippet: String,
    /// Message time
    pub timestamp: DateTime<Utc>,
    /// Provider labels
    pub labels: Vec<String>,
    /// True when any part is an attachment
    pub has_attachments: bool,
    /// Provider size estimate in bytes
    pub size_estimate: i64,
}

/// A message as stored
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    /// Row id
    pub id: i64,
    /// Owner
    pub user_id: String,
    /// Provider message id
    pub provider_message_id: String,
    /// Provider thread id
    pub thread_id: String,
    /// Provider history id
    pub history_id: String,
    /// `From` header
    pub sender: String,
    /// `To` header
    pub recipient: String,
    /// `Subject` header
    pub subject: String,
    /// Plain-text body
    pub body: String,
    /// Provider snippet
    pub snippet: String,
    /// Message time
    pub timestamp: DateTime<Utc>,
    /// Provider labels
    pub labels: Vec<String>,
    /// True when any part is an attachment
    pub has_attachments: bool,
    /// Provider size estimate in bytes
    pub size_estimate: i64,
    /// Facts have been extracted
    pub processed: bool,
    /// Terminal extraction failure, empty when none
    pub processing_error: String,
    /// Insert time
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Facts
// ============================================================================

/// Closed set of extracted fact types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Price,
    Merchant,
    Otp,
    FlightPnr,
    FlightRoute,
    JobStatus,
    JobCompany,
    TrackingNum,
    Subscription,
    Date,
    SenderDomain,
    Custom,
}

impl FactType {
    /// Every fact type, in wire-name order
    pub const ALL: [Self; 12] = [
        Self::Price,
        Self::Merchant,
        Self::Otp,
        Self::FlightPnr,
        Self::FlightRoute,
        Self::JobStatus,
        Self::JobCompany,
        Self::TrackingNum,
        Self::Subscription,
        Self::Date,
        Self::SenderDomain,
        Self::Custom,
    ];

    /// Wire and storage name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Merchant => "merchant",
            Self::Otp => "otp",
            Self::FlightPnr => "flight_pnr",
            Self::FlightRoute => "flight_route",
            Self::JobStatus => "job_status",
            Self::JobCompany => "job_company",
            Self::TrackingNum => "tracking_num",
            Self::Subscription => "subscription",
            Self::Date => "date",
            Self::SenderDomain => "sender_domain",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for FactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown fact type: {s}"))
    }
}

impl fmt::Display for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated fact ready to insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewFact {
    /// Fact type
    pub fact_type: FactType,
    /// Value as text; numeric facts hold a decimal string
    pub value: String,
    /// Confidence within `[0, 1]`
    pub confidence: f64,
    /// Free-form JSON object
    pub metadata: Value,
}

/// A stored fact
#[derive(Debug, Clone, Serialize)]
pub struct Fact {
    /// Row id
    pub id: i64,
    /// Source message row id
    pub message_id: i64,
    /// Owner
    pub user_id: String,
    /// Fact type
    #[serde(rename = "type")]
    pub fact_type: FactType,
    /// Value as text
    pub value: String,
    /// Confidence within `[0, 1]`
    pub confidence: f64,
    /// Free-form JSON object
    pub metadata: Value,
    /// Insert time
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Run statistics
// ============================================================================

/// Outcome counters of one sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Ids discovered for the run, including ones that failed to fetch
    pub fetched: u64,
    /// Newly inserted
    pub stored: u64,
    /// Already present
    pub skipped: u64,
    /// Normalize or insert failures
    pub failed: u64,
}

/// Outcome counters of one extraction batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionStats {
    /// Messages marked processed
    pub processed: u64,
    /// Messages terminally failed
    pub failed: u64,
    /// Messages selected
    pub total: u64,
}

// ============================================================================
// Query intent
// ============================================================================

/// Operation requested by a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentAction {
    Sum,
    Count,
    List,
    Find,
    Summarize,
}

/// What a question is about: one fact type, or messages themselves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntentEntity {
    /// The `"email"` sentinel
    Email(EmailSentinel),
    /// A fact type
    Fact(FactType),
}

/// Serialized as the literal `"email"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailSentinel {
    Email,
}

impl IntentEntity {
    /// The `"email"` entity
    pub const EMAIL: Self = Self::Email(EmailSentinel::Email);

    /// True for the `"email"` sentinel
    #[must_use]
    pub const fn is_email(&self) -> bool {
        matches!(self, Self::Email(_))
    }
}

/// Optional narrowing of an intent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    /// Fact-type override
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub fact_type: Option<FactType>,
    /// `"current"` or `YYYY-MM`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_to: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

/// Structured form of a question
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Intent {
    pub action: IntentAction,
    pub entity: IntentEntity,
    pub filter: IntentFilter,
    /// Always within `[1, 100]`
    pub limit: u32,
}

/// Closed interval on a timestamp column; either bound may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    /// Start (inclusive, optional)
    pub start: Option<DateTime<Utc>>,
    /// End (inclusive, optional)
    pub end: Option<DateTime<Utc>>,
}

/// Rows returned by an executed intent
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QueryDocuments {
    Facts(Vec<Fact>),
    Messages(Vec<StoredMessage>),
}

impl QueryDocuments {
    /// Number of rows in the page
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Facts(rows) => rows.len(),
            Self::Messages(rows) => rows.len(),
        }
    }

    /// True when the page is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of executing an intent
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub action: IntentAction,
    /// Sum of parsed values, rounded to cents; `sum` only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Rows summed for `sum`, otherwise all matching rows
    pub count: u64,
    pub documents: QueryDocuments,
}

/// Full reply to a question
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub intent: Intent,
    pub data: QueryResult,
}

// ============================================================================
// Query builder
// ============================================================================

/// Query builder for constructing database queries
#[derive(Debug, Default)]
pub struct QueryBuilder {
    /// List of filters to apply
    pub filters: Vec<Filter>,
    /// Column to order results by, descending
    pub order_by_desc: Option<&'static str>,
    /// Maximum number of results to return
    pub limit: Option<u32>,
}

/// A filter condition for database queries
#[derive(Debug)]
pub struct Filter {
    /// Column name to filter on
    pub field: &'static str,
    /// Comparison operator
    pub operator: Operator,
    /// Value to compare against
    pub value: FilterType,
}

/// Comparison operators for filters
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operator {
    /// Equality (=)
    Equal,
    /// Greater than (>)
    GreaterThan,
    /// Greater than or equal (>=)
    GreaterThanOrEqual,
    /// Less than or equal (<=)
    LessThanOrEqual,
    /// Case-insensitive substring match (LIKE with escaped wildcards)
    Contains,
}

impl Operator {
    /// SQL operator text
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThanOrEqual => "<=",
            Self::Contains => "LIKE",
        }
    }
}

/// Value types for filter conditions
#[derive(Debug, Clone)]
pub enum FilterType {
    /// Text value
    Text(String),
    /// Floating point value
    Float(f64),
    /// Date/time value
    Date(DateTime<Utc>),
}

impl QueryBuilder {
    /// Create a new empty query builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter condition to the query
    pub fn add_filter(&mut self, field: &'static str, operator: Operator, value: FilterType) {
        self.filters.push(Filter { field, operator, value });
    }

    /// Bound `field` to a closed date range
    pub fn add_date_range(&mut self, field: &'static str, range: DateRange) {
        if let Some(start) = range.start {
            self.add_filter(field, Operator::GreaterThanOrEqual, FilterType::Date(start));
        }
        if let Some(end) = range.end {
            self.add_filter(field, Operator::LessThanOrEqual, FilterType::Date(end));
        }
    }

    /// Order results by a column, newest first
    pub fn set_order_by_desc(&mut self, column: &'static str) {
        self.order_by_desc = Some(column);
    }

    /// Set the maximum number of results to return
    pub fn set_limit(&mut self, limit: u32) {
        self.limit = Some(limit);
    }
}
