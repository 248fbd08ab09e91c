use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{PipelineError, Result};
use crate::models::{
    CursorUpdate, Fact, FactType, FilterType, NewFact, NewMessage, NewUser, Operator, QueryBuilder,
    StoredMessage, SyncStatus, User,
};
use crate::schema::{facts, messages, users};

// Type alias for the database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Database manager for handling connections and operations
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(&config.path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA journal_mode=WAL;\nPRAGMA synchronous=NORMAL;\nPRAGMA foreign_keys=ON;")
        });
        let pool = Pool::builder().max_size(config.max_connections).build(manager)?;

        // Run migrations
        let conn = pool.get()?;
        Self::run_migrations(&conn)?;
        info!(path = %config.path, "Database ready");

        Ok(Self { pool })
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(include_str!("../migrations/2026-03-01-000000_create_tables/up.sql"))?;
        conn.execute_batch(include_str!("../migrations/2026-03-01-000001_add_query_indexes/up.sql"))?;
        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    /// Insert a user, or replace the credentials of an existing one.
    /// Sync state of an existing user is left untouched.
    pub fn upsert_user(&self, new_user: &NewUser, now: DateTime<Utc>) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            &format!(
                "INSERT INTO {table} ({id}, {access}, {refresh}, {expires}, {created}) VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT({id}) DO UPDATE SET {access} = excluded.{access}, {refresh} = excluded.{refresh}, {expires} = excluded.{expires}",
                table = users::TABLE,
                id = users::ID,
                access = users::ACCESS_TOKEN_ENC,
                refresh = users::REFRESH_TOKEN_ENC,
                expires = users::TOKEN_EXPIRES_AT,
                created = users::CREATED_AT,
            ),
            params![
                new_user.id,
                new_user.access_token_enc,
                new_user.refresh_token_enc,
                new_user.token_expires_at,
                now
            ],
        )?;
        Ok(())
    }

    /// Get a user by id
    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.get_connection()?;
        Self::find_user(&conn, user_id)
    }

    fn find_user(conn: &Connection, user_id: &str) -> Result<Option<User>> {
        let user = conn
            .query_row(
                &format!("SELECT * FROM {} WHERE {} = ?", users::TABLE, users::ID),
                params![user_id],
                Self::map_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Ids of every registered user, oldest first
    pub fn list_user_ids(&self) -> Result<Vec<String>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {id} FROM {table} ORDER BY {created} ASC, {id} ASC",
            id = users::ID,
            table = users::TABLE,
            created = users::CREATED_AT
        ))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Take the per-user sync lock.
    ///
    /// The status moves to `syncing` with a single conditional UPDATE, so two callers
    /// can never both succeed. Returns the locked user.
    pub fn begin_sync(&self, user_id: &str) -> Result<User> {
        let conn = self.get_connection()?;
        let changed = conn.execute(
            &format!(
                "UPDATE {table} SET {status} = ? WHERE {id} = ? AND {status} != ?",
                table = users::TABLE,
                status = users::SYNC_STATUS,
                id = users::ID,
            ),
            params![SyncStatus::Syncing.as_str(), user_id, SyncStatus::Syncing.as_str()],
        )?;

        match Self::find_user(&conn, user_id)? {
            None => Err(PipelineError::UserNotFound(user_id.to_string())),
            Some(_) if changed == 0 => Err(PipelineError::Conflict(user_id.to_string())),
            Some(user) => Ok(user),
        }
    }

    /// Release the sync lock with the final status and cursor
    pub fn finish_sync(
        &self,
        user_id: &str,
        status: SyncStatus,
        cursor: &CursorUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        let mut query = format!(
            "UPDATE {} SET {} = ?, {} = ?",
            users::TABLE,
            users::SYNC_STATUS,
            users::LAST_SYNCED_AT
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(status.as_str()), Box::new(now)];

        match cursor {
            CursorUpdate::Keep => {}
            CursorUpdate::Set(value) => {
                query.push_str(&format!(", {} = ?", users::HISTORY_CURSOR));
                params.push(Box::new(value.clone()));
            }
            CursorUpdate::Clear => {
                query.push_str(&format!(", {} = ''", users::HISTORY_CURSOR));
            }
        }

        query.push_str(&format!(" WHERE {} = ?", users::ID));
        params.push(Box::new(user_id.to_string()));

        conn.execute(&query, rusqlite::params_from_iter(params.iter()))?;
        debug!(user_id, status = %status, "Sync lock released");
        Ok(())
    }

    /// Persist a refreshed access token
    pub fn update_access_token(
        &self,
        user_id: &str,
        access_token_enc: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            &format!(
                "UPDATE {} SET {} = ?, {} = ? WHERE {} = ?",
                users::TABLE,
                users::ACCESS_TOKEN_ENC,
                users::TOKEN_EXPIRES_AT,
                users::ID
            ),
            params![access_token_enc, expires_at, user_id],
        )?;
        Ok(())
    }

    fn map_user(row: &Row) -> rusqlite::Result<User> {
        let status: String = row.get(users::SYNC_STATUS)?;
        Ok(User {
            id: row.get(users::ID)?,
            access_token_enc: row.get(users::ACCESS_TOKEN_ENC)?,
            refresh_token_enc: row.get(users::REFRESH_TOKEN_ENC)?,
            token_expires_at: row.get(users::TOKEN_EXPIRES_AT)?,
            history_cursor: row.get(users::HISTORY_CURSOR)?,
            last_synced_at: row.get(users::LAST_SYNCED_AT)?,
            sync_status: status.parse::<SyncStatus>().map_err(conversion_error)?,
            created_at: row.get(users::CREATED_AT)?,
        })
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Insert a message unless `(user_id, provider_message_id)` already exists.
    /// Returns `true` when a row was inserted.
    pub fn insert_message(&self, message: &NewMessage, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.get_connection()?;
        let labels = serde_json::to_string(&message.labels)?;

        let inserted = conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT({}, {}) DO NOTHING",
                messages::TABLE,
                messages::USER_ID,
                messages::PROVIDER_MESSAGE_ID,
                messages::THREAD_ID,
                messages::HISTORY_ID,
                messages::SENDER,
                messages::RECIPIENT,
                messages::SUBJECT,
                messages::BODY,
                messages::SNIPPET,
                messages::TIMESTAMP,
                messages::LABELS,
                messages::HAS_ATTACHMENTS,
                messages::SIZE_ESTIMATE,
                messages::CREATED_AT,
                messages::USER_ID,
                messages::PROVIDER_MESSAGE_ID,
            ),
            params![
                message.user_id,
                message.provider_message_id,
                message.thread_id,
                message.history_id,
                message.sender,
                message.recipient,
                message.subject,
                message.body,
                message.snippet,
                message.timestamp,
                labels,
                message.has_attachments,
                message.size_estimate,
                now
            ],
        )?;

        Ok(inserted == 1)
    }

    /// Get a message by row id
    pub fn get_message(&self, message_id: i64) -> Result<Option<StoredMessage>> {
        let conn = self.get_connection()?;
        let message = conn
            .query_row(
                &format!("SELECT * FROM {} WHERE {} = ?", messages::TABLE, messages::ID),
                params![message_id],
                Self::map_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Number of stored messages for a user
    pub fn count_messages(&self, user_id: &str) -> Result<u64> {
        let conn = self.get_connection()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE {} = ?", messages::TABLE, messages::USER_ID),
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Messages awaiting extraction, oldest first
    pub fn unextracted_messages(&self, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {table} WHERE {processed} = 0 AND {error} = '' ORDER BY {created} ASC, {id} ASC LIMIT ?",
            table = messages::TABLE,
            processed = messages::PROCESSED,
            error = messages::PROCESSING_ERROR,
            created = messages::CREATED_AT,
            id = messages::ID,
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], Self::map_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Store the facts of a message and mark it processed, atomically.
    ///
    /// Returns the number of facts written; zero facts are written when another run
    /// already processed the message.
    pub fn complete_extraction(
        &self,
        message: &StoredMessage,
        new_facts: &[NewFact],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let claimed = tx.execute(
            &format!(
                "UPDATE {} SET {} = 1 WHERE {} = ? AND {} = 0",
                messages::TABLE,
                messages::PROCESSED,
                messages::ID,
                messages::PROCESSED
            ),
            params![message.id],
        )?;
        if claimed == 0 {
            debug!(message_id = message.id, "Message already processed, discarding facts");
            return Ok(0);
        }

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}) VALUES (?, ?, ?, ?, ?, ?, ?)",
                facts::TABLE,
                facts::MESSAGE_ID,
                facts::USER_ID,
                facts::TYPE,
                facts::VALUE,
                facts::CONFIDENCE,
                facts::METADATA,
                facts::CREATED_AT
            ))?;
            for fact in new_facts {
                stmt.execute(params![
                    message.id,
                    message.user_id,
                    fact.fact_type.as_str(),
                    fact.value,
                    fact.confidence,
                    serde_json::to_string(&fact.metadata)?,
                    now
                ])?;
            }
        }

        tx.commit()?;
        Ok(new_facts.len())
    }

    /// Record a terminal extraction failure
    pub fn mark_extraction_failed(&self, message_id: i64, error: &str) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            &format!(
                "UPDATE {} SET {} = ? WHERE {} = ?",
                messages::TABLE,
                messages::PROCESSING_ERROR,
                messages::ID
            ),
            params![error, message_id],
        )?;
        Ok(())
    }

    /// Clear terminal extraction errors, optionally for one user only.
    /// Returns the number of messages made eligible again.
    pub fn requeue_failed(&self, user_id: Option<&str>) -> Result<u64> {
        let conn = self.get_connection()?;
        let mut query = format!(
            "UPDATE {} SET {} = '' WHERE {} = 0 AND {} != ''",
            messages::TABLE,
            messages::PROCESSING_ERROR,
            messages::PROCESSED,
            messages::PROCESSING_ERROR
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(user_id) = user_id {
            query.push_str(&format!(" AND {} = ?", messages::USER_ID));
            params.push(Box::new(user_id.to_string()));
        }

        let changed = conn.execute(&query, rusqlite::params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    /// Query messages: `(total matching rows, page)`
    pub fn query_messages(&self, query: &QueryBuilder) -> Result<(u64, Vec<StoredMessage>)> {
        self.run_query(messages::TABLE, query, Self::map_message)
    }

    fn map_message(row: &Row) -> rusqlite::Result<StoredMessage> {
        Ok(StoredMessage {
            id: row.get(messages::ID)?,
            user_id: row.get(messages::USER_ID)?,
            provider_message_id: row.get(messages::PROVIDER_MESSAGE_ID)?,
            thread_id: row.get(messages::THREAD_ID)?,
            history_id: row.get(messages::HISTORY_ID)?,
            sender: row.get(messages::SENDER)?,
            recipient: row.get(messages::RECIPIENT)?,
            subject: row.get(messages::SUBJECT)?,
            body: row.get(messages::BODY)?,
            snippet: row.get(messages::SNIPPET)?,
            timestamp: row.get(messages::TIMESTAMP)?,
            labels: json_column(row, messages::LABELS)?,
            has_attachments: row.get(messages::HAS_ATTACHMENTS)?,
            size_estimate: row.get(messages::SIZE_ESTIMATE)?,
            processed: row.get(messages::PROCESSED)?,
            processing_error: row.get(messages::PROCESSING_ERROR)?,
            created_at: row.get(messages::CREATED_AT)?,
        })
    }

    // ------------------------------------------------------------------------
    // Facts
    // ------------------------------------------------------------------------

    /// Query facts: `(total matching rows, page)`
    pub fn query_facts(&self, query: &QueryBuilder) -> Result<(u64, Vec<Fact>)> {
        self.run_query(facts::TABLE, query, Self::map_fact)
    }

    /// Facts extracted from one message, in insert order
    pub fn facts_for_message(&self, message_id: i64) -> Result<Vec<Fact>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE {} = ? ORDER BY {} ASC",
            facts::TABLE,
            facts::MESSAGE_ID,
            facts::ID
        ))?;
        let rows = stmt
            .query_map(params![message_id], Self::map_fact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn map_fact(row: &Row) -> rusqlite::Result<Fact> {
        let fact_type: String = row.get(facts::TYPE)?;
        Ok(Fact {
            id: row.get(facts::ID)?,
            message_id: row.get(facts::MESSAGE_ID)?,
            user_id: row.get(facts::USER_ID)?,
            fact_type: fact_type.parse::<FactType>().map_err(conversion_error)?,
            value: row.get(facts::VALUE)?,
            confidence: row.get(facts::CONFIDENCE)?,
            metadata: json_column(row, facts::METADATA)?,
            created_at: row.get(facts::CREATED_AT)?,
        })
    }

    // ------------------------------------------------------------------------
    // Query building
    // ------------------------------------------------------------------------

    fn run_query<T>(
        &self,
        table: &str,
        query: &QueryBuilder,
        map: fn(&Row) -> rusqlite::Result<T>,
    ) -> Result<(u64, Vec<T>)> {
        let conn = self.get_connection()?;
        let (where_clause, params) = build_where(query);

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table}{where_clause}"),
            rusqlite::params_from_iter(params.iter()),
            |row| row.get(0),
        )?;

        let mut sql = format!("SELECT * FROM {table}{where_clause}");
        if let Some(column) = query.order_by_desc {
            sql.push_str(&format!(" ORDER BY {column} DESC, id DESC"));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), map)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((u64::try_from(total).unwrap_or_default(), rows))
    }
}

/// Render the filters of a query as a WHERE clause and its parameters
fn build_where(query: &QueryBuilder) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses = Vec::with_capacity(query.filters.len());
    let mut params: Vec<Box<dyn ToSql>> = Vec::with_capacity(query.filters.len());

    for filter in &query.filters {
        if filter.operator == Operator::Contains {
            clauses.push(format!("{} LIKE ? ESCAPE '\\'", filter.field));
            let needle = match &filter.value {
                FilterType::Text(text) => text.clone(),
                FilterType::Float(value) => value.to_string(),
                FilterType::Date(value) => value.to_rfc3339(),
            };
            params.push(Box::new(format!("%{}%", escape_like(&needle))));
            continue;
        }

        clauses.push(format!("{} {} ?", filter.field, filter.operator.as_sql()));
        match &filter.value {
            FilterType::Text(text) => params.push(Box::new(text.clone())),
            FilterType::Float(value) => params.push(Box::new(*value)),
            FilterType::Date(value) => params.push(Box::new(*value)),
        }
    }

    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}

/// Escape LIKE wildcards so the needle matches literally
#[must_use]
pub fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, message.into())
}

fn json_column<T: DeserializeOwned>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}
