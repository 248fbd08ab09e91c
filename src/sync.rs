//! Incremental mailbox synchronization.
//!
//! One run per user at a time: lock, refresh credentials, discover new message ids
//! (history cursor first, date-bounded listing as fallback), fetch in concurrent rounds,
//! normalize, insert with natural-key dedup, then release the lock with the best-known
//! cursor. The lock is released on every path out of [`SyncEngine::sync`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::db::Database;
use crate::error::{PipelineError, Result};
use crate::gmail::{GmailMessage, MailProvider, ProviderError};
use crate::models::{CursorUpdate, SyncStats, SyncStatus, User};
use crate::normalize::normalize;
use crate::vault::CredentialVault;

/// Where the message ids of a run came from
#[derive(Debug)]
struct Discovery {
    ids: Vec<String>,
    /// Date-bounded listing was used; no usable cursor exists
    fallback: bool,
}

/// Mailbox sync engine
pub struct SyncEngine {
    db: Database,
    vault: CredentialVault,
    provider: Arc<dyn MailProvider>,
    settings: SyncConfig,
}

impl SyncEngine {
    /// Create an engine over the store, vault and provider
    pub fn new(
        db: Database,
        vault: CredentialVault,
        provider: Arc<dyn MailProvider>,
        settings: SyncConfig,
    ) -> Self {
        Self {
            db,
            vault,
            provider,
            settings,
        }
    }

    /// Run one sync for `user_id`.
    ///
    /// Returns `Conflict` without touching anything when a run already holds the lock.
    pub async fn sync(&self, user_id: &str) -> Result<SyncStats> {
        let user = self.db.begin_sync(user_id)?;
        info!(user_id, cursor = %user.history_cursor, "Sync started");

        let mut cursor = CursorUpdate::Keep;
        let outcome = self.run(&user, &mut cursor).await;

        let status = if outcome.is_ok() {
            SyncStatus::Idle
        } else {
            SyncStatus::Error
        };
        let released = self.db.finish_sync(user_id, status, &cursor, Utc::now());

        match (outcome, released) {
            (Ok(stats), Ok(())) => {
                info!(
                    user_id,
                    fetched = stats.fetched,
                    stored = stats.stored,
                    skipped = stats.skipped,
                    failed = stats.failed,
                    "Sync completed"
                );
                Ok(stats)
            }
            (Ok(_), Err(release_err)) => {
                error!(user_id, error = %release_err, "Failed to release sync lock");
                Err(release_err)
            }
            (Err(run_err), released) => {
                if let Err(release_err) = released {
                    error!(user_id, error = %release_err, "Failed to release sync lock");
                }
                error!(user_id, error = %run_err, "Sync failed");
                Err(run_err)
            }
        }
    }

    async fn run(&self, user: &User, cursor: &mut CursorUpdate) -> Result<SyncStats> {
        let access_token = self.access_token(user).await?;

        let discovery = self.discover(user, &access_token, cursor).await?;
        if discovery.ids.is_empty() {
            debug!(user_id = %user.id, "No new messages");
            return Ok(SyncStats::default());
        }

        let fetched = self.fetch_all(&access_token, &discovery.ids).await;

        if discovery.fallback {
            if let Some(derived) = max_history_id(&fetched) {
                *cursor = CursorUpdate::Set(derived.to_string());
            }
        }

        let mut stats = self.store_all(user, &fetched);
        stats.fetched = discovery.ids.len() as u64;
        Ok(stats)
    }

    /// Decrypt the access token, refreshing it when missing or near expiry
    async fn access_token(&self, user: &User) -> Result<String> {
        let access_token = self.vault.decrypt(&user.access_token_enc);
        let buffer = Duration::seconds(self.settings.refresh_buffer_secs);
        let fresh = user
            .token_expires_at
            .is_some_and(|expires_at| Utc::now() + buffer < expires_at);

        if fresh && !access_token.is_empty() {
            return Ok(access_token);
        }

        let refresh_token = self.vault.decrypt(&user.refresh_token_enc);
        if refresh_token.is_empty() {
            return Err(PipelineError::Auth(
                "refresh token unavailable; re-authentication required".to_string(),
            ));
        }

        debug!(user_id = %user.id, "Refreshing access token");
        let grant = self.provider.refresh_access_token(&refresh_token).await?;
        let sealed = self.vault.encrypt(&grant.access_token)?;
        self.db.update_access_token(&user.id, &sealed, grant.expires_at)?;

        Ok(grant.access_token)
    }

    async fn discover(
        &self,
        user: &User,
        access_token: &str,
        cursor: &mut CursorUpdate,
    ) -> Result<Discovery> {
        let page_size = self.settings.page_size;

        if !user.history_cursor.is_empty() {
            match self
                .provider
                .list_history(access_token, &user.history_cursor, page_size)
                .await
            {
                Ok(page) => {
                    let next = page
                        .cursor
                        .unwrap_or_else(|| user.history_cursor.clone());
                    if next != user.history_cursor {
                        *cursor = CursorUpdate::Set(next);
                    }
                    return Ok(Discovery {
                        ids: dedup(page.message_ids),
                        fallback: false,
                    });
                }
                Err(ProviderError::CursorExpired) => {
                    warn!(user_id = %user.id, "History cursor expired, falling back to date listing");
                    *cursor = CursorUpdate::Clear;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let after = user
            .last_synced_at
            .unwrap_or_else(|| Utc::now() - Duration::days(self.settings.lookback_days));
        let ids = self
            .provider
            .list_messages_after(access_token, after, page_size)
            .await?;

        Ok(Discovery {
            ids: dedup(ids),
            fallback: true,
        })
    }

    /// Fetch full messages in concurrent rounds; failures are logged and skipped
    async fn fetch_all(&self, access_token: &str, ids: &[String]) -> Vec<GmailMessage> {
        let mut fetched = Vec::with_capacity(ids.len());

        for round in ids.chunks(self.settings.fetch_batch_size.max(1)) {
            let results = join_all(
                round
                    .iter()
                    .map(|id| self.provider.get_message(access_token, id)),
            )
            .await;

            for (id, result) in round.iter().zip(results) {
                match result {
                    Ok(message) => fetched.push(message),
                    Err(e) => warn!(message_id = %id, error = %e, "Skipping message that failed to fetch"),
                }
            }
        }

        fetched
    }

    fn store_all(&self, user: &User, fetched: &[GmailMessage]) -> SyncStats {
        let mut stats = SyncStats::default();

        for message in fetched {
            let stored = normalize(message, &user.id, Utc::now())
                .and_then(|record| self.db.insert_message(&record, Utc::now()));

            match stored {
                Ok(true) => stats.stored += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(user_id = %user.id, message_id = %message.id, error = %e, "Failed to store message");
                }
            }
        }

        stats
    }
}

/// Remove repeated ids, keeping first occurrences in order
fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Largest numeric history id among fetched messages
fn max_history_id(messages: &[GmailMessage]) -> Option<u64> {
    messages
        .iter()
        .filter_map(|m| m.history_id.as_deref())
        .filter_map(|id| id.trim().parse::<u64>().ok())
        .max()
}
