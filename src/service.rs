use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::extraction::FactExtractor;
use crate::gmail::{GmailClient, MailProvider};
use crate::intent::IntentEngine;
use crate::logging::OperationTimer;
use crate::metrics::MetricsCollector;
use crate::models::{ExtractionStats, NewUser, QueryAnswer, SyncStats};
use crate::nlu::{NluService, OpenAiClient};
use crate::sync::SyncEngine;
use crate::validation::InputValidator;
use crate::vault::CredentialVault;

/// Structured failure outcome reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
    pub status: u16,
}

impl From<&PipelineError> for ErrorResponse {
    fn from(err: &PipelineError) -> Self {
        Self {
            error: err.to_string(),
            kind: err.kind(),
            status: err.status_code(),
        }
    }
}

/// The three pipeline operations plus user registration and operator recovery
pub struct Pipeline {
    db: Database,
    vault: CredentialVault,
    sync: SyncEngine,
    extractor: FactExtractor,
    intent: IntentEngine,
    metrics: MetricsCollector,
    config: AppConfig,
}

impl Pipeline {
    /// Open the store and build the Gmail and OpenAI clients from configuration
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let provider = GmailClient::new(&config.google)?;
        let nlu = OpenAiClient::new(&config.nlu)?;
        let db = Database::new(&config.database)?;
        Self::new(db, Arc::new(provider), Arc::new(nlu), config)
    }

    /// Assemble a pipeline over explicit collaborators
    pub fn new(
        db: Database,
        provider: Arc<dyn MailProvider>,
        nlu: Arc<dyn NluService>,
        config: AppConfig,
    ) -> Result<Self> {
        let vault = CredentialVault::new(&config.vault.key)?;
        let metrics = MetricsCollector::default();

        Ok(Self {
            sync: SyncEngine::new(db.clone(), vault.clone(), provider, config.sync.clone()),
            extractor: FactExtractor::new(db.clone(), Arc::clone(&nlu), config.extraction.clone()),
            intent: IntentEngine::new(db.clone(), nlu, config.query.clone(), metrics),
            db,
            vault,
            metrics,
            config,
        })
    }

    /// Store (or replace) a user's tokens, sealed by the vault
    pub fn register_user(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        InputValidator::validate_user_id(user_id)?;
        if refresh_token.trim().is_empty() {
            return Err(PipelineError::InvalidInput("refresh token cannot be empty".to_string()));
        }

        let user = NewUser {
            id: user_id.to_string(),
            access_token_enc: self.vault.encrypt(access_token)?,
            refresh_token_enc: self.vault.encrypt(refresh_token)?,
            token_expires_at,
        };
        self.db.upsert_user(&user, Utc::now())?;
        info!(user_id, "User registered");
        Ok(())
    }

    /// Run one incremental sync for a user
    pub async fn trigger_sync(&self, user_id: &str) -> Result<SyncStats> {
        InputValidator::validate_user_id(user_id)?;
        let timer = OperationTimer::new("sync");
        let result = self.sync.sync(user_id).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(PipelineError::Conflict(_)) => "conflict",
            Err(PipelineError::Auth(_)) => "auth",
            Err(_) => "error",
        };
        self.metrics.record_sync(result.as_ref().ok(), status, timer.finish());
        result
    }

    /// Sync every registered user in turn; failures are logged and do not stop the round
    pub async fn sync_all(&self) -> Result<Vec<(String, Result<SyncStats>)>> {
        let mut outcomes = Vec::new();
        for user_id in self.db.list_user_ids()? {
            let outcome = self.trigger_sync(&user_id).await;
            if let Err(e) = &outcome {
                match e.kind() {
                    ErrorKind::Conflict => info!(user_id = %user_id, "Sync skipped, already running"),
                    _ => warn!(user_id = %user_id, error = %e, "Scheduled sync failed"),
                }
            }
            outcomes.push((user_id, outcome));
        }
        Ok(outcomes)
    }

    /// Extract facts from up to `batch_size` messages (configured default when `None`)
    pub async fn extract_batch(&self, batch_size: Option<usize>) -> Result<ExtractionStats> {
        let batch_size = batch_size.unwrap_or(self.config.extraction.batch_size);
        let timer = OperationTimer::new("extract");
        let report = self.extractor.extract_batch(batch_size).await?;
        self.metrics
            .record_extraction(&report.stats, report.facts_created, timer.finish());
        Ok(report.stats)
    }

    /// Answer a natural-language question about a user's mail
    pub async fn answer_query(&self, user_id: &str, question: &str) -> Result<QueryAnswer> {
        self.answer_query_at(user_id, question, Utc::now()).await
    }

    /// Answer a question with relative dates resolved against `now`
    pub async fn answer_query_at(
        &self,
        user_id: &str,
        question: &str,
        now: DateTime<Utc>,
    ) -> Result<QueryAnswer> {
        let timer = OperationTimer::new("query");
        let result = self.intent.answer(user_id, question, now).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => match e.kind() {
                ErrorKind::InvalidInput => "invalid_input",
                ErrorKind::NotUnderstood => "not_understood",
                ErrorKind::QueryFailed => "query_failed",
                _ => "error",
            },
        };
        self.metrics.record_query(status, timer.finish());
        result
    }

    /// Make terminally failed messages eligible for extraction again
    pub fn requeue_failed(&self, user_id: Option<&str>) -> Result<u64> {
        if let Some(user_id) = user_id {
            InputValidator::validate_user_id(user_id)?;
        }
        let requeued = self.db.requeue_failed(user_id)?;
        info!(user_id = user_id.unwrap_or("*"), requeued, "Requeued failed extractions");
        Ok(requeued)
    }

    /// Run sync-all and extraction on their configured intervals until Ctrl-C
    pub async fn run_schedule(&self) -> Result<()> {
        let schedule = &self.config.schedule;
        let mut sync_tick = tokio::time::interval(Duration::from_secs(schedule.sync_interval_secs));
        let mut extract_tick = tokio::time::interval(Duration::from_secs(schedule.extract_interval_secs));
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        extract_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!(
            sync_interval_secs = schedule.sync_interval_secs,
            extract_interval_secs = schedule.extract_interval_secs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = sync_tick.tick() => {
                    if let Err(e) = self.sync_all().await {
                        error!(error = %e, "Could not list users for scheduled sync");
                    }
                }
                _ = extract_tick.tick() => {
                    if let Err(e) = self.extract_batch(None).await {
                        error!(error = %e, "Scheduled extraction failed");
                    }
                }
                signal = &mut shutdown => {
                    signal?;
                    info!("Shutdown requested, scheduler stopping");
                    return Ok(());
                }
            }
        }
    }
}
