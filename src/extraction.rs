//! Fact extraction over the queue of unprocessed messages.
//!
//! Every selected message ends the batch in one of two terminal states: processed with
//! its facts stored, or carrying a non-empty `processing_error`. A failure on one message
//! never aborts the batch.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::db::Database;
use crate::error::{PipelineError, Result};
use crate::models::{ExtractionStats, FactType, NewFact, StoredMessage};
use crate::nlu::{CompletionRequest, NluError, NluService};
use crate::validation::InputValidator;

const EXTRACTION_TEMPERATURE: f32 = 0.1;
const EXTRACTION_MAX_TOKENS: u32 = 1_500;
const DEFAULT_CONFIDENCE: f64 = 0.5;

const EXTRACTION_PROMPT: &str = r#"You extract structured facts from a single email.

Reply with one JSON object of the form {"entities": [...]}. Each entity is
{"type": "<type>", "value": "<text>", "confidence": <0.0-1.0>, "metadata": {...}}.

Types and their metadata:
- price: currency, rawText, merchant
- merchant: domain, category
- otp: expiresInSeconds, service
- flight_pnr: airline, from, to, departure
- flight_route: from, to, airline
- job_company: role, jobBoard
- job_status: company, role, stage (applied, interview, offer or rejected)
- date: context, format
- tracking_num: carrier, url
- subscription: service, billingCycle, amount
- sender_domain: domain
- custom: description

Only report what the email states explicitly. Prices are plain decimals such as "349.00";
one-time codes are the bare code. Repeated types are fine. Use an empty array when the
email holds nothing useful. Confidence is 0.9 or more for explicit values, 0.5 to 0.8 for
inferred ones and below 0.5 when unsure."#;

/// Result of one extraction batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Per-message outcome counters
    pub stats: ExtractionStats,
    /// Facts written across the batch
    pub facts_created: u64,
}

/// Extraction pipeline over the message store and the NLU service
pub struct FactExtractor {
    db: Database,
    nlu: Arc<dyn NluService>,
    settings: ExtractionConfig,
}

impl FactExtractor {
    pub fn new(db: Database, nlu: Arc<dyn NluService>, settings: ExtractionConfig) -> Self {
        Self { db, nlu, settings }
    }

    /// Process up to `batch_size` messages, oldest first
    pub async fn extract_batch(&self, batch_size: usize) -> Result<BatchReport> {
        InputValidator::validate_batch_size(batch_size)?;

        let batch = self.db.unextracted_messages(batch_size)?;
        let mut report = BatchReport {
            stats: ExtractionStats {
                total: batch.len() as u64,
                ..ExtractionStats::default()
            },
            facts_created: 0,
        };
        info!(messages = batch.len(), "Extraction batch started");

        for message in &batch {
            match self.extract_message(message).await {
                Ok(written) => {
                    report.stats.processed += 1;
                    report.facts_created += written as u64;
                    debug!(message_id = message.id, facts = written, "Message processed");
                }
                Err(e) => {
                    report.stats.failed += 1;
                    let reason = InputValidator::truncate_chars(&e.to_string(), self.settings.max_error_chars);
                    warn!(message_id = message.id, error = %reason, "Extraction failed");
                    if let Err(store_err) = self.db.mark_extraction_failed(message.id, &reason) {
                        warn!(message_id = message.id, error = %store_err, "Failed to record extraction error");
                    }
                }
            }
        }

        info!(
            processed = report.stats.processed,
            failed = report.stats.failed,
            facts = report.facts_created,
            "Extraction batch completed"
        );
        Ok(report)
    }

    async fn extract_message(&self, message: &StoredMessage) -> Result<usize> {
        let request = CompletionRequest {
            system: EXTRACTION_PROMPT.to_string(),
            user: self.render_message(message),
            temperature: EXTRACTION_TEMPERATURE,
            max_tokens: EXTRACTION_MAX_TOKENS,
        };

        let response = self.nlu.complete_json(request).await?;
        let facts = parse_entities(&response)
            .map_err(|reason| PipelineError::Nlu(NluError::InvalidSchema(reason)))?;

        self.db.complete_extraction(message, &facts, Utc::now())
    }

    fn render_message(&self, message: &StoredMessage) -> String {
        format!(
            "From: {}\nSubject: {}\nDate: {}\n\n{}",
            message.sender,
            message.subject,
            message.timestamp.to_rfc3339(),
            InputValidator::truncate_utf8(&message.body, self.settings.max_body_bytes)
        )
    }
}

/// Validate an extraction response into facts.
///
/// The response must be an object with an `entities` array. Entries that are not
/// objects or name an unknown type are dropped; every other field is coerced.
pub fn parse_entities(response: &Value) -> std::result::Result<Vec<NewFact>, String> {
    let entities = response
        .as_object()
        .ok_or_else(|| "response is not a JSON object".to_string())?
        .get("entities")
        .and_then(Value::as_array)
        .ok_or_else(|| "response has no entities array".to_string())?;

    let mut facts = Vec::with_capacity(entities.len());
    for entry in entities {
        let Some(entity) = entry.as_object() else {
            warn!(entry = %entry, "Dropping non-object entity");
            continue;
        };

        let fact_type = entity
            .get("type")
            .and_then(Value::as_str)
            .and_then(|name| name.parse::<FactType>().ok());
        let Some(fact_type) = fact_type else {
            warn!(entity_type = ?entity.get("type"), "Dropping entity of unknown type");
            continue;
        };

        facts.push(NewFact {
            fact_type,
            value: entity_value(entity),
            confidence: entity_confidence(entity),
            metadata: entity
                .get("metadata")
                .filter(|metadata| metadata.is_object())
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
        });
    }

    Ok(facts)
}

fn entity_value(entity: &Map<String, Value>) -> String {
    match entity.get("value") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn entity_confidence(entity: &Map<String, Value>) -> f64 {
    let raw = match entity.get("confidence") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    raw.filter(|c| c.is_finite())
        .unwrap_or(DEFAULT_CONFIDENCE)
        .clamp(0.0, 1.0)
}
