//! Natural-language questions over stored facts and messages.
//!
//! A question goes through three phases: the NLU service turns it into an [`Intent`],
//! the intent runs as a parameterized store query, and the NLU service narrates the
//! result. Narration failures fall back to a fixed template, so a valid intent over a
//! readable store always produces an answer.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::QueryConfig;
use crate::db::Database;
use crate::error::{PipelineError, Result};
use crate::metrics::MetricsCollector;
use crate::models::{
    DateRange, FactType, FilterType, Intent, IntentAction, IntentEntity, IntentFilter, Operator,
    QueryAnswer, QueryBuilder, QueryDocuments, QueryResult,
};
use crate::nlu::{CompletionRequest, NluService};
use crate::schema::{facts, messages};
use crate::validation::InputValidator;

/// Limit applied when the intent names none
pub const DEFAULT_LIMIT: u32 = 20;
/// Largest page an intent may request
pub const MAX_LIMIT: u32 = 100;
/// Rows shown to the narration step
const ANSWER_SAMPLE_ROWS: usize = 10;

const INTENT_TEMPERATURE: f32 = 0.0;
const ANSWER_TEMPERATURE: f32 = 0.3;
const NLU_MAX_TOKENS: u32 = 300;

const ANSWER_PROMPT: &str = "You answer questions about the user's own email. \
Use only the data provided and be direct, with currency symbols where they apply. \
When the data is empty say so plainly and suggest what the question may have missed. \
Stay within three sentences unless a list was asked for.";

fn intent_prompt(now: DateTime<Utc>) -> String {
    format!(
        r#"You turn a question about the user's email into a JSON query intent.

Reply with one JSON object:
{{
  "action": "sum" | "count" | "list" | "find" | "summarize",
  "entity": "price" | "merchant" | "otp" | "flight_pnr" | "flight_route" | "job_status" | "job_company" | "tracking_num" | "subscription" | "date" | "sender_domain" | "custom" | "email",
  "filter": {{
    "merchant": string or null,
    "type": entity type or null,
    "month": "current", "YYYY-MM" or null,
    "dateFrom": ISO 8601 or null,
    "dateTo": ISO 8601 or null,
    "keyword": string or null
  }},
  "limit": integer from 1 to 100, 20 when unsure
}}

Examples:
"How much did I spend at Blue Bottle?" -> {{"action": "sum", "entity": "price", "filter": {{"merchant": "Blue Bottle"}}, "limit": 100}}
"Total spent this month" -> {{"action": "sum", "entity": "price", "filter": {{"month": "current"}}, "limit": 100}}
"Which applications got rejected?" -> {{"action": "list", "entity": "job_status", "filter": {{"keyword": "rejected"}}, "limit": 20}}
"Login codes from this week" -> {{"action": "list", "entity": "otp", "filter": {{"dateFrom": "<7 days ago>", "dateTo": "<now>"}}, "limit": 50}}
"Emails about my lease" -> {{"action": "find", "entity": "email", "filter": {{"keyword": "lease"}}, "limit": 20}}

Current date: {}"#,
        now.to_rfc3339()
    )
}

/// Parses, executes and answers questions for one store
pub struct IntentEngine {
    db: Database,
    nlu: Arc<dyn NluService>,
    settings: QueryConfig,
    metrics: MetricsCollector,
}

impl IntentEngine {
    pub fn new(
        db: Database,
        nlu: Arc<dyn NluService>,
        settings: QueryConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            db,
            nlu,
            settings,
            metrics,
        }
    }

    /// Answer `question` for `user_id`, resolving relative dates against `now`
    pub async fn answer(&self, user_id: &str, question: &str, now: DateTime<Utc>) -> Result<QueryAnswer> {
        InputValidator::validate_user_id(user_id)?;
        let question = InputValidator::validate_question(question, self.settings.max_question_chars)?;

        let intent = self.parse(question, now).await?;
        debug!(user_id, ?intent, "Parsed intent");

        let data = self.execute(user_id, &intent, now)?;
        let answer = self.narrate(question, &intent, &data).await;

        info!(user_id, action = ?intent.action, count = data.count, "Query answered");
        Ok(QueryAnswer { answer, intent, data })
    }

    async fn parse(&self, question: &str, now: DateTime<Utc>) -> Result<Intent> {
        let request = CompletionRequest {
            system: intent_prompt(now),
            user: question.to_string(),
            temperature: INTENT_TEMPERATURE,
            max_tokens: NLU_MAX_TOKENS,
        };

        let raw = self.nlu.complete_json(request).await.map_err(|e| {
            warn!(error = %e, "Intent request failed");
            PipelineError::NotUnderstood(e.to_string())
        })?;

        parse_intent(&raw).map_err(|reason| {
            warn!(%reason, intent = %raw, "Rejected intent");
            PipelineError::NotUnderstood(reason)
        })
    }

    /// Run an intent against the store
    pub fn execute(&self, user_id: &str, intent: &Intent, now: DateTime<Utc>) -> Result<QueryResult> {
        let range = resolve_date_range(&intent.filter, now);

        if intent.entity.is_email() {
            let mut query = QueryBuilder::new();
            query.add_filter(messages::USER_ID, Operator::Equal, FilterType::Text(user_id.to_string()));
            if let Some(keyword) = &intent.filter.keyword {
                query.add_filter(messages::SUBJECT, Operator::Contains, FilterType::Text(keyword.clone()));
            }
            query.add_date_range(messages::TIMESTAMP, range);
            query.set_order_by_desc(messages::TIMESTAMP);
            query.set_limit(intent.limit);

            let (total, rows) = self.db.query_messages(&query).map_err(query_failed)?;
            return Ok(QueryResult {
                action: intent.action,
                total: None,
                count: total,
                documents: QueryDocuments::Messages(rows),
            });
        }

        let mut query = QueryBuilder::new();
        query.add_filter(facts::USER_ID, Operator::Equal, FilterType::Text(user_id.to_string()));
        query.add_filter(
            facts::CONFIDENCE,
            Operator::GreaterThan,
            FilterType::Float(self.settings.min_confidence),
        );

        let entity_type = match intent.entity {
            IntentEntity::Fact(fact_type) => Some(fact_type),
            IntentEntity::Email(_) => None,
        };
        if let Some(fact_type) = intent.filter.fact_type.or(entity_type) {
            query.add_filter(facts::TYPE, Operator::Equal, FilterType::Text(fact_type.as_str().to_string()));
        }
        for needle in [&intent.filter.merchant, &intent.filter.keyword].into_iter().flatten() {
            query.add_filter(facts::VALUE, Operator::Contains, FilterType::Text(needle.clone()));
        }
        query.add_date_range(facts::CREATED_AT, range);
        query.set_order_by_desc(facts::CREATED_AT);
        query.set_limit(intent.limit);

        let (matching, rows) = self.db.query_facts(&query).map_err(query_failed)?;

        if intent.action == IntentAction::Sum {
            let total = rows.iter().map(|fact| parse_amount(&fact.value)).sum::<f64>();
            return Ok(QueryResult {
                action: intent.action,
                total: Some(round_cents(total)),
                count: rows.len() as u64,
                documents: QueryDocuments::Facts(rows),
            });
        }

        Ok(QueryResult {
            action: intent.action,
            total: None,
            count: matching,
            documents: QueryDocuments::Facts(rows),
        })
    }

    async fn narrate(&self, question: &str, intent: &Intent, data: &QueryResult) -> String {
        let request = CompletionRequest {
            system: ANSWER_PROMPT.to_string(),
            user: format!(
                "User asked: \"{question}\"\n\nIntent: {}\n\nData: {}",
                json!(intent),
                data_snippet(data)
            ),
            temperature: ANSWER_TEMPERATURE,
            max_tokens: NLU_MAX_TOKENS,
        };

        match self.nlu.complete_text(request).await {
            Ok(answer) if !answer.trim().is_empty() => answer,
            Ok(_) => {
                warn!("Narration was empty, using template answer");
                self.metrics.record_answer_fallback();
                fallback_answer(data.count)
            }
            Err(e) => {
                warn!(error = %e, "Narration failed, using template answer");
                self.metrics.record_answer_fallback();
                fallback_answer(data.count)
            }
        }
    }
}

fn query_failed(err: PipelineError) -> PipelineError {
    PipelineError::QueryFailed(err.to_string())
}

/// Deterministic answer used when narration is unavailable
#[must_use]
pub fn fallback_answer(count: u64) -> String {
    format!("Found {count} results. Please see data below.")
}

/// Count, total and the first rows reduced to `type`/`value`/`meta`
fn data_snippet(data: &QueryResult) -> Value {
    let sample: Vec<Value> = match &data.documents {
        QueryDocuments::Facts(rows) => rows
            .iter()
            .take(ANSWER_SAMPLE_ROWS)
            .map(|fact| json!({"type": fact.fact_type, "value": fact.value, "meta": fact.metadata}))
            .collect(),
        QueryDocuments::Messages(rows) => rows
            .iter()
            .take(ANSWER_SAMPLE_ROWS)
            .map(|message| {
                json!({
                    "type": "email",
                    "value": message.subject,
                    "meta": {"from": message.sender, "timestamp": message.timestamp},
                })
            })
            .collect(),
    };

    json!({"count": data.count, "total": data.total, "sample": sample})
}

/// Validate a raw intent object.
///
/// Unknown actions, entities or types, wrongly typed fields and unparseable dates are
/// rejected. A missing `limit` becomes [`DEFAULT_LIMIT`]; any limit is clamped to
/// `[1, MAX_LIMIT]`.
pub fn parse_intent(raw: &Value) -> std::result::Result<Intent, String> {
    let object = raw
        .as_object()
        .ok_or_else(|| "intent is not a JSON object".to_string())?;

    let action: IntentAction = serde_json::from_value(object.get("action").cloned().unwrap_or(Value::Null))
        .map_err(|_| format!("unknown action: {}", field_text(object, "action")))?;
    let entity: IntentEntity = serde_json::from_value(object.get("entity").cloned().unwrap_or(Value::Null))
        .map_err(|_| format!("unknown entity: {}", field_text(object, "entity")))?;

    let filter = match object.get("filter") {
        None | Some(Value::Null) => IntentFilter::default(),
        Some(Value::Object(fields)) => parse_filter(fields)?,
        Some(_) => return Err("filter must be an object".to_string()),
    };

    let limit = match object.get("limit") {
        None | Some(Value::Null) => DEFAULT_LIMIT,
        Some(Value::Number(n)) => {
            let requested = n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
                .ok_or_else(|| format!("invalid limit: {n}"))?;
            requested.clamp(1, i64::from(MAX_LIMIT)) as u32
        }
        Some(other) => return Err(format!("limit must be a number, got {other}")),
    };

    Ok(Intent {
        action,
        entity,
        filter,
        limit,
    })
}

fn field_text(object: &Map<String, Value>, key: &str) -> String {
    object.get(key).map_or_else(|| "missing".to_string(), Value::to_string)
}

fn parse_filter(fields: &Map<String, Value>) -> std::result::Result<IntentFilter, String> {
    let fact_type = optional_text(fields, "type")?
        .map(|name| name.parse::<FactType>())
        .transpose()
        .map_err(|e| format!("invalid filter type: {e}"))?;

    Ok(IntentFilter {
        merchant: optional_text(fields, "merchant")?,
        fact_type,
        month: optional_text(fields, "month")?,
        date_from: optional_date(fields, "dateFrom")?,
        date_to: optional_date(fields, "dateTo")?,
        keyword: optional_text(fields, "keyword")?,
    })
}

/// Non-empty trimmed string, `None` for null or blank
fn optional_text(fields: &Map<String, Value>, key: &str) -> std::result::Result<Option<String>, String> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => {
            let text = text.trim();
            Ok((!text.is_empty()).then(|| text.to_string()))
        }
        Some(other) => Err(format!("filter.{key} must be a string, got {other}")),
    }
}

fn optional_date(fields: &Map<String, Value>, key: &str) -> std::result::Result<Option<DateTime<Utc>>, String> {
    optional_text(fields, key)?
        .map(|text| parse_timestamp(&text).ok_or_else(|| format!("filter.{key} is not a date: {text}")))
        .transpose()
}

/// RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC) or a bare date (midnight UTC)
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn month_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{4}-\d{2}$").expect("month pattern is valid"))
}

/// Date bound of a filter.
///
/// `"current"` and `YYYY-MM` months cover 00:00:00 on the first through 23:59:59 on the
/// last day (UTC); otherwise `dateFrom`/`dateTo` apply as given.
#[must_use]
pub fn resolve_date_range(filter: &IntentFilter, now: DateTime<Utc>) -> DateRange {
    let month_start = match filter.month.as_deref() {
        Some("current") => NaiveDate::from_ymd_opt(now.year(), now.month(), 1),
        Some(month) if month_pattern().is_match(month) => {
            let year = month[..4].parse::<i32>().ok();
            let number = month[5..].parse::<u32>().ok();
            year.zip(number)
                .and_then(|(year, number)| NaiveDate::from_ymd_opt(year, number, 1))
        }
        _ => None,
    };

    let month_range = month_start.and_then(|first| {
        let last = first.checked_add_months(Months::new(1))?.pred_opt()?;
        Some(DateRange {
            start: Some(Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0)?)),
            end: Some(Utc.from_utc_datetime(&last.and_hms_opt(23, 59, 59)?)),
        })
    });

    month_range.unwrap_or(DateRange {
        start: filter.date_from,
        end: filter.date_to,
    })
}

/// Leading decimal of a fact value with thousands separators removed; `0` when none
#[must_use]
pub fn parse_amount(value: &str) -> f64 {
    let cleaned: String = value.trim().chars().filter(|c| *c != ',').collect();

    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    for (idx, c) in cleaned.char_indices() {
        match c {
            '+' | '-' if idx == 0 => {}
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end = idx + c.len_utf8();
    }

    if !seen_digit {
        return 0.0;
    }
    cleaned[..end]
        .parse::<f64>()
        .ok()
        .filter(|amount| amount.is_finite())
        .unwrap_or(0.0)
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_parse_full_intent() {
        let intent = parse_intent(&json!({
            "action": "sum",
            "entity": "price",
            "filter": {"merchant": " Blue Bottle ", "month": "current", "keyword": null},
            "limit": 100
        }))
        .unwrap();

        assert_eq!(intent.action, IntentAction::Sum);
        assert_eq!(intent.entity, IntentEntity::Fact(FactType::Price));
        assert_eq!(intent.filter.merchant.as_deref(), Some("Blue Bottle"));
        assert_eq!(intent.filter.month.as_deref(), Some("current"));
        assert_eq!(intent.filter.keyword, None);
        assert_eq!(intent.limit, 100);
    }

    #[test]
    fn test_parse_email_entity_and_defaults() {
        let intent = parse_intent(&json!({"action": "find", "entity": "email"})).unwrap();
        assert_eq!(intent.entity, IntentEntity::EMAIL);
        assert_eq!(intent.filter, IntentFilter::default());
        assert_eq!(intent.limit, DEFAULT_LIMIT);
    }

    #[test]
    fn test_limit_is_clamped() {
        let parse = |limit: Value| parse_intent(&json!({"action": "list", "entity": "otp", "limit": limit}));
        assert_eq!(parse(json!(500)).unwrap().limit, 100);
        assert_eq!(parse(json!(0)).unwrap().limit, 1);
        assert_eq!(parse(json!(-3)).unwrap().limit, 1);
        assert_eq!(parse(json!(12.7)).unwrap().limit, 12);
        assert!(parse(json!("ten")).is_err());
    }

    #[test]
    fn test_schema_violations() {
        assert!(parse_intent(&json!("sum")).is_err());
        assert!(parse_intent(&json!({"action": "delete", "entity": "price"})).is_err());
        assert!(parse_intent(&json!({"action": "list", "entity": "flight"})).is_err());
        assert!(parse_intent(&json!({"action": "list"})).is_err());
        assert!(parse_intent(&json!({"action": "list", "entity": "price", "filter": []})).is_err());
        assert!(parse_intent(&json!({"action": "list", "entity": "price", "filter": {"type": "bogus"}})).is_err());
        assert!(parse_intent(&json!({"action": "list", "entity": "price", "filter": {"dateFrom": "last week"}})).is_err());
        assert!(parse_intent(&json!({"action": "list", "entity": "price", "filter": {"merchant": 7}})).is_err());
    }

    #[test]
    fn test_current_month_range() {
        let filter = IntentFilter {
            month: Some("current".to_string()),
            ..IntentFilter::default()
        };
        let range = resolve_date_range(&filter, at(2026, 3, 15, 9, 30, 0));
        assert_eq!(range.start, Some(at(2026, 3, 1, 0, 0, 0)));
        assert_eq!(range.end, Some(at(2026, 3, 31, 23, 59, 59)));
    }

    #[test]
    fn test_explicit_month_and_fallbacks() {
        let now = at(2026, 3, 15, 0, 0, 0);
        let february = IntentFilter {
            month: Some("2024-02".to_string()),
            ..IntentFilter::default()
        };
        let range = resolve_date_range(&february, now);
        assert_eq!(range.start, Some(at(2024, 2, 1, 0, 0, 0)));
        assert_eq!(range.end, Some(at(2024, 2, 29, 23, 59, 59)));

        let from = at(2026, 1, 1, 0, 0, 0);
        let unmatched = IntentFilter {
            month: Some("last month".to_string()),
            date_from: Some(from),
            ..IntentFilter::default()
        };
        assert_eq!(
            resolve_date_range(&unmatched, now),
            DateRange {
                start: Some(from),
                end: None
            }
        );

        let invalid = IntentFilter {
            month: Some("2026-13".to_string()),
            ..IntentFilter::default()
        };
        assert_eq!(resolve_date_range(&invalid, now), DateRange::default());
    }

    #[test]
    fn test_parse_dates() {
        assert_eq!(parse_timestamp("2026-03-01"), Some(at(2026, 3, 1, 0, 0, 0)));
        assert_eq!(parse_timestamp("2026-03-01T10:00:00Z"), Some(at(2026, 3, 1, 10, 0, 0)));
        assert_eq!(parse_timestamp("2026-03-01T10:00:00+02:00"), Some(at(2026, 3, 1, 8, 0, 0)));
        assert_eq!(parse_timestamp("2026-03-01T10:00:00"), Some(at(2026, 3, 1, 10, 0, 0)));
        assert_eq!(parse_timestamp("soon"), None);
    }

    #[test]
    fn test_parse_amount() {
        assert!((parse_amount("349.00") - 349.0).abs() < f64::EPSILON);
        assert!((parse_amount("1,299.50") - 1299.5).abs() < f64::EPSILON);
        assert!((parse_amount("12.5 USD") - 12.5).abs() < f64::EPSILON);
        assert!((parse_amount("-4") + 4.0).abs() < f64::EPSILON);
        assert_eq!(parse_amount("$10"), 0.0);
        assert_eq!(parse_amount("free"), 0.0);
        assert_eq!(parse_amount(""), 0.0);
    }

    #[test]
    fn test_round_cents() {
        assert!((round_cents(0.1 + 0.2) - 0.3).abs() < f64::EPSILON);
        assert!((round_cents(199.499_999) - 199.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fallback_answer() {
        assert_eq!(fallback_answer(3), "Found 3 results. Please see data below.");
    }
}
