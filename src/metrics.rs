use metrics::{counter, histogram};
use std::time::Duration;

use crate::models::{ExtractionStats, SyncStats};

/// Metrics collection and management
///
/// Only the `metrics` facade is used here; nothing is exported unless the embedding
/// application installs a recorder.
#[derive(Debug, Clone, Copy)]
pub struct MetricsCollector {
    // Sync metrics
    pub sync_runs_total: &'static str,
    pub sync_messages_total: &'static str,
    pub sync_duration: &'static str,

    // Extraction metrics
    pub extraction_messages_total: &'static str,
    pub facts_created_total: &'static str,
    pub extraction_duration: &'static str,

    // Query metrics
    pub queries_total: &'static str,
    pub answer_fallbacks_total: &'static str,
    pub query_duration: &'static str,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            sync_runs_total: "mailfacts_sync_runs_total",
            sync_messages_total: "mailfacts_sync_messages_total",
            sync_duration: "mailfacts_sync_duration_seconds",

            extraction_messages_total: "mailfacts_extraction_messages_total",
            facts_created_total: "mailfacts_facts_created_total",
            extraction_duration: "mailfacts_extraction_duration_seconds",

            queries_total: "mailfacts_queries_total",
            answer_fallbacks_total: "mailfacts_answer_fallbacks_total",
            query_duration: "mailfacts_query_duration_seconds",
        }
    }
}

impl MetricsCollector {
    /// Record the outcome of one sync run
    pub fn record_sync(&self, stats: Option<&SyncStats>, status: &'static str, duration: Duration) {
        counter!(self.sync_runs_total, "status" => status).increment(1);
        histogram!(self.sync_duration).record(duration.as_secs_f64());

        if let Some(stats) = stats {
            counter!(self.sync_messages_total, "outcome" => "stored").increment(stats.stored);
            counter!(self.sync_messages_total, "outcome" => "skipped").increment(stats.skipped);
            counter!(self.sync_messages_total, "outcome" => "failed").increment(stats.failed);
        }
    }

    /// Record one extraction batch
    pub fn record_extraction(&self, stats: &ExtractionStats, facts_created: u64, duration: Duration) {
        counter!(self.extraction_messages_total, "outcome" => "processed").increment(stats.processed);
        counter!(self.extraction_messages_total, "outcome" => "failed").increment(stats.failed);
        counter!(self.facts_created_total).increment(facts_created);
        histogram!(self.extraction_duration).record(duration.as_secs_f64());
    }

    /// Record one answered (or rejected) query
    pub fn record_query(&self, status: &'static str, duration: Duration) {
        counter!(self.queries_total, "status" => status).increment(1);
        histogram!(self.query_duration).record(duration.as_secs_f64());
    }

    /// Record a templated answer used instead of the narration service
    pub fn record_answer_fallback(&self) {
        counter!(self.answer_fallbacks_total).increment(1);
    }
}
