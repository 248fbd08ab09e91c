use anyhow::Result;
use config::{Config, Environment, File, Value};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub vault: VaultConfig,
    pub google: GoogleConfig,
    pub nlu: NluConfig,
    pub sync: SyncConfig,
    pub extraction: ExtractionConfig,
    pub query: QueryConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub format: String, // "json" or "text"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Token encryption secret, at least 32 characters
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_uri: String,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NluConfig {
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum identifiers requested per discovery call
    pub page_size: u32,
    /// Messages fetched concurrently per round
    pub fetch_batch_size: usize,
    /// First-sync window when no cursor and no previous sync exist
    pub lookback_days: i64,
    /// Refresh the access token when it expires within this many seconds
    pub refresh_buffer_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub batch_size: usize,
    pub max_body_bytes: usize,
    pub max_error_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub min_confidence: f64,
    pub max_question_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub sync_interval_secs: u64,
    pub extract_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: "data/mailfacts.db".to_string(),
                max_connections: 10,
                busy_timeout_ms: 5_000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file_path: None,
                format: "text".to_string(),
            },
            vault: VaultConfig { key: String::new() },
            google: GoogleConfig {
                client_id: String::new(),
                client_secret: String::new(),
                token_uri: "https://oauth2.googleapis.com/token".to_string(),
                api_base_url: "https://gmail.googleapis.com/gmail/v1".to_string(),
                request_timeout_secs: 30,
            },
            nlu: NluConfig {
                api_key: String::new(),
                api_url: "https://api.openai.com/v1/chat/completions".to_string(),
                model: "gpt-4o-mini".to_string(),
                request_timeout_secs: 30,
            },
            sync: SyncConfig {
                page_size: 500,
                fetch_batch_size: 50,
                lookback_days: 30,
                refresh_buffer_secs: 300,
            },
            extraction: ExtractionConfig {
                batch_size: 20,
                max_body_bytes: 4_000,
                max_error_chars: 512,
            },
            query: QueryConfig {
                min_confidence: 0.4,
                max_question_chars: 500,
            },
            schedule: ScheduleConfig {
                sync_interval_secs: 6 * 60 * 60,
                extract_interval_secs: 15 * 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, layering an explicit file over the default locations
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        // Start with default values
        for (key, value) in Self::default().default_entries() {
            builder = builder.set_default(key, value)?;
        }

        // Add config files if they exist
        builder = builder
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Environment variables win, e.g. MAILFACTS_VAULT__KEY
        let config = builder
            .add_source(
                Environment::with_prefix("MAILFACTS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("Failed to deserialize configuration: {}", e))?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(anyhow::anyhow!("database.path must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!("max_connections must be greater than 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format,
                valid_formats
            ));
        }

        if self.vault.key.chars().count() < crate::vault::MIN_KEY_CHARS {
            return Err(anyhow::anyhow!(
                "vault.key must be at least {} characters",
                crate::vault::MIN_KEY_CHARS
            ));
        }

        if self.google.request_timeout_secs == 0 || self.nlu.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("request timeouts must be greater than 0"));
        }

        if self.sync.page_size == 0 {
            return Err(anyhow::anyhow!("sync.page_size must be greater than 0"));
        }
        if self.sync.fetch_batch_size == 0 {
            return Err(anyhow::anyhow!("sync.fetch_batch_size must be greater than 0"));
        }
        if self.sync.lookback_days <= 0 {
            return Err(anyhow::anyhow!("sync.lookback_days must be greater than 0"));
        }
        if self.sync.refresh_buffer_secs < 0 {
            return Err(anyhow::anyhow!("sync.refresh_buffer_secs must not be negative"));
        }

        if !(1..=crate::validation::MAX_BATCH_SIZE).contains(&self.extraction.batch_size) {
            return Err(anyhow::anyhow!(
                "extraction.batch_size must be within [1, {}]",
                crate::validation::MAX_BATCH_SIZE
            ));
        }
        if self.extraction.max_body_bytes == 0 || self.extraction.max_error_chars == 0 {
            return Err(anyhow::anyhow!("extraction caps must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.query.min_confidence) {
            return Err(anyhow::anyhow!("query.min_confidence must be within [0, 1]"));
        }
        if self.query.max_question_chars == 0 {
            return Err(anyhow::anyhow!("query.max_question_chars must be greater than 0"));
        }

        if self.schedule.sync_interval_secs == 0 || self.schedule.extract_interval_secs == 0 {
            return Err(anyhow::anyhow!("schedule intervals must be greater than 0"));
        }

        Ok(())
    }

    /// Get log level from environment or config
    pub fn get_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone())
    }

    /// Flatten the defaults into dotted key/value pairs for the config builder
    fn default_entries(self) -> Vec<(&'static str, Value)> {
        vec![
            ("database.path", Value::from(self.database.path)),
            ("database.max_connections", Value::from(self.database.max_connections)),
            ("database.busy_timeout_ms", Value::from(self.database.busy_timeout_ms)),
            ("logging.level", Value::from(self.logging.level)),
            ("logging.file_path", Value::from(self.logging.file_path)),
            ("logging.format", Value::from(self.logging.format)),
            ("vault.key", Value::from(self.vault.key)),
            ("google.client_id", Value::from(self.google.client_id)),
            ("google.client_secret", Value::from(self.google.client_secret)),
            ("google.token_uri", Value::from(self.google.token_uri)),
            ("google.api_base_url", Value::from(self.google.api_base_url)),
            ("google.request_timeout_secs", Value::from(self.google.request_timeout_secs)),
            ("nlu.api_key", Value::from(self.nlu.api_key)),
            ("nlu.api_url", Value::from(self.nlu.api_url)),
            ("nlu.model", Value::from(self.nlu.model)),
            ("nlu.request_timeout_secs", Value::from(self.nlu.request_timeout_secs)),
            ("sync.page_size", Value::from(self.sync.page_size)),
            ("sync.fetch_batch_size", Value::from(self.sync.fetch_batch_size as u64)),
            ("sync.lookback_days", Value::from(self.sync.lookback_days)),
            ("sync.refresh_buffer_secs", Value::from(self.sync.refresh_buffer_secs)),
            ("extraction.batch_size", Value::from(self.extraction.batch_size as u64)),
            ("extraction.max_body_bytes", Value::from(self.extraction.max_body_bytes as u64)),
            ("extraction.max_error_chars", Value::from(self.extraction.max_error_chars as u64)),
            ("query.min_confidence", Value::from(self.query.min_confidence)),
            ("query.max_question_chars", Value::from(self.query.max_question_chars as u64)),
            ("schedule.sync_interval_secs", Value::from(self.schedule.sync_interval_secs)),
            ("schedule.extract_interval_secs", Value::from(self.schedule.extract_interval_secs)),
        ]
    }
}
