use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mailfacts::config::AppConfig;
use mailfacts::gmail::expiry_after;
use mailfacts::logging::init_logging;
use mailfacts::{ErrorResponse, Pipeline, PipelineError};
use serde_json::{json, Value};
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file layered over config/default and config/local
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store OAuth tokens for a user
    Register {
        /// User identifier
        #[arg(short, long)]
        user: String,

        /// Current access token, if any
        #[arg(long, default_value = "")]
        access_token: String,

        /// Long-lived refresh token
        #[arg(long)]
        refresh_token: String,

        /// Seconds until the access token expires
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Sync a user's mailbox, or every registered mailbox
    Sync {
        /// User identifier
        #[arg(short, long, required_unless_present = "all")]
        user: Option<String>,

        /// Sync all registered users
        #[arg(long, conflicts_with = "user")]
        all: bool,
    },
    /// Extract facts from unprocessed messages
    Extract {
        /// Messages per batch (configured default when omitted)
        #[arg(short, long)]
        batch_size: Option<usize>,
    },
    /// Ask a question about a user's mail
    Ask {
        /// User identifier
        #[arg(short, long)]
        user: String,

        /// The question, e.g. "Total spent this month"
        question: String,
    },
    /// Make failed extractions eligible again
    Requeue {
        /// Only requeue this user's messages
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Run sync and extraction on their configured intervals until Ctrl-C
    Schedule,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration
    let config = AppConfig::load_from(cli.config.as_deref())?;

    // Initialize logging
    let _guard = init_logging(
        Some(config.get_log_level().as_str()),
        &config.logging.format,
        config.logging.file_path.as_deref().map(Path::new),
    )?;

    info!("Starting mailfacts");

    let pipeline = Pipeline::from_config(config).context("Failed to initialize pipeline")?;

    match run(&pipeline, cli.command).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            println!("{}", serde_json::to_string_pretty(&ErrorResponse::from(&e))?);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(pipeline: &Pipeline, command: Commands) -> Result<Value, PipelineError> {
    match command {
        Commands::Register {
            user,
            access_token,
            refresh_token,
            expires_in,
        } => {
            let expires_at = expires_in
                .map(|secs| {
                    expiry_after(Utc::now(), secs).ok_or_else(|| {
                        PipelineError::InvalidInput(format!("expires-in out of range: {secs}"))
                    })
                })
                .transpose()?;
            pipeline.register_user(&user, &access_token, &refresh_token, expires_at)?;
            Ok(json!({"registered": user}))
        }
        Commands::Sync { user: Some(user), .. } => Ok(json!(pipeline.trigger_sync(&user).await?)),
        Commands::Sync { user: None, .. } => {
            let outcomes = pipeline.sync_all().await?;
            Ok(Value::Array(
                outcomes
                    .into_iter()
                    .map(|(user_id, outcome)| match outcome {
                        Ok(stats) => json!({"user_id": user_id, "stats": stats}),
                        Err(e) => json!({"user_id": user_id, "error": ErrorResponse::from(&e)}),
                    })
                    .collect(),
            ))
        }
        Commands::Extract { batch_size } => Ok(json!(pipeline.extract_batch(batch_size).await?)),
        Commands::Ask { user, question } => Ok(json!(pipeline.answer_query(&user, &question).await?)),
        Commands::Requeue { user } => {
            let requeued = pipeline.requeue_failed(user.as_deref())?;
            Ok(json!({"requeued": requeued}))
        }
        Commands::Schedule => {
            pipeline.run_schedule().await?;
            Ok(json!({"stopped": true}))
        }
    }
}
