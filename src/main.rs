//! # Main — CLI entry point
//!
//! Subcommands:
//!
//! - `run [--max N]` — one dispatch invocation; intended for cron. `--max`
//!   overrides `MAX_MESSAGES_PER_RUN` (0 or negative = unlimited).
//! - `webhook --port P` — serve the inbound Telegram update endpoint.
//! - `set-webhook --url U` — register the webhook URL with the Bot API.
//! - `migrate` — create or update the database schema.
//!
//! Configuration comes from the environment (see `config`); `DATABASE_URL`
//! can also be passed as a flag.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crier::config::Config;
use crier::dispatcher::Dispatcher;
use crier::store::postgres::PgStore;
use crier::telegram::TelegramClient;
use crier::webhook::{self, AppState};

#[derive(Parser)]
#[command(name = "crier", about = "Telegram broadcast bot with rate-limited, resumable dispatch")]
struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch eligible broadcasts (intended to be invoked from cron)
    Run {
        /// Max messages this run; overrides MAX_MESSAGES_PER_RUN (0 or negative = unlimited)
        #[arg(long)]
        max: Option<i64>,
    },
    /// Serve the Telegram webhook endpoint
    Webhook {
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Register the webhook URL with the Bot API
    SetWebhook {
        /// Public HTTPS URL Telegram should deliver updates to
        #[arg(long)]
        url: String,
    },
    /// Create or update the database schema
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Structured logging: LOG_FORMAT=json for container platforms,
    // human-readable on stderr otherwise.
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let database_url = cli.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)")
    })?;

    match cli.command {
        Commands::Run { max } => {
            let config = Config::from_env()?;
            let store = Arc::new(PgStore::connect(database_url).await?);
            let client = Arc::new(TelegramClient::new(&config.bot_token));
            let dispatcher = Dispatcher::new(store, client, config.engine.clone());
            let summary = dispatcher.run(max).await?;
            info!(
                claimed = summary.claimed,
                completed = summary.completed,
                sent = summary.sent,
                failed = summary.failed,
                limit_hit = summary.limit_hit,
                "run finished"
            );
        }
        Commands::Webhook { port } => {
            let config = Config::from_env()?;
            let store = PgStore::connect(database_url).await?;
            store.migrate().await?;
            let client = TelegramClient::new(&config.bot_token);
            let state = Arc::new(AppState {
                store: Arc::new(store),
                client: Arc::new(client),
                config,
            });
            webhook::run(state, port).await?;
        }
        Commands::SetWebhook { url } => {
            let config = Config::from_env()?;
            TelegramClient::new(&config.bot_token)
                .set_webhook(&url, &config.webhook_secret)
                .await?;
            info!(url, "webhook registered");
        }
        Commands::Migrate => {
            let store = PgStore::connect(database_url).await?;
            store.migrate().await?;
            info!("schema ready");
        }
    }
    Ok(())
}
