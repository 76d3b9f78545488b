//! # Config — Explicit runtime configuration
//!
//! Everything the bot needs is read from the environment exactly once and
//! passed into the engine as a plain value. There is no process-wide mutable
//! state: the dispatcher, the command router and the webhook server all
//! receive the same `Config` object at construction.
//!
//! ## Environment variables
//!
//! - `BOT_TOKEN` — Telegram Bot API token (required).
//! - `WEBHOOK_SECRET` — secret token checked on inbound updates.
//! - `ADMIN_IDS` — comma-separated chat ids allowed to compose broadcasts.
//! - `WELCOME_MESSAGE` — reply to `/start`.
//! - `RATE_PLAN` — `default` (30 msgs/batch) or `paid` (1000 msgs/batch).
//! - `BATCH_SIZE`, `BATCH_DELAY_MS`, `MSG_DELAY_MS` — per-field plan overrides.
//! - `MAX_MESSAGES_PER_RUN` — default per-invocation delivery budget
//!   (unset, zero or negative means unlimited).
//! - `STALE_AFTER_MIN` — minutes before a claimed broadcast is considered
//!   abandoned (default 10).

use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Delivery pacing for one rate plan.
#[derive(Debug, Clone)]
pub struct RatePlan {
    /// Recipients fetched and delivered between inter-batch delays.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Fixed pacing delay after every send attempt, success or not.
    pub msg_delay: Duration,
}

impl RatePlan {
    /// Conservative plan for free-tier bots (~30 messages/sec API ceiling).
    pub fn free() -> Self {
        RatePlan {
            batch_size: 30,
            batch_delay: Duration::from_millis(1000),
            msg_delay: Duration::from_millis(40),
        }
    }

    /// Plan for bots with paid broadcast limits.
    pub fn paid() -> Self {
        RatePlan {
            batch_size: 1000,
            batch_delay: Duration::from_millis(1000),
            msg_delay: Duration::from_millis(40),
        }
    }

    pub fn named(name: &str) -> Result<Self> {
        match name {
            "default" | "free" => Ok(Self::free()),
            "paid" => Ok(Self::paid()),
            other => bail!("unknown rate plan {other:?} (expected \"default\" or \"paid\")"),
        }
    }
}

/// Knobs consumed by the dispatch engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub rate: RatePlan,
    /// Base for linear retry backoff: wait `retry_backoff * attempt_number`
    /// after a generic delivery failure.
    pub retry_backoff: Duration,
    /// Delivery attempts per recipient within a single batch visit.
    pub max_attempts: u32,
    /// A broadcast stuck in `processing` longer than this is assumed
    /// abandoned and reclaimed on the next run.
    pub stale_after: Duration,
    /// Default per-invocation delivery budget; `None` means unlimited.
    pub default_max_per_run: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            rate: RatePlan::free(),
            retry_backoff: Duration::from_millis(500),
            max_attempts: 3,
            stale_after: Duration::from_secs(10 * 60),
            default_max_per_run: None,
        }
    }
}

/// Full process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub webhook_secret: String,
    pub admin_ids: Vec<i64>,
    pub welcome_message: String,
    pub engine: EngineConfig,
}

impl Config {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let bot_token = env_var("BOT_TOKEN").context("BOT_TOKEN must be set")?;
        let webhook_secret = env_var("WEBHOOK_SECRET").unwrap_or_default();
        let admin_ids = match env_var("ADMIN_IDS") {
            Some(raw) => parse_admin_ids(&raw)?,
            None => Vec::new(),
        };
        let welcome_message = env_var("WELCOME_MESSAGE")
            .unwrap_or_else(|| "Welcome! You are subscribed to updates.".to_string());

        let mut rate = match env_var("RATE_PLAN") {
            Some(name) => RatePlan::named(&name)?,
            None => RatePlan::free(),
        };
        if let Some(n) = parse_env("BATCH_SIZE")? {
            rate.batch_size = n;
        }
        if let Some(ms) = parse_env("BATCH_DELAY_MS")? {
            rate.batch_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env("MSG_DELAY_MS")? {
            rate.msg_delay = Duration::from_millis(ms);
        }

        let mut engine = EngineConfig {
            rate,
            ..EngineConfig::default()
        };
        if let Some(min) = parse_env::<u64>("STALE_AFTER_MIN")? {
            engine.stale_after = Duration::from_secs(min * 60);
        }
        if let Some(raw) = parse_env::<i64>("MAX_MESSAGES_PER_RUN")? {
            engine.default_max_per_run = run_cap(raw);
        }

        Ok(Config {
            bot_token,
            webhook_secret,
            admin_ids,
            welcome_message,
            engine,
        })
    }

    pub fn is_admin(&self, chat_id: i64) -> bool {
        self.admin_ids.contains(&chat_id)
    }
}

/// Read a trimmed environment variable; empty values count as unset.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(e) => bail!("invalid {name}={raw:?}: {e}"),
        },
        None => Ok(None),
    }
}

/// Parse the comma-separated admin chat id list.
pub fn parse_admin_ids(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .with_context(|| format!("invalid admin chat id {s:?} in ADMIN_IDS"))
        })
        .collect()
}

/// Normalize a configured run cap: zero or negative means unlimited.
pub fn run_cap(raw: i64) -> Option<u64> {
    if raw > 0 {
        Some(raw as u64)
    } else {
        None
    }
}
