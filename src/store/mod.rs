//! # Store — Durable broadcast state
//!
//! All persistent state lives in three tables:
//!
//! - `broadcasts`: one row per bulk-send job (owner, text, status, optional
//!   recipient cap, timestamps).
//! - `attempts`: the delivery ledger — one row per (broadcast, recipient),
//!   written exactly once. Doubles as the progress cursor and the audit
//!   trail; row existence permanently marks a recipient as processed.
//! - `recipients`: subscribers registered on first `/start`, read-only for
//!   the engine.
//!
//! Every mutation is a single conditional update or unique-key upsert, so a
//! crashed invocation can never leave partially-applied state. The one
//! concurrency primitive is [`Store::claim`]: a status-guarded update that at
//! most one racing invocation can win.
//!
//! ## Implementations
//!
//! - [`postgres::PgStore`] — sqlx/PostgreSQL, the production store.
//! - [`memory::MemoryStore`] — in-memory with identical semantics, for the
//!   engine test-suite and embedded use.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

// ── Row types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    PendingText,
    Sending,
    Processing,
    Completed,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::PendingText => "pending_text",
            BroadcastStatus::Sending => "sending",
            BroadcastStatus::Processing => "processing",
            BroadcastStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending_text" => Ok(BroadcastStatus::PendingText),
            "sending" => Ok(BroadcastStatus::Sending),
            "processing" => Ok(BroadcastStatus::Processing),
            "completed" => Ok(BroadcastStatus::Completed),
            other => bail!("unknown broadcast status {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Sent,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Sent => "sent",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(AttemptStatus::Sent),
            "failed" => Ok(AttemptStatus::Failed),
            other => bail!("unknown attempt status {other:?}"),
        }
    }
}

/// One bulk-send job.
#[derive(Debug, Clone, Serialize)]
pub struct Broadcast {
    pub id: i64,
    pub admin_id: i64,
    /// `None` until the admin supplies the message text.
    pub text: Option<String>,
    pub status: BroadcastStatus,
    /// Per-broadcast recipient cap; `None` means every subscriber.
    pub max_recipients: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A subscriber eligible to receive broadcasts.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Recipient {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: Option<i64>,
    pub username: Option<String>,
}

/// Delivery ledger row: the final outcome for one recipient of one broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub broadcast_id: i64,
    pub recipient_id: i64,
    pub attempts: i32,
    pub status: AttemptStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger aggregate for final summaries; cumulative across invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct BroadcastTotals {
    pub sent: i64,
    pub failed: i64,
}

// ── The storage seam ────────────────────────────────────────────

/// Durable storage consumed by the engine, the command router and the
/// reporter. Implementations must make [`Store::claim`] atomic and
/// [`Store::record_attempt`] an upsert on the (broadcast, recipient) key;
/// everything else follows from those two guarantees.
#[async_trait]
pub trait Store: Send + Sync {
    /// Register a subscriber; inserting an already-known chat id is a no-op.
    async fn register_recipient(
        &self,
        chat_id: i64,
        user_id: Option<i64>,
        username: Option<&str>,
    ) -> Result<()>;

    /// Create a `pending_text` broadcast owned by `admin_id`.
    async fn create_pending_broadcast(
        &self,
        admin_id: i64,
        max_recipients: Option<i64>,
    ) -> Result<i64>;

    /// Most recent `pending_text` broadcast for this admin, if any.
    async fn latest_pending_for(&self, admin_id: i64) -> Result<Option<Broadcast>>;

    /// Attach the message text and move `pending_text` → `sending`.
    async fn publish_broadcast(&self, id: i64, text: &str) -> Result<()>;

    /// Reset every `processing` broadcast whose heartbeat is older than
    /// `stale_after` back to `sending`. Returns the number reclaimed.
    async fn reclaim_stalled(&self, stale_after: Duration) -> Result<u64>;

    /// Broadcasts currently eligible for dispatch, oldest first.
    async fn list_sending(&self) -> Result<Vec<Broadcast>>;

    /// Atomic claim: `sending` → `processing`, guarded by current status.
    /// Returns `false` when another invocation won the race.
    async fn claim(&self, id: i64) -> Result<bool>;

    /// Release a claim: `processing` → `sending` (pause or fault recovery).
    async fn release(&self, id: i64) -> Result<()>;

    /// Terminal transition once every eligible recipient has a ledger row.
    async fn mark_completed(&self, id: i64) -> Result<()>;

    /// Bump `updated_at` — the heartbeat watched by the stall detector.
    async fn touch(&self, id: i64) -> Result<()>;

    /// Up to `limit` recipients with no ledger row for this broadcast,
    /// ordered by ascending recipient id. Empty means exhausted.
    async fn next_batch(&self, broadcast_id: i64, limit: i64) -> Result<Vec<Recipient>>;

    /// Upsert the final outcome for one recipient of one broadcast.
    async fn record_attempt(
        &self,
        broadcast_id: i64,
        recipient_id: i64,
        attempts: i32,
        status: AttemptStatus,
        last_error: Option<&str>,
    ) -> Result<()>;

    async fn get_attempt(&self, broadcast_id: i64, recipient_id: i64) -> Result<Option<Attempt>>;

    /// Ledger rows recorded for this broadcast (sent and failed alike).
    async fn attempt_count(&self, broadcast_id: i64) -> Result<i64>;

    /// Sent/failed aggregate over the whole ledger for this broadcast.
    async fn totals(&self, broadcast_id: i64) -> Result<BroadcastTotals>;

    /// Broadcast by id, regardless of status.
    async fn get_broadcast(&self, id: i64) -> Result<Option<Broadcast>>;
}
