//! PostgreSQL store.
//!
//! All statements are single atomic updates or unique-key upserts; the claim
//! and publish transitions are guarded by the current status in the `WHERE`
//! clause, which is what makes overlapping cron invocations safe without
//! explicit locks or multi-row transactions.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use super::{Attempt, AttemptStatus, Broadcast, BroadcastStatus, BroadcastTotals, Recipient, Store};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS recipients (
    id          BIGSERIAL PRIMARY KEY,
    chat_id     BIGINT NOT NULL UNIQUE,
    user_id     BIGINT,
    username    TEXT,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS broadcasts (
    id              BIGSERIAL PRIMARY KEY,
    admin_id        BIGINT NOT NULL,
    text            TEXT,
    status          TEXT NOT NULL DEFAULT 'pending_text',
    max_recipients  BIGINT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_broadcasts_status ON broadcasts (status);

CREATE TABLE IF NOT EXISTS attempts (
    broadcast_id  BIGINT NOT NULL REFERENCES broadcasts (id),
    recipient_id  BIGINT NOT NULL REFERENCES recipients (id),
    attempts      INT NOT NULL,
    status        TEXT NOT NULL,
    last_error    TEXT,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (broadcast_id, recipient_id)
);
";

/// Raw broadcast row; status is converted to the typed enum on the way out.
#[derive(sqlx::FromRow)]
struct BroadcastRow {
    id: i64,
    admin_id: i64,
    text: Option<String>,
    status: String,
    max_recipients: Option<i64>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl BroadcastRow {
    fn into_broadcast(self) -> Result<Broadcast> {
        Ok(Broadcast {
            id: self.id,
            admin_id: self.admin_id,
            text: self.text,
            status: BroadcastStatus::parse(&self.status)?,
            max_recipients: self.max_recipients,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    broadcast_id: i64,
    recipient_id: i64,
    attempts: i32,
    status: String,
    last_error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl AttemptRow {
    fn into_attempt(self) -> Result<Attempt> {
        Ok(Attempt {
            broadcast_id: self.broadcast_id,
            recipient_id: self.recipient_id,
            attempts: self.attempts,
            status: AttemptStatus::parse(&self.status)?,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const BROADCAST_COLUMNS: &str =
    "id, admin_id, text, status, max_recipients, created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// The URL is parsed manually to preserve percent-encoded credentials
    /// that managed-Postgres poolers require in the username.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(opts)
            .await?;
        Ok(PgStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema if it does not exist. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn register_recipient(
        &self,
        chat_id: i64,
        user_id: Option<i64>,
        username: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO recipients (chat_id, user_id, username)
             VALUES ($1, $2, $3)
             ON CONFLICT (chat_id) DO NOTHING",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_pending_broadcast(
        &self,
        admin_id: i64,
        max_recipients: Option<i64>,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO broadcasts (admin_id, max_recipients) VALUES ($1, $2) RETURNING id",
        )
        .bind(admin_id)
        .bind(max_recipients)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn latest_pending_for(&self, admin_id: i64) -> Result<Option<Broadcast>> {
        let row = sqlx::query_as::<_, BroadcastRow>(&format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcasts
             WHERE admin_id = $1 AND status = 'pending_text'
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(admin_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BroadcastRow::into_broadcast).transpose()
    }

    async fn publish_broadcast(&self, id: i64, text: &str) -> Result<()> {
        sqlx::query(
            "UPDATE broadcasts
             SET text = $1, status = 'sending', updated_at = NOW()
             WHERE id = $2 AND status = 'pending_text'",
        )
        .bind(text)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reclaim_stalled(&self, stale_after: Duration) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE broadcasts
             SET status = 'sending'
             WHERE status = 'processing'
               AND updated_at < NOW() - ($1 || ' seconds')::interval",
        )
        .bind(stale_after.as_secs().to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_sending(&self) -> Result<Vec<Broadcast>> {
        let rows = sqlx::query_as::<_, BroadcastRow>(&format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcasts
             WHERE status = 'sending' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BroadcastRow::into_broadcast).collect()
    }

    async fn claim(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE broadcasts
             SET status = 'processing', updated_at = NOW()
             WHERE id = $1 AND status = 'sending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE broadcasts
             SET status = 'sending', updated_at = NOW()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE broadcasts SET status = 'completed', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE broadcasts SET updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn next_batch(&self, broadcast_id: i64, limit: i64) -> Result<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, Recipient>(
            "SELECT r.id, r.chat_id, r.user_id, r.username
             FROM recipients r
             LEFT JOIN attempts a
               ON a.recipient_id = r.id AND a.broadcast_id = $1
             WHERE a.recipient_id IS NULL
             ORDER BY r.id
             LIMIT $2",
        )
        .bind(broadcast_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_attempt(
        &self,
        broadcast_id: i64,
        recipient_id: i64,
        attempts: i32,
        status: AttemptStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO attempts (broadcast_id, recipient_id, attempts, status, last_error)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (broadcast_id, recipient_id) DO UPDATE SET
                attempts   = EXCLUDED.attempts,
                status     = EXCLUDED.status,
                last_error = EXCLUDED.last_error,
                updated_at = NOW()",
        )
        .bind(broadcast_id)
        .bind(recipient_id)
        .bind(attempts)
        .bind(status.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_attempt(&self, broadcast_id: i64, recipient_id: i64) -> Result<Option<Attempt>> {
        let row = sqlx::query_as::<_, AttemptRow>(
            "SELECT broadcast_id, recipient_id, attempts, status, last_error,
                    created_at, updated_at
             FROM attempts WHERE broadcast_id = $1 AND recipient_id = $2",
        )
        .bind(broadcast_id)
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AttemptRow::into_attempt).transpose()
    }

    async fn attempt_count(&self, broadcast_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM attempts WHERE broadcast_id = $1")
                .bind(broadcast_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn totals(&self, broadcast_id: i64) -> Result<BroadcastTotals> {
        let totals = sqlx::query_as::<_, BroadcastTotals>(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
             FROM attempts WHERE broadcast_id = $1",
        )
        .bind(broadcast_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(totals)
    }

    async fn get_broadcast(&self, id: i64) -> Result<Option<Broadcast>> {
        let row = sqlx::query_as::<_, BroadcastRow>(&format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BroadcastRow::into_broadcast).transpose()
    }
}
