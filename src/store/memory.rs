//! In-memory store with the same semantics as the PostgreSQL store.
//!
//! Claim atomicity comes from holding the single state mutex across the
//! check-and-set; the ledger is a map keyed by (broadcast, recipient), so the
//! upsert invariant holds by construction. Used by the engine test-suite and
//! suitable for single-process embedded deployments.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{Attempt, AttemptStatus, Broadcast, BroadcastStatus, BroadcastTotals, Recipient, Store};

#[derive(Default)]
struct State {
    recipients: Vec<Recipient>,
    broadcasts: Vec<Broadcast>,
    attempts: BTreeMap<(i64, i64), Attempt>,
    next_recipient_id: i64,
    next_broadcast_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test support: age a broadcast's heartbeat so staleness paths can be
    /// exercised without waiting out the timeout.
    pub async fn backdate_broadcast(&self, id: i64, age: Duration) {
        let mut state = self.state.lock().await;
        if let Some(b) = state.broadcasts.iter_mut().find(|b| b.id == id) {
            b.updated_at = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();
        }
    }

    /// Test support: current status of a broadcast.
    pub async fn status_of(&self, id: i64) -> Option<BroadcastStatus> {
        let state = self.state.lock().await;
        state.broadcasts.iter().find(|b| b.id == id).map(|b| b.status)
    }
}

impl State {
    fn broadcast_mut(&mut self, id: i64) -> Result<&mut Broadcast> {
        match self.broadcasts.iter_mut().find(|b| b.id == id) {
            Some(b) => Ok(b),
            None => bail!("broadcast {id} not found"),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_recipient(
        &self,
        chat_id: i64,
        user_id: Option<i64>,
        username: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.recipients.iter().any(|r| r.chat_id == chat_id) {
            return Ok(());
        }
        state.next_recipient_id += 1;
        let id = state.next_recipient_id;
        state.recipients.push(Recipient {
            id,
            chat_id,
            user_id,
            username: username.map(str::to_string),
        });
        Ok(())
    }

    async fn create_pending_broadcast(
        &self,
        admin_id: i64,
        max_recipients: Option<i64>,
    ) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.next_broadcast_id += 1;
        let id = state.next_broadcast_id;
        let now = Utc::now();
        state.broadcasts.push(Broadcast {
            id,
            admin_id,
            text: None,
            status: BroadcastStatus::PendingText,
            max_recipients,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn latest_pending_for(&self, admin_id: i64) -> Result<Option<Broadcast>> {
        let state = self.state.lock().await;
        Ok(state
            .broadcasts
            .iter()
            .filter(|b| b.admin_id == admin_id && b.status == BroadcastStatus::PendingText)
            .max_by_key(|b| b.id)
            .cloned())
    }

    async fn publish_broadcast(&self, id: i64, text: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let broadcast = state.broadcast_mut(id)?;
        if broadcast.status == BroadcastStatus::PendingText {
            broadcast.text = Some(text.to_string());
            broadcast.status = BroadcastStatus::Sending;
            broadcast.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reclaim_stalled(&self, stale_after: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_after)?;
        let mut state = self.state.lock().await;
        let mut reclaimed = 0;
        for b in &mut state.broadcasts {
            if b.status == BroadcastStatus::Processing && b.updated_at < cutoff {
                b.status = BroadcastStatus::Sending;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn list_sending(&self) -> Result<Vec<Broadcast>> {
        let state = self.state.lock().await;
        Ok(state
            .broadcasts
            .iter()
            .filter(|b| b.status == BroadcastStatus::Sending)
            .cloned()
            .collect())
    }

    async fn claim(&self, id: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let broadcast = state.broadcast_mut(id)?;
        if broadcast.status != BroadcastStatus::Sending {
            return Ok(false);
        }
        broadcast.status = BroadcastStatus::Processing;
        broadcast.updated_at = Utc::now();
        Ok(true)
    }

    async fn release(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let broadcast = state.broadcast_mut(id)?;
        if broadcast.status == BroadcastStatus::Processing {
            broadcast.status = BroadcastStatus::Sending;
            broadcast.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_completed(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let broadcast = state.broadcast_mut(id)?;
        broadcast.status = BroadcastStatus::Completed;
        broadcast.updated_at = Utc::now();
        Ok(())
    }

    async fn touch(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let broadcast = state.broadcast_mut(id)?;
        broadcast.updated_at = Utc::now();
        Ok(())
    }

    async fn next_batch(&self, broadcast_id: i64, limit: i64) -> Result<Vec<Recipient>> {
        let state = self.state.lock().await;
        let mut batch: Vec<Recipient> = state
            .recipients
            .iter()
            .filter(|r| !state.attempts.contains_key(&(broadcast_id, r.id)))
            .cloned()
            .collect();
        batch.sort_by_key(|r| r.id);
        batch.truncate(limit.max(0) as usize);
        Ok(batch)
    }

    async fn record_attempt(
        &self,
        broadcast_id: i64,
        recipient_id: i64,
        attempts: i32,
        status: AttemptStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state
            .attempts
            .entry((broadcast_id, recipient_id))
            .and_modify(|a| {
                a.attempts = attempts;
                a.status = status;
                a.last_error = last_error.map(str::to_string);
                a.updated_at = now;
            })
            .or_insert(Attempt {
                broadcast_id,
                recipient_id,
                attempts,
                status,
                last_error: last_error.map(str::to_string),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn get_attempt(&self, broadcast_id: i64, recipient_id: i64) -> Result<Option<Attempt>> {
        let state = self.state.lock().await;
        Ok(state.attempts.get(&(broadcast_id, recipient_id)).cloned())
    }

    async fn attempt_count(&self, broadcast_id: i64) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .attempts
            .keys()
            .filter(|(bid, _)| *bid == broadcast_id)
            .count() as i64)
    }

    async fn totals(&self, broadcast_id: i64) -> Result<BroadcastTotals> {
        let state = self.state.lock().await;
        let mut totals = BroadcastTotals::default();
        for a in state.attempts.values() {
            if a.broadcast_id != broadcast_id {
                continue;
            }
            match a.status {
                AttemptStatus::Sent => totals.sent += 1,
                AttemptStatus::Failed => totals.failed += 1,
            }
        }
        Ok(totals)
    }

    async fn get_broadcast(&self, id: i64) -> Result<Option<Broadcast>> {
        let state = self.state.lock().await;
        Ok(state.broadcasts.iter().find(|b| b.id == id).cloned())
    }
}
