//! # Dispatcher — Broadcast dispatch engine
//!
//! One invocation = one bounded batch run:
//!
//! 1. Reclaim broadcasts stuck in `processing` past the staleness timeout
//!    (crash recovery for a previous invocation).
//! 2. List broadcasts in `sending` and claim them one at a time. The claim
//!    is a conditional status update; losing the race to an overlapping
//!    invocation is expected and skipped silently.
//! 3. Run the batched delivery loop for each claimed broadcast under two
//!    budgets: the per-invocation delivery budget and the broadcast's
//!    optional recipient cap.
//! 4. On budget exhaustion the broadcast is released back to `sending` and
//!    resumes on a later run; on natural exhaustion it is completed and the
//!    final totals are aggregated from the attempt ledger, so multi-run
//!    broadcasts report cumulative numbers.
//!
//! Broadcasts and recipients are processed strictly sequentially; every wait
//! (retry backoff, rate-limit hint, message pacing, inter-batch delay) is a
//! plain sleep because there is no other work for the invocation to do.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::report::Reporter;
use crate::store::{AttemptStatus, Broadcast, Recipient, Store};
use crate::telegram::{DeliveryClient, SendOutcome};

// ── Budget ──────────────────────────────────────────────────────

/// Per-invocation cap on successful deliveries, independent of any
/// per-broadcast recipient cap. Threaded explicitly through the run so there
/// is no hidden aliasing between nested calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunBudget {
    remaining: Option<u64>,
}

impl RunBudget {
    pub fn unlimited() -> Self {
        RunBudget { remaining: None }
    }

    pub fn limited(n: u64) -> Self {
        RunBudget { remaining: Some(n) }
    }

    /// Resolve the CLI override against the configured default: absent means
    /// the default, zero or negative means unlimited.
    pub fn from_override(cli: Option<i64>, default: Option<u64>) -> Self {
        match cli {
            Some(n) if n > 0 => Self::limited(n as u64),
            Some(_) => Self::unlimited(),
            None => match default {
                Some(n) => Self::limited(n),
                None => Self::unlimited(),
            },
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Burn one successful delivery.
    pub fn consume(&mut self) {
        if let Some(r) = &mut self.remaining {
            *r = r.saturating_sub(1);
        }
    }

    /// Cap a batch size by what the budget still allows.
    pub fn cap(&self, batch: usize) -> usize {
        match self.remaining {
            Some(r) => batch.min(usize::try_from(r).unwrap_or(usize::MAX)),
            None => batch,
        }
    }
}

// ── Outcomes ────────────────────────────────────────────────────

/// Final per-recipient outcome of the in-batch retry loop.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// What one invocation accomplished.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    /// Broadcasts this invocation claimed and worked on.
    pub claimed: u32,
    /// Broadcasts that reached `completed` this run.
    pub completed: u32,
    pub sent: u64,
    pub failed: u64,
    /// The delivery budget ran out before the eligible queue was drained.
    pub limit_hit: bool,
}

#[derive(Debug, Default)]
struct BroadcastRunStats {
    sent: u64,
    failed: u64,
    batches: u32,
}

// ── Engine ──────────────────────────────────────────────────────

pub struct Dispatcher<S: Store + ?Sized, C: DeliveryClient + ?Sized> {
    store: Arc<S>,
    client: Arc<C>,
    reporter: Reporter<C>,
    config: EngineConfig,
}

impl<S, C> Dispatcher<S, C>
where
    S: Store + ?Sized,
    C: DeliveryClient + ?Sized,
{
    pub fn new(store: Arc<S>, client: Arc<C>, config: EngineConfig) -> Self {
        Dispatcher {
            reporter: Reporter::new(Arc::clone(&client)),
            store,
            client,
            config,
        }
    }

    /// Entry point for one invocation. `max_override` is the CLI "max
    /// messages this run" value; see [`RunBudget::from_override`].
    pub async fn run(&self, max_override: Option<i64>) -> Result<RunSummary> {
        let mut budget = RunBudget::from_override(max_override, self.config.default_max_per_run);
        let mut summary = RunSummary::default();

        let reclaimed = self.store.reclaim_stalled(self.config.stale_after).await?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed stalled broadcasts");
        }

        for broadcast in self.store.list_sending().await? {
            if budget.is_exhausted() {
                summary.limit_hit = true;
                break;
            }
            if !self.store.claim(broadcast.id).await? {
                // Lost the race to an overlapping invocation.
                continue;
            }
            summary.claimed += 1;
            match self.process_broadcast(&broadcast, &mut budget).await {
                Ok(ProcessOutcome::Completed(stats)) => {
                    summary.completed += 1;
                    summary.sent += stats.sent;
                    summary.failed += stats.failed;
                }
                Ok(ProcessOutcome::Paused(stats)) => {
                    summary.sent += stats.sent;
                    summary.failed += stats.failed;
                    summary.limit_hit = true;
                }
                Err(err) => {
                    warn!(
                        broadcast = broadcast.id,
                        error = %err,
                        "broadcast processing failed, releasing claim"
                    );
                    self.store.release(broadcast.id).await?;
                    self.reporter
                        .fault(broadcast.admin_id, broadcast.id, &err)
                        .await;
                }
            }
        }
        Ok(summary)
    }

    /// Batched delivery loop for one claimed broadcast.
    async fn process_broadcast(
        &self,
        broadcast: &Broadcast,
        budget: &mut RunBudget,
    ) -> Result<ProcessOutcome> {
        let text = broadcast
            .text
            .as_deref()
            .ok_or_else(|| anyhow!("broadcast {} has no text", broadcast.id))?;
        let started = Instant::now();
        let mut stats = BroadcastRunStats::default();

        let paused = loop {
            // The recipient cap burns down per recorded attempt, derived
            // from the ledger so it survives pauses and crashes.
            let per_remaining = match broadcast.max_recipients {
                Some(cap) => {
                    let recorded = self.store.attempt_count(broadcast.id).await?;
                    let left = cap - recorded;
                    if left <= 0 {
                        break false;
                    }
                    Some(left as usize)
                }
                None => None,
            };

            let mut effective = budget.cap(self.config.rate.batch_size);
            if let Some(left) = per_remaining {
                effective = effective.min(left);
            }
            if effective == 0 {
                break true;
            }

            let chunk = self.store.next_batch(broadcast.id, effective as i64).await?;
            if chunk.is_empty() {
                break false;
            }

            stats.batches += 1;
            let mut sent = 0u64;
            let mut failed = 0u64;
            let mut limit_hit = false;
            for recipient in &chunk {
                let outcome = self.deliver_with_retry(recipient, text).await;
                let status = if outcome.success {
                    AttemptStatus::Sent
                } else {
                    AttemptStatus::Failed
                };
                self.store
                    .record_attempt(
                        broadcast.id,
                        recipient.id,
                        outcome.attempts as i32,
                        status,
                        outcome.last_error.as_deref(),
                    )
                    .await?;
                if outcome.success {
                    sent += 1;
                    budget.consume();
                } else {
                    failed += 1;
                }
                if budget.is_exhausted() {
                    // Stop only after the current recipient's outcome is
                    // durably recorded.
                    limit_hit = true;
                    break;
                }
            }
            stats.sent += sent;
            stats.failed += failed;

            self.store.touch(broadcast.id).await?;
            self.reporter
                .batch(
                    broadcast.admin_id,
                    stats.batches,
                    sent,
                    chunk.len(),
                    failed,
                    stats.sent,
                    stats.failed,
                    started.elapsed(),
                )
                .await;

            if limit_hit {
                break true;
            }
            sleep(self.config.rate.batch_delay).await;
        };

        if paused {
            self.store.release(broadcast.id).await?;
            self.reporter
                .paused(broadcast.admin_id, broadcast.id, stats.sent)
                .await;
            return Ok(ProcessOutcome::Paused(stats));
        }

        self.store.mark_completed(broadcast.id).await?;
        let totals = self.store.totals(broadcast.id).await?;
        info!(
            broadcast = broadcast.id,
            sent = totals.sent,
            failed = totals.failed,
            "broadcast completed"
        );
        self.reporter
            .completed(broadcast.admin_id, broadcast.id, totals)
            .await;
        Ok(ProcessOutcome::Completed(stats))
    }

    /// Up to `max_attempts` sends for one recipient. A generic failure waits
    /// `retry_backoff * attempt_number`; a rate-limit hint waits exactly the
    /// hinted duration instead. The fixed pacing delay applies after every
    /// attempt regardless of outcome.
    async fn deliver_with_retry(&self, recipient: &Recipient, text: &str) -> DeliveryOutcome {
        let mut attempts = 0u32;
        let mut last_error = None;
        let mut success = false;
        while attempts < self.config.max_attempts && !success {
            attempts += 1;
            match self.client.send(recipient.chat_id, text).await {
                SendOutcome::Delivered => success = true,
                SendOutcome::RateLimited { retry_after } => {
                    last_error = Some(format!(
                        "rate limited, retry after {}s",
                        retry_after.as_secs()
                    ));
                    sleep(retry_after).await;
                }
                SendOutcome::Rejected { code, description } => {
                    last_error = Some(if code != 0 {
                        format!("{code}: {description}")
                    } else {
                        description
                    });
                    sleep(self.config.retry_backoff * attempts).await;
                }
            }
            sleep(self.config.rate.msg_delay).await;
        }
        DeliveryOutcome {
            success,
            attempts,
            last_error,
        }
    }
}

enum ProcessOutcome {
    Completed(BroadcastRunStats),
    Paused(BroadcastRunStats),
}
