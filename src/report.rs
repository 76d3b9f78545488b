//! # Report — Owner-facing progress messages
//!
//! Delivery progress is the admin's only feedback channel: one message per
//! batch, plus a paused / completed / fault notice. Free-form text, sent
//! through the same delivery client as the broadcast itself. A report that
//! fails to send is logged and dropped; it must never abort the run.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::store::BroadcastTotals;
use crate::telegram::DeliveryClient;

pub struct Reporter<C: DeliveryClient + ?Sized> {
    client: Arc<C>,
}

impl<C: DeliveryClient + ?Sized> Reporter<C> {
    pub fn new(client: Arc<C>) -> Self {
        Reporter { client }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn batch(
        &self,
        admin_id: i64,
        batch_num: u32,
        sent: u64,
        chunk_size: usize,
        failed: u64,
        total_sent: u64,
        total_failed: u64,
        elapsed: Duration,
    ) {
        let text = format_batch(
            batch_num,
            sent,
            chunk_size,
            failed,
            total_sent,
            total_failed,
            elapsed,
        );
        self.notify(admin_id, &text).await;
    }

    pub async fn paused(&self, admin_id: i64, broadcast_id: i64, sent_this_run: u64) {
        self.notify(admin_id, &format_paused(broadcast_id, sent_this_run))
            .await;
    }

    pub async fn completed(&self, admin_id: i64, broadcast_id: i64, totals: BroadcastTotals) {
        self.notify(admin_id, &format_completed(broadcast_id, totals))
            .await;
    }

    pub async fn fault(&self, admin_id: i64, broadcast_id: i64, err: &anyhow::Error) {
        self.notify(admin_id, &format_fault(broadcast_id, err)).await;
    }

    async fn notify(&self, admin_id: i64, text: &str) {
        let outcome = self.client.send(admin_id, text).await;
        if !outcome.is_delivered() {
            debug!(admin = admin_id, ?outcome, "progress report not delivered");
        }
    }
}

fn format_batch(
    batch_num: u32,
    sent: u64,
    chunk_size: usize,
    failed: u64,
    total_sent: u64,
    total_failed: u64,
    elapsed: Duration,
) -> String {
    format!(
        "Batch #{batch_num}: sent {sent} of {chunk_size}, {failed} failed. \
         Running total: {total_sent} sent, {total_failed} failed, {} elapsed.",
        format_elapsed(elapsed)
    )
}

fn format_paused(broadcast_id: i64, sent_this_run: u64) -> String {
    format!(
        "Send limit reached. Broadcast #{broadcast_id} is paused and resumes \
         on a later run. Sent this run: {sent_this_run}."
    )
}

fn format_completed(broadcast_id: i64, totals: BroadcastTotals) -> String {
    format!(
        "Broadcast #{broadcast_id} completed. Total sent: {}, failed: {}.",
        totals.sent, totals.failed
    )
}

fn format_fault(broadcast_id: i64, err: &anyhow::Error) -> String {
    format!("Error while processing broadcast #{broadcast_id}: {err}. It will be retried on the next run.")
}

fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
