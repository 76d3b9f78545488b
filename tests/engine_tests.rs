//! Dispatch engine tests against the in-memory store and a scripted
//! delivery client: claim exclusivity, crash-and-resume, budgets, caps,
//! retry/backoff timing and fault handling.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use common::{
    fast_engine, published_broadcast, seed_recipients, MockClient, ADMIN_CHAT, CHAT_BASE,
};
use crier::dispatcher::Dispatcher;
use crier::store::memory::MemoryStore;
use crier::store::{Attempt, AttemptStatus, Broadcast, BroadcastStatus, BroadcastTotals, Recipient, Store};
use crier::telegram::SendOutcome;

fn dispatcher(
    store: &Arc<MemoryStore>,
    client: &Arc<MockClient>,
) -> Dispatcher<MemoryStore, MockClient> {
    Dispatcher::new(Arc::clone(store), Arc::clone(client), fast_engine())
}

#[tokio::test]
async fn small_broadcast_completes_with_full_ledger() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MockClient::new());
    seed_recipients(&store, 5).await;
    let id = published_broadcast(&store, "hello all", None).await;

    let summary = dispatcher(&store, &client).run(None).await.unwrap();

    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.sent, 5);
    assert_eq!(summary.failed, 0);
    assert!(!summary.limit_hit);
    assert_eq!(store.status_of(id).await, Some(BroadcastStatus::Completed));
    assert_eq!(store.attempt_count(id).await.unwrap(), 5);

    // One report per batch plus the final summary, all to the owner.
    let reports = client.messages_to(ADMIN_CHAT).await;
    assert!(reports.iter().any(|m| m.starts_with("Batch #1:")));
    assert!(reports
        .iter()
        .any(|m| m.contains("completed. Total sent: 5, failed: 0")));
}

#[tokio::test]
async fn claim_race_has_exactly_one_winner() {
    let store = Arc::new(MemoryStore::new());
    seed_recipients(&store, 3).await;
    let id = published_broadcast(&store, "race", None).await;

    assert!(store.claim(id).await.unwrap());
    assert!(!store.claim(id).await.unwrap());
}

#[tokio::test]
async fn losing_invocation_writes_no_attempts() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MockClient::new());
    seed_recipients(&store, 3).await;
    let id = published_broadcast(&store, "claimed elsewhere", None).await;

    // Another invocation holds the claim.
    assert!(store.claim(id).await.unwrap());

    let summary = dispatcher(&store, &client).run(None).await.unwrap();
    assert_eq!(summary.claimed, 0);
    assert_eq!(store.attempt_count(id).await.unwrap(), 0);
    assert_eq!(client.attempts_in_range(CHAT_BASE, CHAT_BASE + 100).await, 0);
}

#[tokio::test]
async fn crash_resume_delivers_exactly_the_remainder() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MockClient::new());
    seed_recipients(&store, 10).await;
    let id = published_broadcast(&store, "resume me", None).await;

    // Simulate a crashed invocation: claim taken, four outcomes recorded,
    // then silence past the staleness timeout.
    assert!(store.claim(id).await.unwrap());
    for recipient_id in 1..=4 {
        store
            .record_attempt(id, recipient_id, 1, AttemptStatus::Sent, None)
            .await
            .unwrap();
    }
    store.backdate_broadcast(id, Duration::from_secs(11 * 60)).await;

    let summary = dispatcher(&store, &client).run(None).await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.sent, 6, "only the un-attempted remainder is sent");
    assert_eq!(store.attempt_count(id).await.unwrap(), 10);
    for recipient_id in 1..=4 {
        assert_eq!(
            client.messages_to(CHAT_BASE + recipient_id).await.len(),
            0,
            "recipient {recipient_id} was already attempted"
        );
    }
    for recipient_id in 5..=10 {
        assert_eq!(client.messages_to(CHAT_BASE + recipient_id).await.len(), 1);
    }

    // Final totals come from the ledger, so they are cumulative.
    let reports = client.messages_to(ADMIN_CHAT).await;
    assert!(reports
        .iter()
        .any(|m| m.contains("completed. Total sent: 10, failed: 0")));
}

#[tokio::test]
async fn fresh_claim_is_not_reclaimed_early() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MockClient::new());
    seed_recipients(&store, 3).await;
    let id = published_broadcast(&store, "still owned", None).await;

    assert!(store.claim(id).await.unwrap());
    store.backdate_broadcast(id, Duration::from_secs(5 * 60)).await;

    dispatcher(&store, &client).run(None).await.unwrap();

    // Five minutes is inside the staleness window: the claim holds.
    assert_eq!(store.status_of(id).await, Some(BroadcastStatus::Processing));
    assert_eq!(store.attempt_count(id).await.unwrap(), 0);
}

#[tokio::test]
async fn recipient_cap_completes_after_exactly_cap_attempts() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MockClient::new());
    seed_recipients(&store, 10).await;
    let id = published_broadcast(&store, "capped", Some(5)).await;

    let summary = dispatcher(&store, &client).run(None).await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(store.status_of(id).await, Some(BroadcastStatus::Completed));
    assert_eq!(store.attempt_count(id).await.unwrap(), 5);
    assert_eq!(client.attempts_in_range(CHAT_BASE, CHAT_BASE + 100).await, 5);
}

#[tokio::test]
async fn global_budget_pauses_first_broadcast_and_starves_second() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MockClient::new());
    seed_recipients(&store, 10).await;
    let first = published_broadcast(&store, "one", None).await;
    let second = published_broadcast(&store, "two", None).await;

    let summary = dispatcher(&store, &client).run(Some(3)).await.unwrap();

    assert!(summary.limit_hit);
    assert_eq!(summary.sent, 3);
    assert_eq!(client.attempts_in_range(CHAT_BASE, CHAT_BASE + 100).await, 3);

    // First broadcast paused back to sending; second never started.
    assert_eq!(store.status_of(first).await, Some(BroadcastStatus::Sending));
    assert_eq!(store.status_of(second).await, Some(BroadcastStatus::Sending));
    assert_eq!(store.attempt_count(first).await.unwrap(), 3);
    assert_eq!(store.attempt_count(second).await.unwrap(), 0);

    let reports = client.messages_to(ADMIN_CHAT).await;
    assert!(reports.iter().any(|m| m.contains("Send limit reached")));
}

#[tokio::test]
async fn paused_broadcast_resumes_and_completes_on_next_run() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MockClient::new());
    seed_recipients(&store, 6).await;
    let id = published_broadcast(&store, "two runs", None).await;

    let engine = dispatcher(&store, &client);
    let first = engine.run(Some(4)).await.unwrap();
    assert!(first.limit_hit);
    assert_eq!(store.attempt_count(id).await.unwrap(), 4);

    let second = engine.run(Some(4)).await.unwrap();
    assert!(!second.limit_hit);
    assert_eq!(second.sent, 2);
    assert_eq!(store.status_of(id).await, Some(BroadcastStatus::Completed));
    assert_eq!(store.attempt_count(id).await.unwrap(), 6);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_hint_is_honored_before_next_attempt() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MockClient::new());
    seed_recipients(&store, 1).await;
    let id = published_broadcast(&store, "throttled", None).await;
    client
        .queue(
            CHAT_BASE + 1,
            SendOutcome::RateLimited {
                retry_after: Duration::from_secs(2),
            },
        )
        .await;

    let started = tokio::time::Instant::now();
    dispatcher(&store, &client).run(None).await.unwrap();

    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "the hinted wait must pass before the retry"
    );
    let attempt = store.get_attempt(id, 1).await.unwrap().unwrap();
    // The wait is not an attempt: one throttled try plus one successful retry.
    assert_eq!(attempt.attempts, 2);
    assert_eq!(attempt.status, AttemptStatus::Sent);
}

#[tokio::test(start_paused = true)]
async fn generic_failures_back_off_linearly() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MockClient::new());
    seed_recipients(&store, 1).await;
    let id = published_broadcast(&store, "flaky network", None).await;
    for _ in 0..2 {
        client
            .queue(
                CHAT_BASE + 1,
                SendOutcome::Rejected {
                    code: 0,
                    description: "connection reset".to_string(),
                },
            )
            .await;
    }

    let mut engine = fast_engine();
    engine.retry_backoff = Duration::from_millis(500);
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&client), engine);

    let started = tokio::time::Instant::now();
    dispatcher.run(None).await.unwrap();

    // 500ms after the first failure, 1000ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(1500));
    let attempt = store.get_attempt(id, 1).await.unwrap().unwrap();
    assert_eq!(attempt.attempts, 3);
    assert_eq!(attempt.status, AttemptStatus::Sent);
}

#[tokio::test]
async fn permanent_failure_is_recorded_after_three_tries() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MockClient::new());
    seed_recipients(&store, 3).await;
    let id = published_broadcast(&store, "mixed", None).await;
    client
        .respond_always(
            CHAT_BASE + 2,
            SendOutcome::Rejected {
                code: 403,
                description: "Forbidden: bot was blocked by the user".to_string(),
            },
        )
        .await;

    let summary = dispatcher(&store, &client).run(None).await.unwrap();

    assert_eq!(summary.sent, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(store.status_of(id).await, Some(BroadcastStatus::Completed));

    let attempt = store.get_attempt(id, 2).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.attempts, 3);
    assert!(attempt.last_error.as_deref().unwrap().contains("403"));

    let totals = store.totals(id).await.unwrap();
    assert_eq!(totals, BroadcastTotals { sent: 2, failed: 1 });
}

// ── Fault handling ──────────────────────────────────────────────

/// Store wrapper that fails the Nth `record_attempt` call, simulating the
/// database going away mid-batch.
struct FlakyStore {
    inner: MemoryStore,
    fail_on_call: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Store for FlakyStore {
    async fn register_recipient(
        &self,
        chat_id: i64,
        user_id: Option<i64>,
        username: Option<&str>,
    ) -> Result<()> {
        self.inner.register_recipient(chat_id, user_id, username).await
    }

    async fn create_pending_broadcast(
        &self,
        admin_id: i64,
        max_recipients: Option<i64>,
    ) -> Result<i64> {
        self.inner.create_pending_broadcast(admin_id, max_recipients).await
    }

    async fn latest_pending_for(&self, admin_id: i64) -> Result<Option<Broadcast>> {
        self.inner.latest_pending_for(admin_id).await
    }

    async fn publish_broadcast(&self, id: i64, text: &str) -> Result<()> {
        self.inner.publish_broadcast(id, text).await
    }

    async fn reclaim_stalled(&self, stale_after: Duration) -> Result<u64> {
        self.inner.reclaim_stalled(stale_after).await
    }

    async fn list_sending(&self) -> Result<Vec<Broadcast>> {
        self.inner.list_sending().await
    }

    async fn claim(&self, id: i64) -> Result<bool> {
        self.inner.claim(id).await
    }

    async fn release(&self, id: i64) -> Result<()> {
        self.inner.release(id).await
    }

    async fn mark_completed(&self, id: i64) -> Result<()> {
        self.inner.mark_completed(id).await
    }

    async fn touch(&self, id: i64) -> Result<()> {
        self.inner.touch(id).await
    }

    async fn next_batch(&self, broadcast_id: i64, limit: i64) -> Result<Vec<Recipient>> {
        self.inner.next_batch(broadcast_id, limit).await
    }

    async fn record_attempt(
        &self,
        broadcast_id: i64,
        recipient_id: i64,
        attempts: i32,
        status: AttemptStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_call {
            bail!("synthetic storage failure");
        }
        self.inner
            .record_attempt(broadcast_id, recipient_id, attempts, status, last_error)
            .await
    }

    async fn get_attempt(&self, broadcast_id: i64, recipient_id: i64) -> Result<Option<Attempt>> {
        self.inner.get_attempt(broadcast_id, recipient_id).await
    }

    async fn attempt_count(&self, broadcast_id: i64) -> Result<i64> {
        self.inner.attempt_count(broadcast_id).await
    }

    async fn totals(&self, broadcast_id: i64) -> Result<BroadcastTotals> {
        self.inner.totals(broadcast_id).await
    }

    async fn get_broadcast(&self, id: i64) -> Result<Option<Broadcast>> {
        self.inner.get_broadcast(id).await
    }
}

#[tokio::test]
async fn fault_mid_batch_releases_claim_and_keeps_ledger() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        fail_on_call: 3,
        calls: AtomicU32::new(0),
    });
    let client = Arc::new(MockClient::new());
    seed_recipients(&store.inner, 5).await;
    let id = store
        .inner
        .create_pending_broadcast(ADMIN_CHAT, None)
        .await
        .unwrap();
    store.inner.publish_broadcast(id, "doomed").await.unwrap();

    let engine: Dispatcher<FlakyStore, MockClient> =
        Dispatcher::new(Arc::clone(&store), Arc::clone(&client), fast_engine());
    let summary = engine.run(None).await.unwrap();

    // The broadcast is never completed; the claim is released for the next
    // run, and the two outcomes recorded before the fault survive.
    assert_eq!(summary.completed, 0);
    assert_eq!(
        store.inner.status_of(id).await,
        Some(BroadcastStatus::Sending)
    );
    assert_eq!(store.inner.attempt_count(id).await.unwrap(), 2);

    let reports = client.messages_to(ADMIN_CHAT).await;
    assert!(reports
        .iter()
        .any(|m| m.contains("Error while processing broadcast")));
}
