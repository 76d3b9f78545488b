//! Shared test helpers: a scriptable delivery client and store builders.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crier::config::{Config, EngineConfig, RatePlan};
use crier::store::memory::MemoryStore;
use crier::store::Store;
use crier::telegram::{Chat, DeliveryClient, Message, SendOutcome, User};

/// Scriptable delivery client with a request log.
///
/// Responses are served per chat id: one-shot outcomes queued FIFO first,
/// then a sticky fallback, then `Delivered`. Every send is recorded so tests
/// can assert both recipient deliveries and admin progress reports.
pub struct MockClient {
    queued: Mutex<HashMap<i64, VecDeque<SendOutcome>>>,
    sticky: Mutex<HashMap<i64, SendOutcome>>,
    log: Mutex<Vec<(i64, String)>>,
}

impl MockClient {
    pub fn new() -> Self {
        MockClient {
            queued: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Queue a one-shot outcome for the next send to `chat_id`.
    pub async fn queue(&self, chat_id: i64, outcome: SendOutcome) {
        self.queued
            .lock()
            .await
            .entry(chat_id)
            .or_default()
            .push_back(outcome);
    }

    /// Make every send to `chat_id` return `outcome` once the queue is empty.
    pub async fn respond_always(&self, chat_id: i64, outcome: SendOutcome) {
        self.sticky.lock().await.insert(chat_id, outcome);
    }

    /// All messages sent to `chat_id`, in order.
    pub async fn messages_to(&self, chat_id: i64) -> Vec<String> {
        self.log
            .lock()
            .await
            .iter()
            .filter(|(id, _)| *id == chat_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Number of send attempts to chats in `[lo, hi]` (recipient range, so
    /// admin reports are excluded).
    pub async fn attempts_in_range(&self, lo: i64, hi: i64) -> usize {
        self.log
            .lock()
            .await
            .iter()
            .filter(|(id, _)| (lo..=hi).contains(id))
            .count()
    }
}

#[async_trait]
impl DeliveryClient for MockClient {
    async fn send(&self, chat_id: i64, text: &str) -> SendOutcome {
        self.log.lock().await.push((chat_id, text.to_string()));
        if let Some(queue) = self.queued.lock().await.get_mut(&chat_id) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        if let Some(outcome) = self.sticky.lock().await.get(&chat_id) {
            return outcome.clone();
        }
        SendOutcome::Delivered
    }
}

pub const ADMIN_CHAT: i64 = 99;
/// Recipient chat ids start here; recipient N (id N) has chat `CHAT_BASE + N`.
pub const CHAT_BASE: i64 = 1000;

/// Engine config with no pacing delays so tests run instantly; individual
/// tests override backoff when they assert on timing.
pub fn fast_engine() -> EngineConfig {
    EngineConfig {
        rate: RatePlan {
            batch_size: 4,
            batch_delay: Duration::ZERO,
            msg_delay: Duration::ZERO,
        },
        retry_backoff: Duration::ZERO,
        max_attempts: 3,
        stale_after: Duration::from_secs(600),
        default_max_per_run: None,
    }
}

pub fn test_config() -> Config {
    Config {
        bot_token: "test-token".to_string(),
        webhook_secret: "hunter2".to_string(),
        admin_ids: vec![ADMIN_CHAT],
        welcome_message: "Welcome! You are subscribed to updates.".to_string(),
        engine: fast_engine(),
    }
}

/// Register `n` recipients; recipient ids are 1..=n, chats CHAT_BASE+1..
pub async fn seed_recipients(store: &MemoryStore, n: i64) {
    for i in 1..=n {
        store
            .register_recipient(CHAT_BASE + i, Some(CHAT_BASE + i), None)
            .await
            .unwrap();
    }
}

/// Create a broadcast already in `sending`, ready for the engine.
pub async fn published_broadcast(
    store: &MemoryStore,
    text: &str,
    max_recipients: Option<i64>,
) -> i64 {
    let id = store
        .create_pending_broadcast(ADMIN_CHAT, max_recipients)
        .await
        .unwrap();
    store.publish_broadcast(id, text).await.unwrap();
    id
}

pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// Connect to the test database, apply the schema and truncate all tables
/// for isolation. Callers gate on [`has_test_db`] first.
pub async fn setup_test_store() -> crier::store::postgres::PgStore {
    let url = std::env::var("TEST_DATABASE_URL").unwrap();
    let store = crier::store::postgres::PgStore::connect(&url)
        .await
        .expect("failed to connect to test database");
    store.migrate().await.expect("failed to apply schema");
    sqlx::raw_sql("TRUNCATE TABLE attempts, broadcasts, recipients CASCADE")
        .execute(store.pool())
        .await
        .expect("failed to truncate test tables");
    store
}

pub fn message(chat_id: i64, text: Option<&str>) -> Message {
    Message {
        chat: Chat { id: chat_id },
        from: Some(User {
            id: chat_id,
            username: Some("tester".to_string()),
        }),
        text: text.map(str::to_string),
    }
}
