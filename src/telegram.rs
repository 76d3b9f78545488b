//! # Telegram — Bot API delivery client
//!
//! Thin wrapper over `sendMessage` plus the wire types for inbound updates.
//! The engine only needs one primitive: send a text to a chat and learn
//! whether it was delivered, rejected, or throttled. Transport errors fold
//! into [`SendOutcome::Rejected`] so the retry loop treats every failure
//! uniformly; a 429 with `parameters.retry_after` becomes
//! [`SendOutcome::RateLimited`] and is scheduled, not counted as an error.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

// ── Outbound ────────────────────────────────────────────────────

/// Structured result of a single send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The API asked us to back off; wait `retry_after` before the next attempt.
    RateLimited { retry_after: Duration },
    /// Any other failure, including transport errors (code 0).
    Rejected { code: i64, description: String },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}

/// Single-message send primitive consumed by the dispatch engine and the
/// reporter. Implemented by [`TelegramClient`] in production and by mock
/// clients in tests.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> SendOutcome;
}

/// Bot API response envelope for `sendMessage` and `setWebhook`.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

fn outcome_from_response(resp: ApiResponse) -> SendOutcome {
    if resp.ok {
        return SendOutcome::Delivered;
    }
    let code = resp.error_code.unwrap_or(0);
    if code == 429 {
        let secs = resp
            .parameters
            .and_then(|p| p.retry_after)
            .unwrap_or(1);
        return SendOutcome::RateLimited {
            retry_after: Duration::from_secs(secs),
        };
    }
    SendOutcome::Rejected {
        code,
        description: resp
            .description
            .unwrap_or_else(|| "unknown error".to_string()),
    }
}

pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self::with_base_url(token, "https://api.telegram.org")
    }

    /// Point the client at a different API base URL (mock servers in tests).
    pub fn with_base_url(token: &str, base_url: &str) -> Self {
        TelegramClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// Register `url` as this bot's webhook, with the secret token Telegram
    /// will echo back in the `X-Telegram-Bot-Api-Secret-Token` header.
    pub async fn set_webhook(&self, url: &str, secret: &str) -> Result<()> {
        let body = json!({ "url": url, "secret_token": secret });
        let resp: ApiResponse = self
            .http
            .post(self.method_url("setWebhook"))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if !resp.ok {
            bail!(
                "setWebhook failed: {}",
                resp.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryClient for TelegramClient {
    async fn send(&self, chat_id: i64, text: &str) -> SendOutcome {
        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        let resp = match self
            .http
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return SendOutcome::Rejected {
                    code: 0,
                    description: e.to_string(),
                }
            }
        };
        match resp.json::<ApiResponse>().await {
            Ok(api) => outcome_from_response(api),
            Err(e) => SendOutcome::Rejected {
                code: 0,
                description: format!("invalid API response: {e}"),
            },
        }
    }
}

// ── Inbound ─────────────────────────────────────────────────────

/// Webhook update payload. Only the message subset this bot routes on.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}
