//! # Compose — Admin command router
//!
//! Maps inbound messages to transitions on a single-slot compose state per
//! admin, keyed by `pending_text` broadcast rows — deliberately separate from
//! the engine's broadcast life-cycle. The slot is enforced only by
//! most-recent-row lookup, not a storage constraint: concurrent `/broadcast`
//! commands from the same admin can create duplicate pending rows, and later
//! rows shadow earlier ones.
//!
//! - `/start` — register the sender as a recipient, send the welcome text.
//! - `/broadcast [cap]` (admins) — open a compose slot, optionally capping
//!   the number of recipients; prompt for the message text.
//! - any other admin text while a slot is open — publish the broadcast
//!   (text attached, status `sending`); the cron-driven engine picks it up.
//! - everything else is ignored.

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::store::Store;
use crate::telegram::{DeliveryClient, Message, Update};

const PROMPT_TEXT: &str = "Send the broadcast text:";
const SAVED_TEXT: &str = "Broadcast text saved. Delivery starts with the next scheduled run.";
const NEED_TEXT: &str = "Please send a plain text message for the broadcast.";
const USAGE_TEXT: &str = "Usage: /broadcast [max recipients]";

pub async fn handle_update<S, C>(store: &S, client: &C, config: &Config, update: Update) -> Result<()>
where
    S: Store + ?Sized,
    C: DeliveryClient + ?Sized,
{
    match update.message {
        Some(message) => handle_message(store, client, config, message).await,
        None => Ok(()),
    }
}

pub async fn handle_message<S, C>(
    store: &S,
    client: &C,
    config: &Config,
    message: Message,
) -> Result<()>
where
    S: Store + ?Sized,
    C: DeliveryClient + ?Sized,
{
    let chat_id = message.chat.id;
    let text = message.text.as_deref().map(str::trim);

    if text == Some("/start") {
        let (user_id, username) = match &message.from {
            Some(user) => (Some(user.id), user.username.as_deref()),
            None => (None, None),
        };
        store.register_recipient(chat_id, user_id, username).await?;
        info!(chat = chat_id, "recipient registered");
        client.send(chat_id, &config.welcome_message).await;
        return Ok(());
    }

    if !config.is_admin(chat_id) {
        return Ok(());
    }

    if let Some(rest) = text.and_then(|t| t.strip_prefix("/broadcast")) {
        return open_compose_slot(store, client, chat_id, rest.trim()).await;
    }

    capture_compose_text(store, client, chat_id, text).await
}

/// Ensure a `pending_text` broadcast exists for this admin and prompt for
/// the message. An already-open slot is reused as-is.
async fn open_compose_slot<S, C>(store: &S, client: &C, admin_id: i64, args: &str) -> Result<()>
where
    S: Store + ?Sized,
    C: DeliveryClient + ?Sized,
{
    let max_recipients = match parse_cap(args) {
        Ok(cap) => cap,
        Err(_) => {
            client.send(admin_id, USAGE_TEXT).await;
            return Ok(());
        }
    };

    if store.latest_pending_for(admin_id).await?.is_none() {
        let id = store
            .create_pending_broadcast(admin_id, max_recipients)
            .await?;
        info!(admin = admin_id, broadcast = id, "compose slot opened");
    }
    client.send(admin_id, PROMPT_TEXT).await;
    Ok(())
}

/// If a compose slot is open, attach the text and hand the broadcast to the
/// engine; otherwise the message is not for us.
async fn capture_compose_text<S, C>(
    store: &S,
    client: &C,
    admin_id: i64,
    text: Option<&str>,
) -> Result<()>
where
    S: Store + ?Sized,
    C: DeliveryClient + ?Sized,
{
    let Some(pending) = store.latest_pending_for(admin_id).await? else {
        return Ok(());
    };
    match text {
        Some(t) if !t.is_empty() => {
            store.publish_broadcast(pending.id, t).await?;
            info!(admin = admin_id, broadcast = pending.id, "broadcast published");
            client.send(admin_id, SAVED_TEXT).await;
        }
        _ => {
            client.send(admin_id, NEED_TEXT).await;
        }
    }
    Ok(())
}

/// Optional numeric recipient cap after `/broadcast`.
fn parse_cap(args: &str) -> Result<Option<i64>, std::num::ParseIntError> {
    if args.is_empty() {
        return Ok(None);
    }
    let cap = args.parse::<i64>()?;
    Ok(if cap > 0 { Some(cap) } else { None })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_parses_positive_numbers_only() {
        assert_eq!(parse_cap(""), Ok(None));
        assert_eq!(parse_cap("500"), Ok(Some(500)));
        assert_eq!(parse_cap("0"), Ok(None));
        assert_eq!(parse_cap("-2"), Ok(None));
        assert!(parse_cap("lots").is_err());
    }
}
