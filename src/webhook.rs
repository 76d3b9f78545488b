//! # Webhook — Inbound Telegram update endpoint
//!
//! Small axum surface: `POST /webhook` guarded by the secret token Telegram
//! echoes in the `X-Telegram-Bot-Api-Secret-Token` header, routed to the
//! command router; `GET /healthz` for probes. Everything stateful lives in
//! the shared [`AppState`].

use std::sync::Arc;

use anyhow::{ensure, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, info};

use crate::compose;
use crate::config::Config;
use crate::store::Store;
use crate::telegram::{DeliveryClient, Update};

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

pub struct AppState<S: ?Sized, C: ?Sized> {
    pub store: Arc<S>,
    pub client: Arc<C>,
    pub config: Config,
}

pub fn build_router<S, C>(state: Arc<AppState<S, C>>) -> Router
where
    S: Store + ?Sized + 'static,
    C: DeliveryClient + ?Sized + 'static,
{
    Router::new()
        .route("/webhook", post(handler_webhook::<S, C>))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn handler_webhook<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> StatusCode
where
    S: Store + ?Sized + 'static,
    C: DeliveryClient + ?Sized + 'static,
{
    let secret = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if secret != state.config.webhook_secret {
        return StatusCode::FORBIDDEN;
    }

    match compose::handle_update(
        state.store.as_ref(),
        state.client.as_ref(),
        &state.config,
        update,
    )
    .await
    {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            error!(error = %err, "failed to handle update");
            // Non-2xx makes Telegram redeliver the update once storage is back.
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Serve the webhook endpoint until the process is stopped.
pub async fn run<S, C>(state: Arc<AppState<S, C>>, port: u16) -> Result<()>
where
    S: Store + ?Sized + 'static,
    C: DeliveryClient + ?Sized + 'static,
{
    ensure!(
        !state.config.webhook_secret.is_empty(),
        "WEBHOOK_SECRET must be set to serve the webhook"
    );
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "webhook listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
