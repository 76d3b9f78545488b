//! # crier — Telegram broadcast bot
//!
//! Sends a single admin-authored message to every subscriber without
//! exceeding the Bot API rate limits. Designed to be driven from cron:
//! each `crier run` invocation claims eligible broadcasts one at a time,
//! delivers a bounded number of messages, persists progress per recipient,
//! and exits. Overlapping invocations are safe because claiming a broadcast
//! is a single conditional status update; a crashed invocation's claim
//! self-heals via a staleness timeout on the next run.
//!
//! ## Broadcast life-cycle
//!
//! ```text
//! /broadcast             admin text             crier run
//! pending_text ────────> sending ──(claim)──> processing ──────> completed
//!                           ^                      │
//!                           └── budget hit / fault / staleness ──┘
//! ```
//!
//! Progress lives entirely in the attempt ledger: one row per
//! (broadcast, recipient), written exactly once. The recipient cursor is an
//! anti-join against that ledger, so resuming after a crash never sends
//! duplicates and never skips anyone.

pub mod compose;
pub mod config;
pub mod dispatcher;
pub mod report;
pub mod store;
pub mod telegram;
pub mod webhook;
