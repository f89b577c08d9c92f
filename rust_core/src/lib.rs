//! Cryptowatch Core - live price fan-out and per-user price triggers.
//!
//! This crate provides:
//! - A streaming exchange client (CryptoCompare) with reconnect and resubscribe
//! - `PriceHub`: persists the latest price per ticker and fans tokens out to
//!   any number of subscribers with bounded per-subscriber mailboxes
//! - `TriggerRouter`: per-user trigger management and filtered token streams
//! - Postgres and in-memory stores for tickers, prices and triggers
//! - A Redis bus for republishing tokens and a pub/sub subscription that
//!   reconnects and resubscribes after connection loss

pub mod clients;
pub mod db;
pub mod error;
pub mod hub;
pub mod redis;
pub mod triggers;
mod types;

pub use error::{CoreError, CoreResult};
pub use hub::{HubConfig, OverflowPolicy, PriceHub, TokenStream};
pub use triggers::{RouterConfig, TriggerRouter};
pub use types::*;

/// Cancellation signal threaded through every long-running task
pub use tokio_util::sync::CancellationToken;
