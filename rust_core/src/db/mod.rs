//! Storage collaborators for tracked tickers, last-known prices and triggers.
//!
//! The core only talks to the [`PriceStore`] and [`TriggerStore`] traits.
//! Postgres implementations back the service; in-memory implementations back
//! tests and local runs.
//!
//! The Postgres tables are described in [`schema`].

pub mod health;
pub mod memory;
pub mod pool;
pub mod prices;
pub mod schema;
pub mod triggers;

use crate::error::CoreResult;
use crate::types::{Ticker, UserId};
use async_trait::async_trait;

pub use memory::{InMemoryPriceStore, InMemoryTriggerStore};
pub use pool::{create_pool, DbPoolConfig};
pub use prices::PgPriceStore;
pub use triggers::PgTriggerStore;

/// Tracked tickers and their last known price.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Record a ticker as tracked. Returns `true` when it was not known before.
    async fn upsert(&self, ticker: &Ticker) -> CoreResult<bool>;

    /// Store the latest price. Fails with `NotFound` for an unknown ticker.
    async fn set_price(&self, ticker: &Ticker, price: f64) -> CoreResult<()>;

    /// Every tracked ticker.
    async fn list_tickers(&self) -> CoreResult<Vec<Ticker>>;

    /// Last known price, `None` if the ticker has never been priced.
    /// Fails with `NotFound` for an unknown ticker.
    async fn get_price(&self, ticker: &Ticker) -> CoreResult<Option<f64>>;
}

/// Durable (user, ticker) interest records.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Add a trigger. Adding an existing trigger is a no-op.
    async fn add(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<()>;

    /// Remove a trigger. Fails with `NotFound` if it does not exist.
    async fn remove(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<()>;

    async fn exists(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<bool>;

    /// Every ticker the user holds a trigger for.
    async fn list_for_user(&self, user_id: UserId) -> CoreResult<Vec<Ticker>>;
}
