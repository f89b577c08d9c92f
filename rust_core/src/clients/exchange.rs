//! Exchange Trait
//!
//! Defines the interface of a streaming market-data source feeding the
//! price hub. `CryptoCompareFeed` is the production implementation.

use crate::error::CoreResult;
use crate::types::{PriceUpdate, Ticker};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Common trait for streaming price sources
///
/// Implementations must be Send + Sync so one instance can be shared between
/// the hub's dispatch path and concurrent `add_ticker` callers.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Display name used in logs (e.g. "CryptoCompare")
    fn name(&self) -> &str;

    /// Open the streaming connection and spawn the read loop.
    ///
    /// Every valid inbound trade is forwarded on `updates`. The read loop ends
    /// when `cancel` fires or the receiving side of `updates` is dropped.
    /// Failing to open the initial connection is returned as an error.
    async fn start(
        &self,
        cancel: CancellationToken,
        updates: mpsc::Sender<PriceUpdate>,
    ) -> CoreResult<()>;

    /// Request trade notifications for the given tickers.
    ///
    /// Fails with `Internal` if the connection is not open or the request
    /// cannot be sent.
    async fn subscribe(&self, tickers: &[Ticker]) -> CoreResult<()>;

    /// Point-in-time USD prices, independent of the streaming subscription.
    ///
    /// Tickers the source does not know are absent from the result.
    async fn get_prices(&self, tickers: &[Ticker]) -> CoreResult<HashMap<Ticker, f64>>;
}
