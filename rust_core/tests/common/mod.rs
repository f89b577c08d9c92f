//! Shared fixtures: a scripted exchange and an in-memory hub.

#![allow(dead_code)]

use async_trait::async_trait;
use cryptowatch_rust_core::db::{InMemoryPriceStore, InMemoryTriggerStore};
use cryptowatch_rust_core::clients::Exchange;
use cryptowatch_rust_core::{
    CancellationToken, CoreError, CoreResult, HubConfig, PriceHub, PriceUpdate, Ticker,
    TokenStream, Token,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub fn ticker(s: &str) -> Ticker {
    Ticker::parse(s).unwrap()
}

/// Exchange driven by the test: updates are pushed with `emit`.
#[derive(Default)]
pub struct ScriptedExchange {
    sender: Mutex<Option<mpsc::Sender<PriceUpdate>>>,
    subscribed: Mutex<Vec<Ticker>>,
    prices: Mutex<HashMap<Ticker, f64>>,
    fail_subscribe: AtomicBool,
}

impl ScriptedExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn emit(&self, update: PriceUpdate) {
        let sender = self.sender.lock().clone().expect("exchange not started");
        sender.send(update).await.expect("hub dropped the feed");
    }

    pub async fn emit_price(&self, symbol: &str, price: f64) {
        self.emit(PriceUpdate::single(ticker(symbol), price)).await;
    }

    pub fn subscribed(&self) -> Vec<Ticker> {
        self.subscribed.lock().clone()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().insert(ticker(symbol), price);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Exchange for ScriptedExchange {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(
        &self,
        _cancel: CancellationToken,
        updates: mpsc::Sender<PriceUpdate>,
    ) -> CoreResult<()> {
        *self.sender.lock() = Some(updates);
        Ok(())
    }

    async fn subscribe(&self, tickers: &[Ticker]) -> CoreResult<()> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(CoreError::internal("connection not open"));
        }
        self.subscribed.lock().extend_from_slice(tickers);
        Ok(())
    }

    async fn get_prices(&self, tickers: &[Ticker]) -> CoreResult<HashMap<Ticker, f64>> {
        let prices = self.prices.lock();
        Ok(tickers
            .iter()
            .filter_map(|t| prices.get(t).map(|p| (t.clone(), *p)))
            .collect())
    }
}

pub struct Harness {
    pub exchange: Arc<ScriptedExchange>,
    pub prices: Arc<InMemoryPriceStore>,
    pub triggers: Arc<InMemoryTriggerStore>,
    pub hub: Arc<PriceHub>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub async fn start(config: HubConfig) -> Self {
        Self::start_with(ScriptedExchange::new(), Arc::new(InMemoryPriceStore::new()), config).await
    }

    pub async fn start_with(
        exchange: Arc<ScriptedExchange>,
        prices: Arc<InMemoryPriceStore>,
        config: HubConfig,
    ) -> Self {
        let triggers = Arc::new(InMemoryTriggerStore::with_price_store(prices.clone()));
        let hub = Arc::new(PriceHub::new(exchange.clone(), prices.clone(), config));
        let cancel = CancellationToken::new();
        hub.start(cancel.clone()).await.unwrap();

        Self {
            exchange,
            prices,
            triggers,
            hub,
            cancel,
        }
    }

    /// Wait until the registry holds exactly `count` subscribers.
    pub async fn wait_for_subscribers(&self, count: usize) {
        tokio::time::timeout(RECV_TIMEOUT, async {
            while self.hub.registry().len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }

    /// Wait until the dispatch loop has fully handled `count` updates.
    pub async fn wait_for_dispatched(&self, count: u64) {
        tokio::time::timeout(RECV_TIMEOUT, async {
            while self.hub.stats().snapshot().updates_dispatched < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("updates were never dispatched");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn next_token(stream: &mut TokenStream) -> Token {
    tokio::time::timeout(RECV_TIMEOUT, stream.recv())
        .await
        .expect("timed out waiting for token")
        .expect("stream ended")
}

/// Asserts nothing arrives within a short window.
pub async fn assert_quiet(stream: &mut TokenStream) {
    let result = tokio::time::timeout(Duration::from_millis(100), stream.recv()).await;
    assert!(result.is_err(), "unexpected token: {:?}", result);
}
