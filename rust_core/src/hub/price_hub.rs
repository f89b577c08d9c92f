//! Price hub: turns the exchange stream into per-ticker tokens, persists the
//! latest price, and fans each token out to every live subscriber.

use super::config::HubConfig;
use super::mailbox::Mailbox;
use super::registry::{BroadcastReport, SubscriptionId, SubscriptionRegistry};
use super::stream::TokenStream;
use crate::clients::Exchange;
use crate::db::PriceStore;
use crate::error::{CoreError, CoreResult};
use crate::types::{PriceUpdate, Ticker, Token};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dispatch counters
#[derive(Debug, Default)]
pub struct HubStats {
    pub updates_received: AtomicU64,
    /// Updates persisted and offered to every subscriber
    pub updates_dispatched: AtomicU64,
    pub tokens_queued: AtomicU64,
    pub tokens_displaced: AtomicU64,
    pub tokens_delivered: AtomicU64,
    pub store_errors: AtomicU64,
    pub subscriptions_opened: AtomicU64,
    pub subscriptions_closed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStatsSnapshot {
    pub updates_received: u64,
    pub updates_dispatched: u64,
    pub tokens_queued: u64,
    pub tokens_displaced: u64,
    pub tokens_delivered: u64,
    pub store_errors: u64,
    pub subscriptions_opened: u64,
    pub subscriptions_closed: u64,
}

impl HubStats {
    pub fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            updates_received: self.updates_received.load(Ordering::Relaxed),
            updates_dispatched: self.updates_dispatched.load(Ordering::Relaxed),
            tokens_queued: self.tokens_queued.load(Ordering::Relaxed),
            tokens_displaced: self.tokens_displaced.load(Ordering::Relaxed),
            tokens_delivered: self.tokens_delivered.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            subscriptions_opened: self.subscriptions_opened.load(Ordering::Relaxed),
            subscriptions_closed: self.subscriptions_closed.load(Ordering::Relaxed),
        }
    }

    fn record_broadcast(&self, report: &BroadcastReport) {
        self.tokens_queued
            .fetch_add(report.queued + report.displaced, Ordering::Relaxed);
        self.tokens_displaced
            .fetch_add(report.displaced, Ordering::Relaxed);
    }
}

type FeedChannel = (mpsc::Sender<PriceUpdate>, mpsc::Receiver<PriceUpdate>);

pub struct PriceHub {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn PriceStore>,
    registry: Arc<SubscriptionRegistry>,
    config: HubConfig,
    stats: Arc<HubStats>,
    /// Taken by the first `start`
    feed: Mutex<Option<FeedChannel>>,
}

impl PriceHub {
    pub fn new(exchange: Arc<dyn Exchange>, store: Arc<dyn PriceStore>, config: HubConfig) -> Self {
        Self::with_registry(exchange, store, Arc::new(SubscriptionRegistry::new()), config)
    }

    pub fn with_registry(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn PriceStore>,
        registry: Arc<SubscriptionRegistry>,
        config: HubConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.feed_buffer.max(1));
        Self {
            exchange,
            store,
            registry,
            config,
            stats: Arc::new(HubStats::default()),
            feed: Mutex::new(Some((tx, rx))),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<HubStats> {
        &self.stats
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Connect the exchange, subscribe every stored ticker and spawn the
    /// dispatch loop. The loop runs until `cancel` fires.
    ///
    /// Fails if the exchange cannot connect, the stored tickers cannot be
    /// listed or subscribed, or the hub was already started.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> CoreResult<JoinHandle<()>> {
        let (tx, updates) = self
            .feed
            .lock()
            .take()
            .ok_or_else(|| CoreError::FailedPrecondition("price hub already started".into()))?;

        info!("Starting price hub on {}", self.exchange.name());
        self.exchange.start(cancel.child_token(), tx).await?;

        let tickers = self.store.list_tickers().await?;
        if !tickers.is_empty() {
            self.exchange.subscribe(&tickers).await?;
            info!("Subscribed to {} stored tickers", tickers.len());
            if self.config.seed_prices {
                self.seed_prices(&tickers).await;
            }
        }

        let hub = Arc::clone(self);
        Ok(tokio::spawn(async move { hub.dispatch_loop(updates, cancel).await }))
    }

    /// Ensure `ticker` is streamed by the exchange and known to the store.
    /// Returns `true` if the store did not know it yet.
    pub async fn add_ticker(&self, ticker: &Ticker) -> CoreResult<bool> {
        self.exchange.subscribe(std::slice::from_ref(ticker)).await?;
        let is_new = self.store.upsert(ticker).await?;
        if is_new {
            info!("Now tracking {}", ticker);
        }
        Ok(is_new)
    }

    /// Open a subscription receiving every token dispatched from now on.
    ///
    /// The subscription is removed from the registry once `cancel` fires or
    /// the returned stream is dropped. `TokenStream::cancel` ends only this
    /// subscription, never `cancel` itself. Must be called within a tokio
    /// runtime.
    pub fn subscribe(&self, cancel: CancellationToken) -> TokenStream {
        let cancel = cancel.child_token();
        let mailbox = Arc::new(Mailbox::new(
            self.config.mailbox_capacity,
            self.config.overflow_policy,
        ));
        let id = self.registry.register(Arc::clone(&mailbox));
        let (tx, rx) = mpsc::channel(self.config.output_buffer.max(1));
        self.stats.subscriptions_opened.fetch_add(1, Ordering::Relaxed);

        let forwarder = Forwarder {
            id,
            mailbox,
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
        };
        tokio::spawn(forwarder.run(tx, cancel.clone()));

        TokenStream::new(id, rx, cancel)
    }

    async fn seed_prices(&self, tickers: &[Ticker]) {
        let prices = match self.exchange.get_prices(tickers).await {
            Ok(prices) => prices,
            Err(e) => {
                warn!("Failed to seed prices from {}: {}", self.exchange.name(), e);
                return;
            }
        };

        let mut seeded = 0usize;
        for (ticker, price) in &prices {
            match self.store.set_price(ticker, *price).await {
                Ok(()) => seeded += 1,
                Err(e) => warn!("Failed to seed price for {}: {}", ticker, e),
            }
        }
        info!("Seeded {}/{} prices", seeded, tickers.len());
    }

    async fn dispatch_loop(&self, mut updates: mpsc::Receiver<PriceUpdate>, cancel: CancellationToken) {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                next = updates.recv() => match next {
                    Some(update) => update,
                    None => {
                        warn!("Exchange feed closed");
                        break;
                    }
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.dispatch(update) => {}
            }
        }
        info!("Price hub dispatch loop stopped");
    }

    /// Persist and fan out a single update. Store failures are logged and do
    /// not prevent delivery.
    async fn dispatch(&self, update: PriceUpdate) {
        self.stats.updates_received.fetch_add(1, Ordering::Relaxed);

        for (ticker, price) in update.iter() {
            if let Err(e) = self.store.set_price(ticker, price).await {
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to store price for {}: {}", ticker, e);
            }
        }

        let tokens = update.tokens();
        let report = self.registry.broadcast(&tokens).await;
        self.stats.record_broadcast(&report);
        self.stats.updates_dispatched.fetch_add(1, Ordering::Relaxed);
        if report.displaced > 0 {
            debug!("Dropped {} stale tokens for slow subscribers", report.displaced);
        }
    }
}

/// Moves tokens from one subscriber's mailbox to its output channel.
struct Forwarder {
    id: SubscriptionId,
    mailbox: Arc<Mailbox>,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<HubStats>,
}

impl Forwarder {
    async fn run(self, tx: mpsc::Sender<Token>, cancel: CancellationToken) {
        loop {
            let token = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                next = self.mailbox.pop() => match next {
                    Some(token) => token,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = tx.send(token) => {
                    if sent.is_err() {
                        break;
                    }
                    self.stats.tokens_delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if self.registry.unregister(self.id) {
            self.stats.subscriptions_closed.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Subscription {} closed", self.id);
    }
}
