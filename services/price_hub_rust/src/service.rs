//! Wires storage, the exchange feed, the hub and the Redis adapters.

use crate::bridge::TokenBridge;
use crate::commands::CommandListener;
use crate::config::Config;
use anyhow::{Context, Result};
use cryptowatch_rust_core::clients::CryptoCompareFeed;
use cryptowatch_rust_core::db::health::{check_pool_health, PoolHealth, PoolHealthMonitor};
use cryptowatch_rust_core::db::{create_pool, PgPriceStore, PgTriggerStore};
use cryptowatch_rust_core::redis::{Publisher, RedisBus};
use cryptowatch_rust_core::{CancellationToken, PriceHub, TriggerRouter};
use futures_util::future::join_all;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub struct PriceHubService {
    config: Config,
    pool: PgPool,
    feed: Arc<CryptoCompareFeed>,
    hub: Arc<PriceHub>,
    router: TriggerRouter,
    bus: RedisBus,
}

impl PriceHubService {
    pub async fn new(config: Config) -> Result<Self> {
        let pool = create_pool(&config.database_url, &config.db_pool).await?;
        check_pool_health(&pool).await?;

        let bus = RedisBus::connect(&config.redis_url).await?;

        let feed = Arc::new(
            CryptoCompareFeed::new(config.feed.clone()).context("Failed to create feed")?,
        );
        let prices = Arc::new(PgPriceStore::new(pool.clone()));
        let triggers = Arc::new(PgTriggerStore::new(pool.clone()));

        let hub = Arc::new(PriceHub::new(feed.clone(), prices, config.hub.clone()));
        let router = TriggerRouter::new(hub.clone(), triggers, config.router.clone());

        Ok(Self {
            config,
            pool,
            feed,
            hub,
            router,
            bus,
        })
    }

    /// Run until `cancel` fires. Fails only if the hub cannot start.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let dispatch = self
            .hub
            .start(cancel.clone())
            .await
            .context("Failed to start price hub")?;
        let mut tasks = vec![dispatch];

        let monitor = PoolHealthMonitor::new(self.pool.clone(), self.config.pool_health.clone());
        let pool_health = monitor.health();
        tasks.push(monitor.spawn(cancel.clone()));

        let publisher: Arc<dyn Publisher> = Arc::new(self.bus.clone());
        let bridge = TokenBridge::new(
            self.hub.clone(),
            publisher.clone(),
            self.config.token_channel_prefix.clone(),
        );
        tasks.push(tokio::spawn(bridge.run(cancel.clone())));

        if self.config.commands_enabled {
            let commands = self
                .bus
                .subscribe(
                    vec![self.config.commands_channel()],
                    self.config.redis_reconnect.clone(),
                )
                .into_stream(cancel.clone());
            let listener = CommandListener::new(
                self.router.clone(),
                publisher,
                self.config.token_channel_prefix.clone(),
            );
            tasks.push(tokio::spawn(listener.run(commands, cancel.clone())));
        }

        tasks.push(tokio::spawn(report_stats(
            self.hub.clone(),
            self.feed.clone(),
            pool_health,
            cancel.clone(),
        )));

        info!("price_hub_rust running");
        cancel.cancelled().await;
        info!("Shutting down...");

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Task failed during shutdown: {}", e);
            }
        }
        self.pool.close().await;
        info!("price_hub_rust stopped");
        Ok(())
    }
}

async fn report_stats(
    hub: Arc<PriceHub>,
    feed: Arc<CryptoCompareFeed>,
    pool_health: Arc<PoolHealth>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let hub_stats = hub.stats().snapshot();
                let feed_stats = feed.stats().snapshot();
                info!(
                    "Stats: subscribers={} updates={} delivered={} displaced={} store_errors={} frames={} skipped={} reconnects={} db_healthy={}",
                    hub.registry().len(),
                    hub_stats.updates_dispatched,
                    hub_stats.tokens_delivered,
                    hub_stats.tokens_displaced,
                    hub_stats.store_errors,
                    feed_stats.frames_received,
                    feed_stats.frames_skipped,
                    feed_stats.successful_reconnects,
                    pool_health.is_healthy(),
                );
            }
        }
    }
}
