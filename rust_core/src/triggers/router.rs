//! Per-user trigger management and token filtering.

use super::cache::TriggerCache;
use crate::db::TriggerStore;
use crate::error::{CoreError, CoreResult};
use crate::hub::{PriceHub, TokenStream};
use crate::types::{Ticker, Token, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Serve trigger lookups from the per-user cache
    pub cache_enabled: bool,
    /// Capacity of each filtered output channel
    pub output_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            output_buffer: 16,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> CoreResult<Self> {
        let defaults = Self::default();
        let config = Self {
            cache_enabled: crate::hub::config::parse_env(
                "TRIGGER_CACHE_ENABLED",
                defaults.cache_enabled,
            )?,
            output_buffer: crate::hub::config::parse_env(
                "TRIGGER_OUTPUT_BUFFER",
                defaults.output_buffer,
            )?,
        };
        if config.output_buffer == 0 {
            return Err(CoreError::InvalidArgument(
                "TRIGGER_OUTPUT_BUFFER must be > 0".into(),
            ));
        }
        Ok(config)
    }
}

#[derive(Clone)]
pub struct TriggerRouter {
    hub: Arc<PriceHub>,
    store: Arc<dyn TriggerStore>,
    cache: Option<Arc<TriggerCache>>,
    config: RouterConfig,
}

impl TriggerRouter {
    pub fn new(hub: Arc<PriceHub>, store: Arc<dyn TriggerStore>, config: RouterConfig) -> Self {
        let cache = config.cache_enabled.then(|| Arc::new(TriggerCache::new()));
        Self {
            hub,
            store,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> Option<&Arc<TriggerCache>> {
        self.cache.as_ref()
    }

    /// Start tracking `ticker` for `user_id`.
    ///
    /// The ticker is subscribed on the exchange and stored before the trigger
    /// is recorded. Adding an existing trigger succeeds without change.
    pub async fn add_trigger(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<()> {
        self.ensure_tracked(ticker).await?;
        let result = self.store.add(user_id, ticker).await;
        self.invalidate(user_id);
        result?;
        info!("Added trigger {} for user {}", ticker, user_id);
        Ok(())
    }

    /// Stop tracking `ticker` for `user_id`. Fails with `NotFound` if the
    /// trigger does not exist.
    pub async fn remove_trigger(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<()> {
        self.ensure_tracked(ticker).await?;
        let result = self.store.remove(user_id, ticker).await;
        self.invalidate(user_id);
        result?;
        info!("Removed trigger {} for user {}", ticker, user_id);
        Ok(())
    }

    /// Stream of tokens whose ticker `user_id` currently tracks.
    ///
    /// Trigger changes take effect for tokens dispatched after the change
    /// returns. The user's cached trigger set lives as long as one of their
    /// streams is open. Must be called within a tokio runtime.
    pub fn subscribe(&self, user_id: UserId, cancel: CancellationToken) -> TokenStream {
        let cancel = cancel.child_token();
        let prices = self.hub.subscribe(cancel.clone());
        let id = prices.id();
        let (tx, rx) = mpsc::channel(self.config.output_buffer.max(1));

        if let Some(cache) = &self.cache {
            cache.retain(user_id);
        }
        let router = self.clone();
        tokio::spawn(router.filter(user_id, prices, tx, cancel.clone()));
        debug!("User {} subscribed (hub subscription {})", user_id, id);

        TokenStream::new(id, rx, cancel)
    }

    async fn ensure_tracked(&self, ticker: &Ticker) -> CoreResult<()> {
        self.hub.add_ticker(ticker).await.map(|_| ()).map_err(|e| {
            warn!("Failed to track {}: {}", ticker, e);
            CoreError::internal(format!("failed to track {}: {}", ticker, e))
        })
    }

    fn invalidate(&self, user_id: UserId) {
        if let Some(cache) = &self.cache {
            cache.invalidate(user_id);
        }
    }

    async fn is_tracked(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<bool> {
        match &self.cache {
            Some(cache) => cache.contains(self.store.as_ref(), user_id, ticker).await,
            None => self.store.exists(user_id, ticker).await,
        }
    }

    async fn filter(
        self,
        user_id: UserId,
        mut prices: TokenStream,
        tx: mpsc::Sender<Token>,
        cancel: CancellationToken,
    ) {
        loop {
            let token = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                next = prices.recv() => match next {
                    Some(token) => token,
                    None => break,
                },
            };

            let tracked = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                tracked = self.is_tracked(user_id, &token.ticker) => tracked,
            };
            match tracked {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("Trigger lookup failed for user {} on {}: {}", user_id, token.ticker, e);
                    continue;
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = tx.send(token) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(cache) = &self.cache {
            cache.release(user_id);
        }
        // Releases the hub subscription even when only the output was dropped
        prices.cancel();
        debug!("Trigger stream for user {} closed", user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert!(config.cache_enabled);
        assert_eq!(config.output_buffer, 16);
    }
}
