//! In-memory stores for tests and local runs.

use super::{PriceStore, TriggerStore};
use crate::error::{CoreError, CoreResult};
use crate::types::{Ticker, UserId};
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tracked tickers with their last known price.
#[derive(Default)]
pub struct InMemoryPriceStore {
    prices: RwLock<BTreeMap<Ticker, Option<f64>>>,
}

impl InMemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, ticker: &Ticker) -> bool {
        self.prices.read().contains_key(ticker)
    }
}

#[async_trait]
impl PriceStore for InMemoryPriceStore {
    async fn upsert(&self, ticker: &Ticker) -> CoreResult<bool> {
        let mut prices = self.prices.write();
        if prices.contains_key(ticker) {
            return Ok(false);
        }
        prices.insert(ticker.clone(), None);
        Ok(true)
    }

    async fn set_price(&self, ticker: &Ticker, price: f64) -> CoreResult<()> {
        match self.prices.write().get_mut(ticker) {
            Some(slot) => {
                *slot = Some(price);
                Ok(())
            }
            None => Err(CoreError::not_found(format!("ticker {}", ticker))),
        }
    }

    async fn list_tickers(&self) -> CoreResult<Vec<Ticker>> {
        Ok(self.prices.read().keys().cloned().collect())
    }

    async fn get_price(&self, ticker: &Ticker) -> CoreResult<Option<f64>> {
        self.prices
            .read()
            .get(ticker)
            .copied()
            .ok_or_else(|| CoreError::not_found(format!("ticker {}", ticker)))
    }
}

/// Trigger records keyed by user.
///
/// When linked to a price store, adding a trigger for an untracked ticker
/// fails with `FailedPrecondition`, mirroring the foreign key in Postgres.
#[derive(Default)]
pub struct InMemoryTriggerStore {
    triggers: RwLock<FxHashMap<UserId, BTreeSet<Ticker>>>,
    prices: Option<Arc<InMemoryPriceStore>>,
    lookups: AtomicU64,
}

impl InMemoryTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price_store(prices: Arc<InMemoryPriceStore>) -> Self {
        Self {
            prices: Some(prices),
            ..Self::default()
        }
    }

    /// Number of `exists` / `list_for_user` calls served so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TriggerStore for InMemoryTriggerStore {
    async fn add(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<()> {
        if let Some(prices) = &self.prices {
            if !prices.contains(ticker) {
                return Err(CoreError::FailedPrecondition(format!(
                    "ticker {} is not tracked",
                    ticker
                )));
            }
        }
        self.triggers
            .write()
            .entry(user_id)
            .or_default()
            .insert(ticker.clone());
        Ok(())
    }

    async fn remove(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<()> {
        let mut triggers = self.triggers.write();
        let removed = match triggers.get_mut(&user_id) {
            Some(set) => {
                let removed = set.remove(ticker);
                if set.is_empty() {
                    triggers.remove(&user_id);
                }
                removed
            }
            None => false,
        };

        if removed {
            Ok(())
        } else {
            Err(CoreError::not_found(format!(
                "trigger ({}, {})",
                user_id, ticker
            )))
        }
    }

    async fn exists(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<bool> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .triggers
            .read()
            .get(&user_id)
            .map(|set| set.contains(ticker))
            .unwrap_or(false))
    }

    async fn list_for_user(&self, user_id: UserId) -> CoreResult<Vec<Ticker>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .triggers
            .read()
            .get(&user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Ticker {
        Ticker::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_reports_new_once() {
        let store = InMemoryPriceStore::new();
        assert!(store.upsert(&t("BTC")).await.unwrap());
        assert!(!store.upsert(&t("BTC")).await.unwrap());
        assert_eq!(store.list_tickers().await.unwrap(), vec![t("BTC")]);
    }

    #[tokio::test]
    async fn test_set_price_unknown_ticker() {
        let store = InMemoryPriceStore::new();
        let err = store.set_price(&t("DOGE"), 0.1).await.unwrap_err();
        assert!(err.is_not_found());

        store.upsert(&t("DOGE")).await.unwrap();
        assert_eq!(store.get_price(&t("DOGE")).await.unwrap(), None);
        store.set_price(&t("DOGE"), 0.1).await.unwrap();
        assert_eq!(store.get_price(&t("DOGE")).await.unwrap(), Some(0.1));
    }

    #[tokio::test]
    async fn test_trigger_add_remove() {
        let store = InMemoryTriggerStore::new();
        store.add(7, &t("ETH")).await.unwrap();
        store.add(7, &t("ETH")).await.unwrap();

        assert!(store.exists(7, &t("ETH")).await.unwrap());
        assert!(!store.exists(7, &t("BTC")).await.unwrap());
        assert_eq!(store.list_for_user(7).await.unwrap(), vec![t("ETH")]);

        store.remove(7, &t("ETH")).await.unwrap();
        assert!(store.remove(7, &t("ETH")).await.unwrap_err().is_not_found());
        assert!(store.list_for_user(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_requires_tracked_ticker() {
        let prices = Arc::new(InMemoryPriceStore::new());
        let store = InMemoryTriggerStore::with_price_store(prices.clone());

        let err = store.add(1, &t("SOL")).await.unwrap_err();
        assert!(matches!(err, CoreError::FailedPrecondition(_)));

        prices.upsert(&t("SOL")).await.unwrap();
        store.add(1, &t("SOL")).await.unwrap();
    }
}
