//! Per-user trigger set cache.
//!
//! Entries are filled lazily from `TriggerStore::list_for_user` and dropped
//! whenever that user's triggers change or their last open trigger stream
//! is released. A load that overlaps an invalidation is returned to its
//! caller but never cached.

use crate::db::TriggerStore;
use crate::error::CoreResult;
use crate::types::{Ticker, UserId};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type TriggerSet = Arc<FxHashSet<Ticker>>;

#[derive(Default)]
pub struct TriggerCache {
    entries: RwLock<FxHashMap<UserId, TriggerSet>>,
    generation: AtomicU64,
    /// Open trigger streams per user
    streams: Mutex<FxHashMap<UserId, usize>>,
}

impl TriggerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(
        &self,
        store: &dyn TriggerStore,
        user_id: UserId,
        ticker: &Ticker,
    ) -> CoreResult<bool> {
        let cached = self.entries.read().get(&user_id).cloned();
        let set = match cached {
            Some(set) => set,
            None => self.load(store, user_id).await?,
        };
        Ok(set.contains(ticker))
    }

    async fn load(&self, store: &dyn TriggerStore, user_id: UserId) -> CoreResult<TriggerSet> {
        let generation = self.generation.load(Ordering::Acquire);
        let tickers = store.list_for_user(user_id).await?;
        let set: TriggerSet = Arc::new(tickers.into_iter().collect());

        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) == generation {
            entries.insert(user_id, Arc::clone(&set));
        }
        Ok(set)
    }

    /// Forget the cached set for `user_id`. Call after the store changed.
    pub fn invalidate(&self, user_id: UserId) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.write().remove(&user_id);
    }

    /// Record an open trigger stream for `user_id`.
    pub fn retain(&self, user_id: UserId) {
        *self.streams.lock().entry(user_id).or_insert(0) += 1;
    }

    /// Release a stream recorded by `retain`. Evicts the user's set when no
    /// stream for them remains.
    pub fn release(&self, user_id: UserId) {
        let mut streams = self.streams.lock();
        let last = match streams.get_mut(&user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                streams.remove(&user_id);
                true
            }
            None => false,
        };
        // Lock order: streams, then entries
        if last {
            self.invalidate(user_id);
        }
    }

    pub fn open_streams(&self, user_id: UserId) -> usize {
        self.streams.lock().get(&user_id).copied().unwrap_or(0)
    }

    pub fn is_cached(&self, user_id: UserId) -> bool {
        self.entries.read().contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryTriggerStore;

    fn t(s: &str) -> Ticker {
        Ticker::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_loads_once_per_user() {
        let store = InMemoryTriggerStore::new();
        store.add(7, &t("ETH")).await.unwrap();
        let cache = TriggerCache::new();

        assert!(cache.contains(&store, 7, &t("ETH")).await.unwrap());
        assert!(!cache.contains(&store, 7, &t("BTC")).await.unwrap());
        assert!(cache.contains(&store, 7, &t("ETH")).await.unwrap());
        assert_eq!(store.lookups(), 1);
        assert!(cache.is_cached(7));
    }

    #[tokio::test]
    async fn test_invalidate_reloads() {
        let store = InMemoryTriggerStore::new();
        let cache = TriggerCache::new();

        assert!(!cache.contains(&store, 7, &t("BTC")).await.unwrap());
        store.add(7, &t("BTC")).await.unwrap();
        cache.invalidate(7);
        assert!(!cache.is_cached(7));

        assert!(cache.contains(&store, 7, &t("BTC")).await.unwrap());
        assert_eq!(store.lookups(), 2);
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let store = InMemoryTriggerStore::new();
        store.add(1, &t("BTC")).await.unwrap();
        let cache = TriggerCache::new();

        assert!(cache.contains(&store, 1, &t("BTC")).await.unwrap());
        assert!(!cache.contains(&store, 2, &t("BTC")).await.unwrap());
        assert_eq!(cache.len(), 2);

        cache.invalidate(2);
        assert!(cache.is_cached(1));
    }

    #[tokio::test]
    async fn test_last_release_evicts() {
        let store = InMemoryTriggerStore::new();
        store.add(7, &t("ETH")).await.unwrap();
        let cache = TriggerCache::new();

        cache.retain(7);
        cache.retain(7);
        assert!(cache.contains(&store, 7, &t("ETH")).await.unwrap());

        cache.release(7);
        assert!(cache.is_cached(7));
        assert_eq!(cache.open_streams(7), 1);

        cache.release(7);
        assert!(!cache.is_cached(7));
        assert_eq!(cache.open_streams(7), 0);
        assert!(cache.is_empty());

        // Unbalanced release is ignored
        cache.release(7);
        assert_eq!(cache.open_streams(7), 0);
    }
}
