//! Live subscriber set.
//!
//! Broadcast offers tokens to every mailbox under the read lock without
//! awaiting. Mailboxes that are full under the `Block` policy are collected
//! and waited on only after the lock is released, so `register` and
//! `unregister` never wait behind a slow consumer.

use super::mailbox::{Mailbox, PushOutcome};
use crate::types::Token;
use futures_util::future::join_all;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub type SubscriptionId = u64;

/// Per-broadcast delivery counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub queued: u64,
    pub displaced: u64,
    /// Tokens offered to a subscriber that was closed mid-broadcast
    pub closed: u64,
}

impl BroadcastReport {
    fn record(&mut self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Queued => self.queued += 1,
            PushOutcome::Displaced => self.displaced += 1,
            PushOutcome::Closed => self.closed += 1,
        }
    }
}

struct PendingDelivery {
    mailbox: Arc<Mailbox>,
    tokens: Vec<Token>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscribers: RwLock<FxHashMap<SubscriptionId, Arc<Mailbox>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mailbox. It sees every broadcast that starts after this returns.
    pub fn register(&self, mailbox: Arc<Mailbox>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers.write().insert(id, mailbox);
        debug!("Registered subscriber {}", id);
        id
    }

    /// Remove and close a mailbox. Returns `false` if `id` was not registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let removed = self.subscribers.write().remove(&id);
        match removed {
            Some(mailbox) => {
                mailbox.close();
                debug!("Unregistered subscriber {}", id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscribers.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Deliver `tokens`, in order, to every registered subscriber.
    pub async fn broadcast(&self, tokens: &[Token]) -> BroadcastReport {
        if tokens.is_empty() {
            return BroadcastReport::default();
        }

        let (mut report, pending) = self.offer(tokens);
        if pending.is_empty() {
            return report;
        }

        let outcomes = join_all(pending.into_iter().map(|delivery| async move {
            let mut outcomes = Vec::with_capacity(delivery.tokens.len());
            for token in delivery.tokens {
                let outcome = delivery.mailbox.push(token).await;
                outcomes.push(outcome);
                if outcome == PushOutcome::Closed {
                    break;
                }
            }
            outcomes
        }))
        .await;

        for outcome in outcomes.into_iter().flatten() {
            report.record(outcome);
        }
        report
    }

    fn offer(&self, tokens: &[Token]) -> (BroadcastReport, Vec<PendingDelivery>) {
        let mut report = BroadcastReport::default();
        let mut pending = Vec::new();

        let subscribers = self.subscribers.read();
        for mailbox in subscribers.values() {
            for (i, token) in tokens.iter().enumerate() {
                match mailbox.try_push(token.clone()) {
                    Ok(outcome) => report.record(outcome),
                    Err(_) => {
                        pending.push(PendingDelivery {
                            mailbox: Arc::clone(mailbox),
                            tokens: tokens[i..].to_vec(),
                        });
                        break;
                    }
                }
            }
        }

        (report, pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::config::OverflowPolicy;
    use crate::types::Ticker;
    use std::time::Duration;

    fn tokens(prices: &[f64]) -> Vec<Token> {
        prices
            .iter()
            .map(|p| Token::new(Ticker::parse("ETH").unwrap(), *p))
            .collect()
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = SubscriptionRegistry::new();
        let mailbox = Arc::new(Mailbox::new(4, OverflowPolicy::DropOldest));

        let id = registry.register(mailbox.clone());
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
        assert!(mailbox.is_closed());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let registry = SubscriptionRegistry::new();
        let a = registry.register(Arc::new(Mailbox::new(1, OverflowPolicy::DropOldest)));
        let b = registry.register(Arc::new(Mailbox::new(1, OverflowPolicy::DropOldest)));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber_in_order() {
        let registry = SubscriptionRegistry::new();
        let first = Arc::new(Mailbox::new(8, OverflowPolicy::DropOldest));
        let second = Arc::new(Mailbox::new(8, OverflowPolicy::DropOldest));
        registry.register(first.clone());
        registry.register(second.clone());

        let report = registry.broadcast(&tokens(&[1.0, 2.0, 3.0])).await;
        assert_eq!(report.queued, 6);

        for mailbox in [first, second] {
            assert_eq!(mailbox.pop().await.unwrap().price, 1.0);
            assert_eq!(mailbox.pop().await.unwrap().price, 2.0);
            assert_eq!(mailbox.pop().await.unwrap().price, 3.0);
        }
    }

    #[tokio::test]
    async fn test_unregistered_mailbox_receives_nothing() {
        let registry = SubscriptionRegistry::new();
        let mailbox = Arc::new(Mailbox::new(8, OverflowPolicy::DropOldest));
        let id = registry.register(mailbox.clone());
        registry.unregister(id);

        let report = registry.broadcast(&tokens(&[1.0])).await;
        assert_eq!(report, BroadcastReport::default());
        assert!(mailbox.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_blocked_broadcast_releases_lock() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let stuck = Arc::new(Mailbox::new(1, OverflowPolicy::Block));
        let stuck_id = registry.register(stuck.clone());

        let broadcast = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.broadcast(&tokens(&[1.0, 2.0])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!broadcast.is_finished());

        // The write lock is free while the broadcast waits
        let other = registry.register(Arc::new(Mailbox::new(1, OverflowPolicy::Block)));
        assert!(registry.contains(other));

        registry.unregister(stuck_id);
        let report = tokio::time::timeout(Duration::from_secs(1), broadcast)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.queued, 1);
        assert_eq!(report.closed, 1);
    }
}
