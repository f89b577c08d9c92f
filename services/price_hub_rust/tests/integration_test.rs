//! Command listener and token bridge against an in-memory hub.

use async_trait::async_trait;
use cryptowatch_rust_core::clients::Exchange;
use cryptowatch_rust_core::db::{InMemoryPriceStore, InMemoryTriggerStore};
use cryptowatch_rust_core::redis::{PubSubMessage, Publisher};
use cryptowatch_rust_core::{
    CancellationToken, CoreResult, HubConfig, PriceHub, PriceUpdate, RouterConfig, Ticker,
    TriggerRouter,
};
use parking_lot::Mutex;
use price_hub_rust::bridge::TokenBridge;
use price_hub_rust::commands::CommandListener;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const PREFIX: &str = "prices";
const WAIT: Duration = Duration::from_secs(2);

fn ticker(s: &str) -> Ticker {
    Ticker::parse(s).unwrap()
}

#[derive(Default)]
struct LoopbackExchange {
    sender: Mutex<Option<mpsc::Sender<PriceUpdate>>>,
    subscribed: Mutex<Vec<Ticker>>,
}

#[async_trait]
impl Exchange for LoopbackExchange {
    fn name(&self) -> &str {
        "loopback"
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
        self.subscribed.lock().extend_from_slice(tickers);
        Ok(())
    }

    async fn get_prices(&self, _tickers: &[Ticker]) -> CoreResult<HashMap<Ticker, f64>> {
        Ok(HashMap::new())
    }
}

/// Keeps every published message instead of sending it anywhere.
#[derive(Default)]
struct RecordingPublisher {
    messages: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish_payload(&self, channel: &str, payload: String) -> anyhow::Result<()> {
        self.messages.lock().push((channel.to_string(), payload));
        Ok(())
    }
}

impl RecordingPublisher {
    fn on(&self, channel: &str) -> Vec<Value> {
        self.messages
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| serde_json::from_str(payload).unwrap())
            .collect()
    }

    /// Wait until `channel` has received `count` messages.
    async fn wait_for(&self, channel: &str, count: usize) -> Vec<Value> {
        tokio::time::timeout(WAIT, async {
            loop {
                let messages = self.on(channel);
                if messages.len() >= count {
                    return messages;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages never published")
    }

    fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

struct Fixture {
    exchange: Arc<LoopbackExchange>,
    hub: Arc<PriceHub>,
    router: TriggerRouter,
    publisher: Arc<RecordingPublisher>,
    cancel: CancellationToken,
}

impl Fixture {
    async fn start() -> Self {
        let exchange = Arc::new(LoopbackExchange::default());
        let prices = Arc::new(InMemoryPriceStore::new());
        let triggers = Arc::new(InMemoryTriggerStore::with_price_store(prices.clone()));
        let config = HubConfig {
            seed_prices: false,
            ..HubConfig::default()
        };
        let hub = Arc::new(PriceHub::new(exchange.clone(), prices, config));
        let cancel = CancellationToken::new();
        hub.start(cancel.clone()).await.unwrap();
        let router = TriggerRouter::new(hub.clone(), triggers, RouterConfig::default());

        Self {
            exchange,
            hub,
            router,
            publisher: Arc::new(RecordingPublisher::default()),
            cancel,
        }
    }

    fn listener(&self) -> CommandListener {
        CommandListener::new(self.router.clone(), self.publisher.clone(), PREFIX)
    }

    async fn emit(&self, symbol: &str, price: f64) {
        let sender = self.exchange.sender.lock().clone().unwrap();
        sender
            .send(PriceUpdate::single(ticker(symbol), price))
            .await
            .unwrap();
    }

    async fn wait_for_subscribers(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.hub.registry().len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn test_add_command_tracks_ticker_and_replies() {
    let f = Fixture::start().await;
    let mut listener = f.listener();

    let reply = listener
        .process(r#"{"action":"add","user_id":7,"ticker":"eth"}"#, &f.cancel)
        .await
        .unwrap();
    assert!(reply.ok);
    assert_eq!(*f.exchange.subscribed.lock(), vec![ticker("ETH")]);

    let replies = f.publisher.on("prices.replies");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["user_id"], 7);
    assert_eq!(replies[0]["action"], "add");
    assert_eq!(replies[0]["ok"], true);
    assert!(replies[0].get("error").is_none());
}

#[tokio::test]
async fn test_failed_command_reply_carries_error() {
    let f = Fixture::start().await;
    let mut listener = f.listener();

    let reply = listener
        .process(r#"{"action":"add","user_id":7,"ticker":"BTC~USD"}"#, &f.cancel)
        .await
        .unwrap();
    assert!(!reply.ok);

    let reply = listener
        .process(r#"{"action":"remove","user_id":7,"ticker":"SOL"}"#, &f.cancel)
        .await
        .unwrap();
    assert!(!reply.ok);

    let replies = f.publisher.on("prices.replies");
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0]["ok"], false);
    assert!(replies[0]["error"].as_str().unwrap().starts_with("invalid argument"));
    assert_eq!(replies[1]["action"], "remove");
    assert!(replies[1]["error"].as_str().unwrap().starts_with("not found"));
}

#[tokio::test]
async fn test_unparseable_command_gets_no_reply() {
    let f = Fixture::start().await;
    let mut listener = f.listener();

    assert!(listener.process("not json", &f.cancel).await.is_none());
    assert!(listener
        .process(r#"{"action":"sell","user_id":1}"#, &f.cancel)
        .await
        .is_none());
    assert!(f.publisher.is_empty());
}

#[tokio::test]
async fn test_watch_publishes_only_tracked_tokens() {
    let f = Fixture::start().await;
    let mut listener = f.listener();
    listener
        .process(r#"{"action":"add","user_id":7,"ticker":"ETH"}"#, &f.cancel)
        .await
        .unwrap();
    listener
        .process(r#"{"action":"watch","user_id":7}"#, &f.cancel)
        .await
        .unwrap();
    f.wait_for_subscribers(1).await;

    f.emit("BTC", 100.0).await;
    f.emit("ETH", 2000.0).await;

    let tokens = f.publisher.wait_for("prices.user.7", 1).await;
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0]["ticker"], "ETH");
    assert_eq!(tokens[0]["price"], 2000.0);
}

#[tokio::test]
async fn test_repeated_watch_keeps_one_stream() {
    let f = Fixture::start().await;
    let mut listener = f.listener();

    for _ in 0..3 {
        let reply = listener
            .process(r#"{"action":"watch","user_id":4}"#, &f.cancel)
            .await
            .unwrap();
        assert!(reply.ok);
    }

    assert!(listener.is_watching(4));
    assert_eq!(f.hub.registry().len(), 1);
}

#[tokio::test]
async fn test_unwatch_closes_stream_and_rejects_unknown_user() {
    let f = Fixture::start().await;
    let mut listener = f.listener();
    listener
        .process(r#"{"action":"watch","user_id":4}"#, &f.cancel)
        .await
        .unwrap();
    f.wait_for_subscribers(1).await;

    let reply = listener
        .process(r#"{"action":"unwatch","user_id":4}"#, &f.cancel)
        .await
        .unwrap();
    assert!(reply.ok);
    assert!(!listener.is_watching(4));
    f.wait_for_subscribers(0).await;

    let reply = listener
        .process(r#"{"action":"unwatch","user_id":4}"#, &f.cancel)
        .await
        .unwrap();
    assert!(!reply.ok);
    assert!(reply.error.unwrap().starts_with("not found"));
}

#[tokio::test]
async fn test_run_closes_watches_when_stream_ends() {
    let f = Fixture::start().await;
    let commands = futures_util::stream::iter(vec![
        PubSubMessage {
            channel: "prices.commands".into(),
            payload: r#"{"action":"add","user_id":2,"ticker":"BTC"}"#.into(),
        },
        PubSubMessage {
            channel: "prices.commands".into(),
            payload: r#"{"action":"watch","user_id":2}"#.into(),
        },
    ]);

    tokio::time::timeout(WAIT, f.listener().run(commands, f.cancel.clone()))
        .await
        .unwrap();

    assert_eq!(f.publisher.on("prices.replies").len(), 2);
    f.wait_for_subscribers(0).await;
    assert!(!f.cancel.is_cancelled());
}

#[tokio::test]
async fn test_bridge_republishes_every_token() {
    let f = Fixture::start().await;
    let bridge = TokenBridge::new(f.hub.clone(), f.publisher.clone(), PREFIX);
    let task = tokio::spawn(bridge.run(f.cancel.child_token()));
    f.wait_for_subscribers(1).await;

    f.emit("BTC", 50000.0).await;
    f.emit("ETH", 3000.0).await;
    f.emit("BTC", 50001.0).await;

    let btc = f.publisher.wait_for("prices.BTC", 2).await;
    assert_eq!(btc[0]["price"], 50000.0);
    assert_eq!(btc[1]["price"], 50001.0);
    assert!(btc[0]["timestamp_ms"].as_i64().unwrap() > 0);

    let eth = f.publisher.wait_for("prices.ETH", 1).await;
    assert_eq!(eth[0]["ticker"], "ETH");

    f.cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}
