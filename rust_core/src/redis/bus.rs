use super::pubsub::ReconnectingPubSub;
use crate::clients::reconnect::ReconnectConfig;
use crate::types::{Ticker, Token};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};

/// Token as published to Redis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMessage {
    pub ticker: Ticker,
    pub price: f64,
    pub timestamp_ms: i64,
}

impl TokenMessage {
    pub fn from_token(token: &Token) -> Self {
        Self {
            ticker: token.ticker.clone(),
            price: token.price,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// `<prefix>.<TICKER>`, e.g. `prices.BTC`
pub fn token_channel(prefix: &str, ticker: &Ticker) -> String {
    format!("{}.{}", prefix, ticker)
}

/// Outbound side of the bus. Implemented by `RedisBus`; tests record
/// messages instead.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_payload(&self, channel: &str, payload: String) -> Result<()>;
}

/// Serialize `message` as JSON and publish it on `channel`.
pub async fn publish_json<T: Serialize + ?Sized>(
    publisher: &dyn Publisher,
    channel: &str,
    message: &T,
) -> Result<()> {
    let payload = serde_json::to_string(message).context("Failed to serialize message")?;
    publisher.publish_payload(channel, payload).await
}

#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    connection: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Invalid Redis URL")?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .context("Failed to connect to Redis")?;

        Ok(Self { client, connection })
    }

    /// Reconnecting subscription to `channels` on a dedicated connection
    pub fn subscribe(&self, channels: Vec<String>, config: ReconnectConfig) -> ReconnectingPubSub {
        ReconnectingPubSub::new(self.client.clone(), channels, config)
    }
}

#[async_trait]
impl Publisher for RedisBus {
    async fn publish_payload(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .with_context(|| format!("Failed to publish to {}", channel))?;
        Ok(())
    }
}
