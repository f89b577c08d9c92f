//! Republishes every hub token on Redis.

use cryptowatch_rust_core::redis::{publish_json, token_channel, Publisher, TokenMessage};
use cryptowatch_rust_core::{CancellationToken, PriceHub};
use std::sync::Arc;
use tracing::{info, warn};

pub struct TokenBridge {
    hub: Arc<PriceHub>,
    publisher: Arc<dyn Publisher>,
    prefix: String,
}

impl TokenBridge {
    pub fn new(hub: Arc<PriceHub>, publisher: Arc<dyn Publisher>, prefix: impl Into<String>) -> Self {
        Self {
            hub,
            publisher,
            prefix: prefix.into(),
        }
    }

    /// Publish tokens to `<prefix>.<TICKER>` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tokens = self.hub.subscribe(cancel);
        info!("Token bridge publishing to {}.<TICKER>", self.prefix);

        let mut published = 0u64;
        let mut failed = 0u64;
        while let Some(token) = tokens.recv().await {
            let channel = token_channel(&self.prefix, &token.ticker);
            let message = TokenMessage::from_token(&token);
            match publish_json(self.publisher.as_ref(), &channel, &message).await {
                Ok(()) => published += 1,
                Err(e) => {
                    failed += 1;
                    warn!("Failed to publish {} token: {:#}", token.ticker, e);
                }
            }
        }

        info!(
            "Token bridge stopped ({} published, {} failed)",
            published, failed
        );
    }
}
