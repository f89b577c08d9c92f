//! Redis pub/sub subscription that survives connection loss.
//!
//! A background task owns the connection. When the server closes it or it
//! cannot be opened, the task waits out the backoff, reconnects and
//! subscribes to the same channels again. Messages published while no
//! connection is open are lost.

use crate::clients::reconnect::{ReconnectConfig, ReconnectStats};
use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use redis::{aio::PubSub, Client};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MESSAGE_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Clone)]
pub struct ReconnectingPubSub {
    client: Client,
    channels: Vec<String>,
    config: ReconnectConfig,
    stats: Arc<ReconnectStats>,
}

impl ReconnectingPubSub {
    pub fn new(client: Client, channels: Vec<String>, config: ReconnectConfig) -> Self {
        Self {
            client,
            channels,
            config,
            stats: Arc::new(ReconnectStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ReconnectStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the connection task. The stream ends once `cancel` fires or the
    /// stream is dropped. Must be called within a tokio runtime.
    pub fn into_stream(self, cancel: CancellationToken) -> PubSubStream {
        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        tokio::spawn(self.pump(tx, cancel));
        PubSubStream { rx }
    }

    async fn connect(&self) -> Result<PubSub> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .context("Failed to open Redis pub/sub connection")?;
        let mut pubsub = conn.into_pubsub();
        for channel in &self.channels {
            pubsub
                .subscribe(channel)
                .await
                .with_context(|| format!("Failed to subscribe to {}", channel))?;
        }
        Ok(pubsub)
    }

    async fn pump(self, tx: mpsc::Sender<PubSubMessage>, cancel: CancellationToken) {
        let mut backoff = self.config.backoff();

        loop {
            self.stats.record_attempt();
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                connected = self.connect() => connected,
            };

            let mut pubsub = match connected {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    self.stats.record_failure();
                    let delay = backoff.next_delay();
                    warn!(
                        "Redis pub/sub connect attempt {} failed: {:#}. Retrying in {:?}",
                        backoff.attempt(),
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            let connections = self.stats.record_success();
            backoff = self.config.backoff();
            if connections == 1 {
                info!("Subscribed to {:?}", self.channels);
            } else {
                info!("Resubscribed to {:?} after connection loss", self.channels);
            }

            let mut messages = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tx.closed() => return,
                    msg = messages.next() => msg,
                };
                let msg = match msg {
                    Some(msg) => msg,
                    None => break,
                };

                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Unreadable payload on {}: {}", msg.get_channel_name(), e);
                        continue;
                    }
                };
                let message = PubSubMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            warn!("Redis pub/sub connection to {:?} lost, reconnecting", self.channels);
        }
        debug!("Redis pub/sub task for {:?} stopped", self.channels);
    }
}

/// Messages from every subscribed channel, in arrival order.
pub struct PubSubStream {
    rx: mpsc::Receiver<PubSubMessage>,
}

impl Stream for PubSubStream {
    type Item = PubSubMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
