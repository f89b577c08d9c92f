//! Trigger commands received over Redis.
//!
//! Front ends publish JSON commands on `<prefix>.commands`:
//!
//! ```json
//! {"action": "add", "user_id": 7, "ticker": "ETH"}
//! {"action": "remove", "user_id": 7, "ticker": "ETH"}
//! {"action": "watch", "user_id": 7}
//! {"action": "unwatch", "user_id": 7}
//! ```
//!
//! A watched user's filtered tokens are published on `<prefix>.user.<id>`,
//! and every command is answered on `<prefix>.replies`.

use anyhow::{Context, Result};
use cryptowatch_rust_core::redis::{publish_json, PubSubMessage, Publisher, TokenMessage};
use cryptowatch_rust_core::{
    CancellationToken, CoreError, CoreResult, Ticker, TriggerRouter, UserId,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TriggerCommand {
    Add { user_id: UserId, ticker: String },
    Remove { user_id: UserId, ticker: String },
    Watch { user_id: UserId },
    Unwatch { user_id: UserId },
}

impl TriggerCommand {
    pub fn user_id(&self) -> UserId {
        match self {
            Self::Add { user_id, .. }
            | Self::Remove { user_id, .. }
            | Self::Watch { user_id }
            | Self::Unwatch { user_id } => *user_id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
            Self::Watch { .. } => "watch",
            Self::Unwatch { .. } => "unwatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReply {
    pub user_id: UserId,
    pub action: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    pub fn new(command: &TriggerCommand, result: &CoreResult<()>) -> Self {
        Self {
            user_id: command.user_id(),
            action: command.action(),
            ok: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        }
    }
}

pub fn parse_command(payload: &str) -> Result<TriggerCommand> {
    serde_json::from_str(payload).context("Invalid trigger command")
}

pub fn user_channel(prefix: &str, user_id: UserId) -> String {
    format!("{}.user.{}", prefix, user_id)
}

pub fn replies_channel(prefix: &str) -> String {
    format!("{}.replies", prefix)
}

pub struct CommandListener {
    router: TriggerRouter,
    publisher: Arc<dyn Publisher>,
    prefix: String,
    watches: HashMap<UserId, CancellationToken>,
}

impl CommandListener {
    pub fn new(
        router: TriggerRouter,
        publisher: Arc<dyn Publisher>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            router,
            publisher,
            prefix: prefix.into(),
            watches: HashMap::new(),
        }
    }

    /// Serve commands from `messages` until `cancel` fires or the stream
    /// ends. Open watches are closed on exit.
    pub async fn run<S>(mut self, mut messages: S, cancel: CancellationToken)
    where
        S: Stream<Item = PubSubMessage> + Unpin,
    {
        info!("Listening for trigger commands");
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = messages.next() => match msg {
                    Some(msg) => msg,
                    None => {
                        warn!("Command stream ended");
                        break;
                    }
                },
            };
            self.process(&msg.payload, &cancel).await;
        }

        self.close_watches();
        info!("Command listener stopped");
    }

    /// Parse, execute and answer one raw command. Unparseable payloads are
    /// logged and get no reply.
    pub async fn process(
        &mut self,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Option<CommandReply> {
        let command = match parse_command(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("{:#}: {}", e, payload);
                return None;
            }
        };

        let result = self.handle(&command, cancel).await;
        let reply = CommandReply::new(&command, &result);
        if let Some(error) = &reply.error {
            warn!("{} for user {} failed: {}", reply.action, reply.user_id, error);
        }

        let channel = replies_channel(&self.prefix);
        if let Err(e) = publish_json(self.publisher.as_ref(), &channel, &reply).await {
            warn!("Failed to publish reply: {:#}", e);
        }
        Some(reply)
    }

    pub async fn handle(
        &mut self,
        command: &TriggerCommand,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        match command {
            TriggerCommand::Add { user_id, ticker } => {
                let ticker = Ticker::parse(ticker)?;
                self.router.add_trigger(*user_id, &ticker).await
            }
            TriggerCommand::Remove { user_id, ticker } => {
                let ticker = Ticker::parse(ticker)?;
                self.router.remove_trigger(*user_id, &ticker).await
            }
            TriggerCommand::Watch { user_id } => {
                self.watch(*user_id, cancel);
                Ok(())
            }
            TriggerCommand::Unwatch { user_id } => match self.watches.remove(user_id) {
                Some(watch) => {
                    watch.cancel();
                    Ok(())
                }
                None => Err(CoreError::not_found(format!("user {} is not watched", user_id))),
            },
        }
    }

    pub fn is_watching(&self, user_id: UserId) -> bool {
        self.watches
            .get(&user_id)
            .map_or(false, |watch| !watch.is_cancelled())
    }

    /// Repeated watches of the same user keep the existing stream.
    fn watch(&mut self, user_id: UserId, cancel: &CancellationToken) {
        if self.is_watching(user_id) {
            return;
        }

        let token = cancel.child_token();
        let mut stream = self.router.subscribe(user_id, token.clone());
        let publisher = Arc::clone(&self.publisher);
        let channel = user_channel(&self.prefix, user_id);
        self.watches.insert(user_id, token);

        tokio::spawn(async move {
            debug!("Publishing user {} tokens to {}", user_id, channel);
            while let Some(token) = stream.recv().await {
                let message = TokenMessage::from_token(&token);
                if let Err(e) = publish_json(publisher.as_ref(), &channel, &message).await {
                    warn!("Failed to publish to {}: {:#}", channel, e);
                }
            }
            debug!("Stopped publishing to {}", channel);
        });
    }

    fn close_watches(&mut self) {
        for (_, watch) in self.watches.drain() {
            watch.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add_command() {
        let cmd = parse_command(r#"{"action":"add","user_id":7,"ticker":"eth"}"#).unwrap();
        assert_eq!(
            cmd,
            TriggerCommand::Add {
                user_id: 7,
                ticker: "eth".to_string()
            }
        );
        assert_eq!(cmd.user_id(), 7);
        assert_eq!(cmd.action(), "add");
    }

    #[test]
    fn test_parse_watch_command() {
        let cmd = parse_command(r#"{"action":"watch","user_id":3}"#).unwrap();
        assert_eq!(cmd, TriggerCommand::Watch { user_id: 3 });
    }

    #[test]
    fn test_reject_unknown_action() {
        assert!(parse_command(r#"{"action":"sell","user_id":3}"#).is_err());
        assert!(parse_command(r#"{"action":"add","user_id":-1,"ticker":"BTC"}"#).is_err());
        assert!(parse_command("not json").is_err());
    }

    #[test]
    fn test_user_channel() {
        assert_eq!(user_channel("prices", 42), "prices.user.42");
    }

    #[test]
    fn test_reply_json() {
        let command = TriggerCommand::Remove {
            user_id: 7,
            ticker: "ETH".to_string(),
        };
        let reply = CommandReply::new(
            &command,
            &Err(CoreError::not_found("trigger (7, ETH)")),
        );
        assert_eq!(reply.error.as_deref(), Some("not found: trigger (7, ETH)"));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["action"], "remove");

        let ok = CommandReply {
            error: None,
            ok: true,
            ..reply
        };
        assert!(serde_json::to_value(&ok).unwrap().get("error").is_none());
    }
}
