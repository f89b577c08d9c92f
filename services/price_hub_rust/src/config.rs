//! Configuration for price_hub_rust

use anyhow::{anyhow, Context, Result};
use cryptowatch_rust_core::clients::{FeedConfig, ReconnectConfig};
use cryptowatch_rust_core::db::health::PoolHealthConfig;
use cryptowatch_rust_core::db::DbPoolConfig;
use cryptowatch_rust_core::{HubConfig, RouterConfig};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,
    pub db_pool: DbPoolConfig,
    pub pool_health: PoolHealthConfig,

    // Redis
    pub redis_url: String,
    pub token_channel_prefix: String,
    /// Backoff for the command subscription (`REDIS_RECONNECT_*`)
    pub redis_reconnect: ReconnectConfig,
    /// Listen for trigger commands on `<prefix>.commands`
    pub commands_enabled: bool,

    // Core components
    pub feed: FeedConfig,
    pub hub: HubConfig,
    pub router: RouterConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow!("DATABASE_URL must be set"))?;

        let feed = FeedConfig::from_env();
        if feed.api_key.is_empty() {
            return Err(anyhow!("CRYPTOCOMPARE_API_KEY must be set"));
        }

        let token_channel_prefix = env::var("TOKEN_CHANNEL_PREFIX")
            .unwrap_or_else(|_| "prices".to_string());
        validate_prefix(&token_channel_prefix)?;

        Ok(Self {
            database_url,
            db_pool: DbPoolConfig::from_env(),
            pool_health: PoolHealthConfig::from_env(),

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            token_channel_prefix,
            redis_reconnect: ReconnectConfig::from_env_prefixed("REDIS_RECONNECT"),
            commands_enabled: env::var("TRIGGER_COMMANDS_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .to_lowercase()
                .parse()
                .context("TRIGGER_COMMANDS_ENABLED must be true or false")?,

            feed,
            hub: HubConfig::from_env()?,
            router: RouterConfig::from_env()?,
        })
    }

    pub fn commands_channel(&self) -> String {
        format!("{}.commands", self.token_channel_prefix)
    }
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(anyhow!("TOKEN_CHANNEL_PREFIX must not be empty"));
    }
    if prefix.contains(char::is_whitespace) || prefix.ends_with('.') {
        return Err(anyhow!(
            "TOKEN_CHANNEL_PREFIX {:?} must not contain whitespace or end with '.'",
            prefix
        ));
    }
    Ok(())
}
