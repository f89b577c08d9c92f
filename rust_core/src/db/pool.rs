//! Postgres pool for the price and trigger stores.

use crate::error::{CoreError, CoreResult};
use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Debug)]
pub struct DbPoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// Create the `tokens` and `triggers` tables if missing
    pub bootstrap_schema: bool,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            bootstrap_schema: true,
        }
    }
}

impl DbPoolConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |var: &str, default: Duration| {
            Duration::from_secs(env_or(var, default.as_secs()))
        };
        Self {
            max_connections: env_or("DB_POOL_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: env_or("DB_POOL_MIN_CONNECTIONS", defaults.min_connections),
            acquire_timeout: secs("DB_POOL_ACQUIRE_TIMEOUT_SECS", defaults.acquire_timeout),
            idle_timeout: secs("DB_POOL_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            max_lifetime: secs("DB_POOL_MAX_LIFETIME_SECS", defaults.max_lifetime),
            bootstrap_schema: env_or("DB_BOOTSTRAP_SCHEMA", defaults.bootstrap_schema),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.max_connections == 0 {
            return Err(CoreError::InvalidArgument(
                "DB_POOL_MAX_CONNECTIONS must be > 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(CoreError::InvalidArgument(format!(
                "DB_POOL_MIN_CONNECTIONS ({}) exceeds DB_POOL_MAX_CONNECTIONS ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().to_lowercase().parse().ok())
        .unwrap_or(default)
}

/// Connect the pool and, if configured, create missing tables.
pub async fn create_pool(database_url: &str, config: &DbPoolConfig) -> Result<PgPool> {
    config.validate()?;

    let connect_opts =
        PgConnectOptions::from_str(database_url).context("Failed to parse DATABASE_URL")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect_with(connect_opts)
        .await
        .context("Failed to connect to price database")?;
    info!(
        "Price database connected (pool {}..{})",
        config.min_connections, config.max_connections
    );

    if config.bootstrap_schema {
        super::schema::ensure_schema(&pool).await?;
    }
    Ok(pool)
}
