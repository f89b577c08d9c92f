//! Price hub configuration

use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::str::FromStr;

/// What the dispatch loop does when a subscriber's mailbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Discard the oldest queued token and enqueue the new one. Dispatch never
    /// waits on a slow subscriber.
    #[default]
    DropOldest,
    /// Wait for room in that subscriber's mailbox. The wait ends as soon as
    /// the subscriber is cancelled.
    Block,
}

impl FromStr for OverflowPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drop_oldest" | "drop-oldest" => Ok(Self::DropOldest),
            "block" => Ok(Self::Block),
            other => Err(CoreError::InvalidArgument(format!(
                "unknown overflow policy {:?} (expected drop_oldest or block)",
                other
            ))),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DropOldest => f.write_str("drop_oldest"),
            Self::Block => f.write_str("block"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the feed -> dispatch channel
    pub feed_buffer: usize,
    /// Tokens queued per subscriber before the overflow policy applies
    pub mailbox_capacity: usize,
    /// Capacity of each subscriber's output channel
    pub output_buffer: usize,
    pub overflow_policy: OverflowPolicy,
    /// Pull current prices for stored tickers on start
    pub seed_prices: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            feed_buffer: 1024,
            mailbox_capacity: 256,
            output_buffer: 16,
            overflow_policy: OverflowPolicy::DropOldest,
            seed_prices: true,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> CoreResult<Self> {
        let defaults = Self::default();
        let config = Self {
            feed_buffer: parse_env("HUB_FEED_BUFFER", defaults.feed_buffer)?,
            mailbox_capacity: parse_env("HUB_MAILBOX_CAPACITY", defaults.mailbox_capacity)?,
            output_buffer: parse_env("HUB_OUTPUT_BUFFER", defaults.output_buffer)?,
            overflow_policy: match std::env::var("HUB_OVERFLOW_POLICY") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.overflow_policy,
            },
            seed_prices: parse_env("HUB_SEED_PRICES", defaults.seed_prices)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.feed_buffer == 0 {
            return Err(CoreError::InvalidArgument("HUB_FEED_BUFFER must be > 0".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(CoreError::InvalidArgument("HUB_MAILBOX_CAPACITY must be > 0".into()));
        }
        if self.output_buffer == 0 {
            return Err(CoreError::InvalidArgument("HUB_OUTPUT_BUFFER must be > 0".into()));
        }
        Ok(())
    }
}

/// Parse an environment variable with default fallback
pub(crate) fn parse_env<T: FromStr>(var_name: &str, default: T) -> CoreResult<T> {
    match std::env::var(var_name) {
        Ok(val) => val.trim().to_lowercase().parse().map_err(|_| {
            CoreError::InvalidArgument(format!("{} has an invalid value {:?}", var_name, val))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_policy_parse() {
        assert_eq!("drop_oldest".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::DropOldest);
        assert_eq!(" BLOCK ".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Block);
        assert!("drop_newest".parse::<OverflowPolicy>().is_err());
        assert_eq!(OverflowPolicy::Block.to_string(), "block");
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = HubConfig {
            mailbox_capacity: 0,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_with_default() {
        assert_eq!(parse_env("CRYPTOWATCH_UNSET_VAR_ABC", 100usize).unwrap(), 100);
    }
}
