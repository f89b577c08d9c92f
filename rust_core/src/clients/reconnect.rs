//! Backoff schedule for re-opening the price stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random (0.1 = ±10%)
    pub jitter_pct: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            jitter_pct: 0.1,
        }
    }
}

impl ReconnectConfig {
    /// `FEED_RECONNECT_*` settings for the exchange stream
    pub fn from_env() -> Self {
        Self::from_env_prefixed("FEED_RECONNECT")
    }

    /// Reads `<prefix>_BASE_DELAY_MS`, `<prefix>_MAX_DELAY_MS` and
    /// `<prefix>_JITTER_PCT`.
    pub fn from_env_prefixed(prefix: &str) -> Self {
        let defaults = Self::default();
        let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix)).ok();
        let millis = |suffix: &str| var(suffix).and_then(|v| v.parse::<u64>().ok());
        Self {
            base_delay: millis("BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: millis("MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            jitter_pct: var("JITTER_PCT")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|pct| (0.0..=1.0).contains(pct))
                .unwrap_or(defaults.jitter_pct),
        }
    }

    /// Delay before retry number `attempt` (1-based): doubling from
    /// `base_delay`, capped at `max_delay`, then jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(30);
        let uncapped = self.base_delay.as_millis() as f64 * f64::from(1u32 << doublings);
        let capped = uncapped.min(self.max_delay.as_millis() as f64);

        let spread = capped * self.jitter_pct;
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * spread;
        Duration::from_millis((capped + offset).max(0.0) as u64)
    }

    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            config: self,
            attempt: 0,
        }
    }
}

/// Retry counter for one outage. Dropped once the stream is back.
pub struct Backoff<'a> {
    config: &'a ReconnectConfig,
    attempt: u32,
}

impl Backoff<'_> {
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for(self.attempt)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Default)]
pub struct ReconnectStats {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
}

impl ReconnectStats {
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) -> u64 {
        self.successes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }
}
