//! Periodic liveness probe for the price database.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn check_pool_health(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .context("Price database is unreachable")?;
    Ok(())
}

#[derive(Clone, Debug)]
pub struct PoolHealthConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    /// Consecutive failures before the probe reports `Critical`
    pub alert_threshold: u32,
}

impl Default for PoolHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(30),
            alert_threshold: 3,
        }
    }
}

impl PoolHealthConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("DB_HEALTH_CHECK_ENABLED")
                .ok()
                .and_then(|v| v.to_lowercase().parse().ok())
                .unwrap_or(defaults.enabled),
            check_interval: std::env::var("DB_HEALTH_CHECK_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.check_interval),
            alert_threshold: std::env::var("DB_HEALTH_ALERT_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.alert_threshold),
        }
    }
}

/// Outcome of recording one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Healthy,
    /// First success after `n` failures
    Recovered(u32),
    Failing(u32),
    /// At or past the alert threshold
    Critical(u32),
}

/// Probe history shared with whoever reports on it.
#[derive(Debug, Default)]
pub struct PoolHealth {
    checks: AtomicU64,
    consecutive_failures: AtomicU32,
    last_ok_ms: AtomicI64,
}

impl PoolHealth {
    pub fn record(&self, ok: bool, alert_threshold: u32) -> HealthTransition {
        self.checks.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.last_ok_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            match self.consecutive_failures.swap(0, Ordering::Relaxed) {
                0 => HealthTransition::Healthy,
                n => HealthTransition::Recovered(n),
            }
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= alert_threshold.max(1) {
                HealthTransition::Critical(failures)
            } else {
                HealthTransition::Failing(failures)
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) == 0
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Unix millis of the last successful probe, 0 if none yet
    pub fn last_ok_ms(&self) -> i64 {
        self.last_ok_ms.load(Ordering::Relaxed)
    }
}

pub struct PoolHealthMonitor {
    pool: PgPool,
    config: PoolHealthConfig,
    health: Arc<PoolHealth>,
}

impl PoolHealthMonitor {
    pub fn new(pool: PgPool, config: PoolHealthConfig) -> Self {
        Self {
            pool,
            config,
            health: Arc::new(PoolHealth::default()),
        }
    }

    pub fn health(&self) -> Arc<PoolHealth> {
        Arc::clone(&self.health)
    }

    pub async fn run(self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Price database health checks disabled");
            return;
        }

        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Checking price database every {:?}",
            self.config.check_interval
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let result = check_pool_health(&self.pool).await;
            match self.health.record(result.is_ok(), self.config.alert_threshold) {
                HealthTransition::Healthy => {}
                HealthTransition::Recovered(n) => {
                    info!("Price database reachable again after {} failed checks", n)
                }
                HealthTransition::Failing(n) => {
                    if let Err(e) = result {
                        warn!("Price database check {} failed: {:#}", n, e);
                    }
                }
                HealthTransition::Critical(n) => {
                    if let Err(e) = result {
                        error!("CRITICAL: price database unreachable for {} checks: {:#}", n, e);
                    }
                }
            }
        }
        info!("Price database health checks stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let health = PoolHealth::default();
        assert_eq!(health.record(true, 3), HealthTransition::Healthy);
        assert!(health.last_ok_ms() > 0);

        assert_eq!(health.record(false, 3), HealthTransition::Failing(1));
        assert_eq!(health.record(false, 3), HealthTransition::Failing(2));
        assert_eq!(health.record(false, 3), HealthTransition::Critical(3));
        assert!(!health.is_healthy());

        assert_eq!(health.record(true, 3), HealthTransition::Recovered(3));
        assert!(health.is_healthy());
        assert_eq!(health.checks(), 5);
    }

    #[test]
    fn test_zero_threshold_is_immediately_critical() {
        let health = PoolHealth::default();
        assert_eq!(health.record(false, 0), HealthTransition::Critical(1));
    }
}
