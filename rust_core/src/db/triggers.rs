//! Postgres-backed trigger store over the `triggers` table.

use super::TriggerStore;
use crate::error::{CoreError, CoreResult};
use crate::types::{Ticker, UserId};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::warn;

#[derive(Clone)]
pub struct PgTriggerStore {
    pool: PgPool,
}

impl PgTriggerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Postgres has no unsigned integers; ids above i64::MAX cannot be stored.
fn db_user_id(user_id: UserId) -> CoreResult<i64> {
    i64::try_from(user_id)
        .map_err(|_| CoreError::InvalidArgument(format!("user id {} out of range", user_id)))
}

#[async_trait]
impl TriggerStore for PgTriggerStore {
    async fn add(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO triggers (user_id, token_ticker)
            VALUES ($1, $2)
            ON CONFLICT (user_id, token_ticker) DO NOTHING
            "#,
        )
        .bind(db_user_id(user_id)?)
        .bind(ticker.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM triggers
            WHERE user_id = $1 AND token_ticker = $2
            "#,
        )
        .bind(db_user_id(user_id)?)
        .bind(ticker.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!(
                "trigger ({}, {})",
                user_id, ticker
            )));
        }
        Ok(())
    }

    async fn exists(&self, user_id: UserId, ticker: &Ticker) -> CoreResult<bool> {
        let found = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM triggers
                WHERE user_id = $1 AND token_ticker = $2
            )
            "#,
        )
        .bind(db_user_id(user_id)?)
        .bind(ticker.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn list_for_user(&self, user_id: UserId) -> CoreResult<Vec<Ticker>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT token_ticker FROM triggers WHERE user_id = $1 ORDER BY token_ticker",
        )
        .bind(db_user_id(user_id)?)
        .fetch_all(&self.pool)
        .await?;

        let mut tickers = Vec::with_capacity(rows.len());
        for raw in rows {
            match Ticker::parse(&raw) {
                Ok(ticker) => tickers.push(ticker),
                Err(e) => warn!("Skipping stored trigger ticker {:?}: {}", raw, e),
            }
        }
        Ok(tickers)
    }
}
