//! Postgres-backed price store over the `tokens` table.

use super::PriceStore;
use crate::error::{CoreError, CoreResult};
use crate::types::Ticker;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct PgPriceStore {
    pool: PgPool,
}

impl PgPriceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PriceStore for PgPriceStore {
    async fn upsert(&self, ticker: &Ticker) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tokens (ticker)
            VALUES ($1)
            ON CONFLICT (ticker) DO NOTHING
            "#,
        )
        .bind(ticker.as_str())
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() > 0;
        if created {
            debug!("Tracking new ticker {}", ticker);
        }
        Ok(created)
    }

    async fn set_price(&self, ticker: &Ticker, price: f64) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tokens
            SET price = $2
            WHERE ticker = $1
            "#,
        )
        .bind(ticker.as_str())
        .bind(price)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("ticker {}", ticker)));
        }
        Ok(())
    }

    async fn list_tickers(&self) -> CoreResult<Vec<Ticker>> {
        let rows = sqlx::query_scalar::<_, String>("SELECT ticker FROM tokens ORDER BY ticker")
            .fetch_all(&self.pool)
            .await?;

        let mut tickers = Vec::with_capacity(rows.len());
        for raw in rows {
            match Ticker::parse(&raw) {
                Ok(ticker) => tickers.push(ticker),
                Err(e) => warn!("Skipping stored ticker {:?}: {}", raw, e),
            }
        }
        Ok(tickers)
    }

    async fn get_price(&self, ticker: &Ticker) -> CoreResult<Option<f64>> {
        let row = sqlx::query_scalar::<_, Option<f64>>("SELECT price FROM tokens WHERE ticker = $1")
            .bind(ticker.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| CoreError::not_found(format!("ticker {}", ticker)))
    }
}
