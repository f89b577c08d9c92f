//! Postgres tables behind `PgPriceStore` and `PgTriggerStore`.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

/// One row per tracked ticker; `price` is NULL until the first tick.
pub const CREATE_TOKENS: &str = r#"
CREATE TABLE IF NOT EXISTS tokens (
    ticker TEXT PRIMARY KEY,
    price  DOUBLE PRECISION
)
"#;

/// Adding a trigger for an untracked ticker violates the foreign key
/// (SQLSTATE 23503), surfaced as `FailedPrecondition`.
pub const CREATE_TRIGGERS: &str = r#"
CREATE TABLE IF NOT EXISTS triggers (
    user_id      BIGINT NOT NULL,
    token_ticker TEXT   NOT NULL REFERENCES tokens (ticker),
    UNIQUE (user_id, token_ticker)
)
"#;

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in [CREATE_TOKENS, CREATE_TRIGGERS] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("Failed to create price tables")?;
    }
    info!("Price tables ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triggers_reference_tokens() {
        assert!(CREATE_TRIGGERS.contains("REFERENCES tokens (ticker)"));
        assert!(CREATE_TRIGGERS.contains("UNIQUE (user_id, token_ticker)"));
    }
}
