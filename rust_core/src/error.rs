//! Error taxonomy shared by the price hub, trigger router and their storage
//! collaborators.

use thiserror::Error;

/// Errors surfaced by the core public API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Transport, storage or parse failure. Opaque to callers.
    #[error("internal error: {0}")]
    Internal(String),

    /// The operation referenced an unknown ticker or trigger.
    #[error("not found: {0}")]
    NotFound(String),

    /// A storage-level constraint was violated (e.g. missing foreign key).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The caller supplied a value that can never be valid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoreError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Postgres SQLSTATE for foreign key violations.
const FOREIGN_KEY_VIOLATION: &str = "23503";

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::Database(db)
                if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) =>
            {
                Self::FailedPrecondition(db.message().to_string())
            }
            _ => Self::Internal(format!("database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {}", err))
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
