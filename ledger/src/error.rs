// ledger/src/error.rs
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("Invalid amount")]
    InvalidAmount,
    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),
    #[error("Ledger entry not found")]
    EntryNotFound,
    /// Carries the id of the entry that already used the key.
    #[error("Duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(Uuid),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}
