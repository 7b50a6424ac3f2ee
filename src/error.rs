use ledger::LedgerError;
use std::fmt;
use thiserror::Error;

/// Why a session transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidState {
    /// The session already completed or was cancelled.
    AlreadyTerminal,
    /// Accept, reject and cancel need a call still ringing.
    NotRequested,
    /// Reviews need a completed session.
    NotCompleted,
    /// Tokens are only issued while the session is live.
    NotLive,
}

impl fmt::Display for InvalidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            InvalidState::AlreadyTerminal => "session is already terminal",
            InvalidState::NotRequested => "session is not awaiting an answer",
            InvalidState::NotCompleted => "session is not completed",
            InvalidState::NotLive => "session is not live",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid state: {0}")]
    InvalidState(InvalidState),
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("consultant is not available")]
    Unavailable,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("dependency failure: {0}")]
    DependencyFailure(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::InvalidState(InvalidState::AlreadyTerminal) => "ALREADY_TERMINAL",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Error::Unavailable => "UNAVAILABLE",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Conflict(_) => "CONFLICT",
            Error::DependencyFailure(_) => "DEPENDENCY_FAILURE",
            Error::Storage(_) => "INTERNAL",
            Error::Config(_) => "INTERNAL",
        }
    }

    /// HTTP status a host would most likely map this to.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Forbidden(_) => 403,
            Error::InvalidState(_) => 409,
            Error::InsufficientBalance => 402,
            Error::Unavailable => 409,
            Error::Validation(_) => 400,
            Error::Conflict(_) => 409,
            Error::DependencyFailure(_) => 502,
            Error::Storage(_) | Error::Config(_) => 500,
        }
    }

    /// Message safe to show a caller. Internal detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Error::Storage(_) | Error::Config(_) => "internal server error".to_string(),
            Error::DependencyFailure(_) => "an upstream service failed".to_string(),
            other => other.to_string(),
        }
    }

    pub(crate) fn not_found(what: &str, id: impl fmt::Display) -> Self {
        Error::NotFound(format!("{what} {id}"))
    }
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance => Error::InsufficientBalance,
            LedgerError::InvalidAmount => {
                Error::Validation("amount must be a positive number of minor units".to_string())
            }
            LedgerError::AccountNotFound(id) => Error::not_found("account", id),
            LedgerError::EntryNotFound => Error::NotFound("ledger entry".to_string()),
            LedgerError::DuplicateIdempotencyKey(id) => {
                Error::Conflict(format!("idempotency key already used by entry {id}"))
            }
            LedgerError::Storage(msg) => Error::Storage(msg),
            LedgerError::Conflict(msg) => Error::Conflict(msg),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(err.to_string())
    }
}
