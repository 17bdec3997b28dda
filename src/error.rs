//! Error types for the wallet engine

use thiserror::Error;

use crate::state::{ChainType, TransactionStatus};

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain}: {message}")]
    ChainConnection { chain: ChainType, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Missing private key for address {address}")]
    MissingPrivateKey { address: String },

    #[error("Fee {fee} exceeds max fee {max_fee}")]
    FeeTooHigh { fee: u64, max_fee: u64 },

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Account {address} is being deleted")]
    AccountDeleting { address: String },

    #[error("Insufficient balance on chain {chain}: have {have}, need {need}")]
    InsufficientBalance { chain: ChainType, have: u64, need: u64 },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Rate limited on chain {chain}")]
    RateLimited { chain: ChainType },

    #[error("Chain {chain} not found")]
    ChainNotFound { chain: String },

    #[error("Transaction {id} not found")]
    TransactionNotFound { id: i64 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Operation not supported on chain {chain}: {operation}")]
    Unsupported { chain: ChainType, operation: String },

    /// Raised when a monitor no longer owns its chain lock. Only the monitor
    /// loop boundary catches it.
    #[error("Monitor for chain {chain} stopped: lock no longer held")]
    MonitorStopped { chain: ChainType },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::ChainConnection { .. }
            | EngineError::Timeout { .. }
            | EngineError::RateLimited { .. }
            | EngineError::WriteConflict(_) => true,
            EngineError::Database(e) => is_conflict(e),
            _ => false,
        }
    }

    /// Database-level conflicts worth retrying the same write for
    pub fn is_write_conflict(&self) -> bool {
        match self {
            EngineError::WriteConflict(_) => true,
            EngineError::Database(e) => is_conflict(e),
            _ => false,
        }
    }

    /// Errors that settle a record as FAILED instead of retrying it later
    pub fn is_record_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::MissingPrivateKey { .. }
                | EngineError::FeeTooHigh { .. }
                | EngineError::DeadlineExceeded(_)
                | EngineError::InvalidAmount(_)
                | EngineError::Signing(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientBalance { .. } | EngineError::MissingPrivateKey { .. }
        )
    }
}

/// Serialization failures, deadlocks and unique violations can be retried.
fn is_conflict(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40001") | Some("40P01") | Some("23505")
        ),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
