//! Ledger Error Types
//!
//! The vocabulary the coordinator reports to its callers. Nothing here
//! depends on a specific database engine.

use thiserror::Error;

use crate::domain::validate::ValidationError;
use crate::store::StoreError;
use crate::worker::DistributeError;

/// Errors returned by the transaction coordinator.
///
/// Every variant leaves the store in its pre-call state.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Caller-supplied data rejected before any store access
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Debit would take the account below zero
    #[error("Insufficient funds in account {account_id}")]
    InsufficientFunds { account_id: i64 },

    /// Uniqueness violation (duplicate username, email, ...)
    #[error("Already exists: {0}")]
    Conflict(String),

    /// No matching row, or the row did not satisfy the update predicate
    #[error("Not found: {0}")]
    NotFound(String),

    /// Connectivity or serialization failure; the whole scope may be retried
    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    /// The follow-up task could not be enqueued, so the scope was vetoed
    #[error("Failed to enqueue follow-up task: {0}")]
    Enqueue(#[from] DistributeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Check if this is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::InsufficientFunds { .. } | Self::Conflict(_) | Self::NotFound(_)
        )
    }

    /// Check if re-running the whole atomic scope may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Enqueue(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { constraint } => Self::Conflict(constraint),
            StoreError::NotFound => Self::NotFound("record".to_string()),
            StoreError::CheckViolation { constraint } => {
                Self::Internal(format!("check constraint {} violated", constraint))
            }
            StoreError::Transient(msg) => Self::Transient(msg),
            StoreError::Cancelled => Self::Cancelled,
            StoreError::DeadlineExceeded => Self::DeadlineExceeded,
            StoreError::Internal(msg) => Self::Internal(msg),
        }
    }
}
