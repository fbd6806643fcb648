//! Worker Errors

use std::fmt;

use crate::store::StoreError;

/// Outcome of a failed handler attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Retrying cannot change the outcome; archive immediately
    #[error("{0} (skip retry)")]
    SkipRetry(String),

    /// Hand the task back to the broker's backoff-and-retry policy
    #[error("{0}")]
    Retry(String),
}

impl TaskError {
    pub fn skip_retry(err: impl fmt::Display) -> Self {
        Self::SkipRetry(err.to_string())
    }

    pub fn retry(err: impl fmt::Display) -> Self {
        Self::Retry(err.to_string())
    }

    pub fn is_skip_retry(&self) -> bool {
        matches!(self, TaskError::SkipRetry(_))
    }
}

/// Errors from handing a task to the broker
#[derive(Debug, thiserror::Error)]
pub enum DistributeError {
    #[error("failed to marshal task payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to enqueue task: {0}")]
    Broker(#[from] StoreError),
}

impl DistributeError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, DistributeError::Broker(e) if e.is_retryable())
    }
}
