//! Store Errors
//!
//! Classifies driver errors into the small vocabulary callers branch on.

/// SQLSTATE codes the classifier understands
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Errors that can occur in the relational store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Unique constraint violation
    #[error("Unique constraint violated: {constraint}")]
    Conflict { constraint: String },

    /// No matching row (or a referenced row is missing)
    #[error("Record not found")]
    NotFound,

    /// Check constraint violation (e.g. negative balance)
    #[error("Check constraint violated: {constraint}")]
    CheckViolation { constraint: String },

    /// Connectivity, timeout or serialization failure
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// The execution context was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The execution context's deadline passed
    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn conflict(constraint: impl Into<String>) -> Self {
        Self::Conflict {
            constraint: constraint.into(),
        }
    }

    pub fn check_violation(constraint: impl Into<String>) -> Self {
        Self::CheckViolation {
            constraint: constraint.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    /// Check if retrying the enclosing scope from the top may help
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) => {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                match db_err.code().as_deref() {
                    Some(UNIQUE_VIOLATION) => StoreError::Conflict { constraint },
                    Some(FOREIGN_KEY_VIOLATION) => StoreError::NotFound,
                    Some(CHECK_VIOLATION) => StoreError::CheckViolation { constraint },
                    Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                        StoreError::Transient(db_err.message().to_string())
                    }
                    _ => StoreError::Internal(db_err.to_string()),
                }
            }
            sqlx::Error::Io(e) => StoreError::Transient(e.to_string()),
            sqlx::Error::PoolTimedOut => StoreError::Transient("connection pool timed out".to_string()),
            sqlx::Error::PoolClosed => StoreError::Transient("connection pool closed".to_string()),
            other => StoreError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_is_not_found() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_other_errors_are_internal() {
        let err: StoreError = sqlx::Error::ColumnNotFound("balance".to_string()).into();
        assert!(matches!(err, StoreError::Internal(_)));
    }

    #[test]
    fn test_conflict_helper() {
        let err = StoreError::conflict("users_email_key");
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "Unique constraint violated: users_email_key");
    }
}
