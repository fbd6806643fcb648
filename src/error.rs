//! Error handling module
//!
//! Centralized HTTP error type and response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domain::{FieldViolation, LedgerError, ValidationError};

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Validation failed")]
    Validation(#[from] ValidationError),

    #[error("Currency mismatch: {0}")]
    CurrencyMismatch(String),

    // Coordinator errors
    #[error(transparent)]
    Ledger(LedgerError),

    // Server errors (5xx)
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(e) => AppError::Validation(e),
            other => AppError::Ledger(other),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<FieldViolation>,
}

/// Nginx-style status for a request the client abandoned
const CLIENT_CLOSED_REQUEST: u16 = 499;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut violations = Vec::new();
        let (status, error_code, details) = match &self {
            // 400 Bad Request
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", Some(msg.clone()))
            }
            AppError::Validation(e) => {
                violations = e.violations.clone();
                (StatusCode::BAD_REQUEST, "validation_failed", Some(e.to_string()))
            }
            AppError::CurrencyMismatch(msg) => {
                (StatusCode::BAD_REQUEST, "currency_mismatch", Some(msg.clone()))
            }

            AppError::Ledger(err) => match err {
                LedgerError::Validation(e) => {
                    violations = e.violations.clone();
                    (StatusCode::BAD_REQUEST, "validation_failed", Some(e.to_string()))
                }
                // 422 Unprocessable Entity
                LedgerError::InsufficientFunds { account_id } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "insufficient_funds",
                    Some(format!("account {}", account_id)),
                ),
                // 409 Conflict
                LedgerError::Conflict(constraint) => {
                    (StatusCode::CONFLICT, "already_exists", Some(constraint.clone()))
                }
                // 404 Not Found
                LedgerError::NotFound(what) => {
                    (StatusCode::NOT_FOUND, "not_found", Some(what.clone()))
                }
                // 499 Client Closed Request
                LedgerError::Cancelled => (
                    StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                        .unwrap_or(StatusCode::BAD_REQUEST),
                    "cancelled",
                    None,
                ),
                // 503 Service Unavailable
                LedgerError::Transient(msg) => {
                    tracing::warn!("Transient store failure: {}", msg);
                    (StatusCode::SERVICE_UNAVAILABLE, "unavailable", None)
                }
                LedgerError::DeadlineExceeded => {
                    (StatusCode::SERVICE_UNAVAILABLE, "deadline_exceeded", None)
                }
                LedgerError::Enqueue(e) => {
                    tracing::error!("Enqueue error: {}", e);
                    (StatusCode::SERVICE_UNAVAILABLE, "enqueue_failed", None)
                }
                // 500 Internal Server Error
                LedgerError::Internal(msg) => {
                    tracing::error!("Internal error: {}", msg);
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
                }
            },

            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
            AppError::Config(e) => {
                tracing::error!("Config error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "config_error", None)
            }
        };

        // Server-side failure text stays in the logs
        let error = if status.is_server_error() {
            "Internal error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error,
            error_code: error_code.to_string(),
            details,
            violations,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_ledger_errors_map_to_status() {
        assert_eq!(
            status_of(LedgerError::InsufficientFunds { account_id: 1 }.into()),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(LedgerError::Conflict("users_pkey".to_string()).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(LedgerError::NotFound("account 7".to_string()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(LedgerError::Transient("reset".to_string()).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_of(LedgerError::Cancelled.into()).as_u16(), 499);
        assert_eq!(
            status_of(LedgerError::Internal("boom".to_string()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_validation_is_bad_request() {
        let err: AppError = LedgerError::Validation(ValidationError::single("amount", "must be positive")).into();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
    }
}
