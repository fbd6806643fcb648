//! API Routes
//!
//! HTTP endpoint definitions. Handlers validate input, then call exactly
//! one coordinator operation.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::validate::{
    validate_currency, validate_email, validate_full_name, validate_id, validate_password,
    validate_username,
};
use crate::domain::{OperationContext, Violations};
use crate::error::AppError;
use crate::ledger::{TransferTxParams, TransferTxResult, VerifyEmailTxParams};
use crate::store::{Account, CreateAccountParams, CreateUserParams, User};
use crate::worker::{DistributeError, PayloadSendVerifyEmail};

use super::password::hash_password;
use super::AppState;

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub is_email_verified: bool,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            username: user.username,
            full_name: user.full_name,
            email: user.email,
            is_email_verified: user.is_email_verified,
            password_changed_at: user.password_changed_at,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailQuery {
    pub email_id: i64,
    pub secret_code: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyEmailResponse {
    pub is_verified: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub owner: String,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

// =========================================================================
// Router
// =========================================================================

/// Versioned API routes, mounted under `/v1`
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/users", post(create_user))
        .route("/verify_email", get(verify_email))
        .route("/accounts", post(create_account))
        .route("/accounts/:id", get(get_account))
        .route("/transfers", post(create_transfer))
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =========================================================================
// POST /users
// =========================================================================

/// Create a user and schedule the verification mail
async fn create_user(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    Violations::new()
        .check("username", validate_username(&request.username))
        .check("password", validate_password(&request.password))
        .check("full_name", validate_full_name(&request.full_name))
        .check("email", validate_email(&request.email))
        .finish()?;

    // CPU-bound; run on the blocking pool
    let password = request.password;
    let hashed_password = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| AppError::Internal(format!("password hashing task failed: {}", e)))?
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let params = CreateUserParams {
        username: request.username,
        hashed_password,
        full_name: request.full_name,
        email: request.email,
    };

    let options = state.verify_email_options.clone();
    let result = state
        .ledger
        .create_user_tx(&context, params.into(), move |user| {
            PayloadSendVerifyEmail::new(user.username.clone())
                .to_request(options)
                .map(Some)
                .map_err(DistributeError::from)
        })
        .await?;

    Ok((StatusCode::CREATED, Json(result.user.into())))
}

// =========================================================================
// GET /verify_email
// =========================================================================

async fn verify_email(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Query(query): Query<VerifyEmailQuery>,
) -> Result<Json<VerifyEmailResponse>, AppError> {
    let result = state
        .ledger
        .verify_email_tx(
            &context,
            VerifyEmailTxParams {
                email_id: query.email_id,
                secret_code: query.secret_code,
            },
        )
        .await?;

    Ok(Json(VerifyEmailResponse {
        is_verified: result.user.is_email_verified,
    }))
}

// =========================================================================
// Accounts
// =========================================================================

async fn create_account(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<Account>), AppError> {
    Violations::new()
        .check("owner", validate_username(&request.owner))
        .check("currency", validate_currency(&request.currency))
        .finish()?;

    let account = state
        .ledger
        .create_account(
            &context,
            CreateAccountParams {
                owner: request.owner,
                balance: 0,
                currency: request.currency,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_account(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(id): Path<i64>,
) -> Result<Json<Account>, AppError> {
    Violations::new().check("id", validate_id(id)).finish()?;

    let account = state.ledger.get_account(&context, id).await?;
    Ok(Json(account))
}

// =========================================================================
// POST /transfers
// =========================================================================

async fn create_transfer(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<TransferTxResult>, AppError> {
    let params = TransferTxParams {
        from_account_id: request.from_account_id,
        to_account_id: request.to_account_id,
        amount: request.amount,
    };

    Violations::new()
        .check("currency", validate_currency(&request.currency))
        .finish()?;
    params.validate()?;

    for id in [params.from_account_id, params.to_account_id] {
        let account = state.ledger.get_account(&context, id).await?;
        if account.currency != request.currency {
            return Err(AppError::CurrencyMismatch(format!(
                "account {} currency mismatch: {} vs {}",
                id, account.currency, request.currency
            )));
        }
    }

    let result = state.ledger.transfer_tx(&context, params).await?;
    Ok(Json(result))
}
