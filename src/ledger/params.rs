//! Coordinator parameter and result bundles

use serde::{Deserialize, Serialize};

use crate::domain::validate::{validate_id, validate_secret_code};
use crate::domain::{ValidationError, Violations};
use crate::store::{Account, CreateUserParams, Entry, Transfer, User, VerifyEmail};
use crate::worker::TaskInfo;

// =========================================================================
// Transfer
// =========================================================================

/// Move `amount` minor units from one account to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl TransferTxParams {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut violations = Violations::new();
        violations
            .check("from_account_id", validate_id(self.from_account_id))
            .check("to_account_id", validate_id(self.to_account_id));
        if self.amount <= 0 {
            violations.check("amount", Err("must be greater than 0".to_string()));
        }
        if self.from_account_id == self.to_account_id {
            violations.check(
                "to_account_id",
                Err("cannot transfer to the same account".to_string()),
            );
        }
        violations.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

// =========================================================================
// Create user
// =========================================================================

#[derive(Debug, Clone)]
pub struct CreateUserTxParams {
    pub user: CreateUserParams,
}

impl From<CreateUserParams> for CreateUserTxParams {
    fn from(user: CreateUserParams) -> Self {
        Self { user }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateUserTxResult {
    pub user: User,
    /// The follow-up task, when one was requested
    pub task: Option<TaskInfo>,
}

// =========================================================================
// Verify email
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerifyEmailTxParams {
    pub email_id: i64,
    pub secret_code: String,
}

impl VerifyEmailTxParams {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Violations::new()
            .check("email_id", validate_id(self.email_id))
            .check("secret_code", validate_secret_code(&self.secret_code))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}
