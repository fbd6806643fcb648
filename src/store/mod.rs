//! Relational Store module
//!
//! Typed point operations against accounts, entries, transfers, users and
//! verification records. No operation here spans more than one table;
//! multi-table consistency belongs to the ledger coordinator.

mod error;
pub mod memory;
mod models;
mod postgres;

use async_trait::async_trait;

use crate::domain::OperationContext;
use crate::worker::{Task, TaskInfo, TaskOptions};

pub use error::StoreError;
pub use memory::{MemoryStore, StoreOp};
pub use models::*;
pub use postgres::{PgQueries, PgStore};

/// Store-wide Result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Point reads and writes, one per entity per mutation kind.
///
/// Implemented both by auto-commit connections and by transaction-bound
/// handles, so the same calls work inside and outside an atomic scope.
#[async_trait]
pub trait Querier: Send {
    // === Accounts ===

    async fn create_account(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateAccountParams,
    ) -> StoreResult<Account>;

    async fn get_account(&mut self, ctx: &OperationContext, id: i64) -> StoreResult<Account>;

    /// Add a signed delta and return the updated row in one statement
    async fn add_account_balance(
        &mut self,
        ctx: &OperationContext,
        arg: &AddAccountBalanceParams,
    ) -> StoreResult<Account>;

    // === Entries ===

    async fn create_entry(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateEntryParams,
    ) -> StoreResult<Entry>;

    async fn get_entry(&mut self, ctx: &OperationContext, id: i64) -> StoreResult<Entry>;

    // === Transfers ===

    async fn create_transfer(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateTransferParams,
    ) -> StoreResult<Transfer>;

    async fn get_transfer(&mut self, ctx: &OperationContext, id: i64) -> StoreResult<Transfer>;

    // === Users ===

    async fn create_user(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateUserParams,
    ) -> StoreResult<User>;

    async fn get_user(&mut self, ctx: &OperationContext, username: &str) -> StoreResult<User>;

    async fn update_user(
        &mut self,
        ctx: &OperationContext,
        arg: &UpdateUserParams,
    ) -> StoreResult<User>;

    // === Verification records ===

    async fn create_verify_email(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail>;

    async fn get_verify_email(&mut self, ctx: &OperationContext, id: i64)
        -> StoreResult<VerifyEmail>;

    /// Mark the record used; `NotFound` unless id and secret match an
    /// unused, unexpired record
    async fn update_verify_email(
        &mut self,
        ctx: &OperationContext,
        arg: &UpdateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail>;

    // === Tasks ===

    /// Enqueue a task on this handle. Inside a scope the task becomes
    /// visible to workers only when the scope commits.
    async fn enqueue_task(
        &mut self,
        ctx: &OperationContext,
        task: &Task,
        options: &TaskOptions,
    ) -> StoreResult<TaskInfo>;
}

/// A transaction-bound handle. Dropping it without `commit` rolls back.
#[async_trait]
pub trait StoreTx: Send {
    fn queries(&mut self) -> &mut dyn Querier;

    async fn commit(self: Box<Self>, ctx: &OperationContext) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Entry point to the relational store, shared by every component
#[async_trait]
pub trait Store: Send + Sync {
    /// Open an atomic scope
    async fn begin(&self, ctx: &OperationContext) -> StoreResult<Box<dyn StoreTx>>;

    /// Auto-commit handle for single-statement work
    async fn connect(&self, ctx: &OperationContext) -> StoreResult<Box<dyn Querier>>;
}
