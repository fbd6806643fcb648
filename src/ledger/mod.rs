//! Transaction Coordinator
//!
//! Composite operations that each run as one all-or-nothing atomic scope
//! over the relational store: transfers, signup with a follow-up task, and
//! email verification.

mod create_user;
mod params;
mod transfer;
mod verify_email;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::instrument;

use crate::domain::{LedgerError, OperationContext};
use crate::store::{Account, CreateAccountParams, Querier, Store, StoreError};
use crate::worker::TaskDistributor;

pub use params::{
    CreateUserTxParams, CreateUserTxResult, TransferTxParams, TransferTxResult,
    VerifyEmailTxParams, VerifyEmailTxResult,
};

/// Entry point for every multi-row mutation
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    distributor: Arc<dyn TaskDistributor>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, distributor: Arc<dyn TaskDistributor>) -> Self {
        Self { store, distributor }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run `body` inside one transaction.
    ///
    /// Commits when the body returns `Ok` and rolls back when it returns
    /// `Err`. A panic, a failed commit or a dropped future leaves the
    /// transaction handle to roll itself back.
    pub async fn exec_tx<T, F>(&self, ctx: &OperationContext, body: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(
                &'t mut dyn Querier,
                &'t OperationContext,
            ) -> BoxFuture<'t, Result<T, LedgerError>>
            + Send,
    {
        let mut tx = self.store.begin(ctx).await?;

        let result = body(tx.queries(), ctx).await;
        match result {
            Ok(value) => {
                tx.commit(ctx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        error = %err,
                        rollback_error = %rollback_err,
                        "Rollback failed after scope error"
                    );
                }
                Err(err)
            }
        }
    }

    // =========================================================================
    // Single-row operations
    // =========================================================================

    #[instrument(skip(self, ctx, arg), fields(owner = %arg.owner, currency = %arg.currency))]
    pub async fn create_account(
        &self,
        ctx: &OperationContext,
        arg: CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        let mut conn = self.store.connect(ctx).await?;
        conn.create_account(ctx, &arg)
            .await
            .map_err(|e| not_found_as(e, format!("user {}", arg.owner)))
    }

    pub async fn get_account(&self, ctx: &OperationContext, id: i64) -> Result<Account, LedgerError> {
        let mut conn = self.store.connect(ctx).await?;
        conn.get_account(ctx, id)
            .await
            .map_err(|e| not_found_as(e, format!("account {}", id)))
    }
}

/// Name the missing entity; every other error keeps its class
fn not_found_as(err: StoreError, what: impl fmt::Display) -> LedgerError {
    match err {
        StoreError::NotFound => LedgerError::NotFound(what.to_string()),
        other => other.into(),
    }
}
