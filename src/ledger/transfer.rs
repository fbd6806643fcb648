//! Transfer-money scope

use tracing::instrument;

use crate::domain::{LedgerError, OperationContext};
use crate::store::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, Querier, StoreError,
};

use super::{not_found_as, Ledger, TransferTxParams, TransferTxResult};

impl Ledger {
    /// Record a transfer, its two entries and both balance changes atomically.
    ///
    /// Balances are always updated in ascending account id order so two
    /// opposite transfers over the same pair lock rows in the same order.
    #[instrument(
        skip(self, ctx, arg),
        fields(
            from = arg.from_account_id,
            to = arg.to_account_id,
            amount = arg.amount,
        )
    )]
    pub async fn transfer_tx(
        &self,
        ctx: &OperationContext,
        arg: TransferTxParams,
    ) -> Result<TransferTxResult, LedgerError> {
        arg.validate()?;

        let result = self
            .exec_tx(ctx, move |q, ctx| {
                Box::pin(async move {
                    let transfer = q
                        .create_transfer(
                            ctx,
                            &CreateTransferParams {
                                from_account_id: arg.from_account_id,
                                to_account_id: arg.to_account_id,
                                amount: arg.amount,
                            },
                        )
                        .await
                        .map_err(|e| not_found_as(e, "account"))?;

                    let from_entry = q
                        .create_entry(
                            ctx,
                            &CreateEntryParams {
                                account_id: arg.from_account_id,
                                amount: -arg.amount,
                            },
                        )
                        .await
                        .map_err(|e| {
                            not_found_as(e, format!("account {}", arg.from_account_id))
                        })?;

                    let to_entry = q
                        .create_entry(
                            ctx,
                            &CreateEntryParams {
                                account_id: arg.to_account_id,
                                amount: arg.amount,
                            },
                        )
                        .await
                        .map_err(|e| {
                            not_found_as(e, format!("account {}", arg.to_account_id))
                        })?;

                    let (from_account, to_account) = if arg.from_account_id < arg.to_account_id {
                        add_money(
                            q,
                            ctx,
                            (arg.from_account_id, -arg.amount),
                            (arg.to_account_id, arg.amount),
                        )
                        .await?
                    } else {
                        let (to_account, from_account) = add_money(
                            q,
                            ctx,
                            (arg.to_account_id, arg.amount),
                            (arg.from_account_id, -arg.amount),
                        )
                        .await?;
                        (from_account, to_account)
                    };

                    Ok(TransferTxResult {
                        transfer,
                        from_account,
                        to_account,
                        from_entry,
                        to_entry,
                    })
                })
            })
            .await?;

        tracing::info!(
            transfer_id = result.transfer.id,
            from_balance = result.from_account.balance,
            to_balance = result.to_account.balance,
            "Transfer completed"
        );
        Ok(result)
    }
}

/// Apply two balance deltas, first to `first` then to `second`
async fn add_money(
    q: &mut dyn Querier,
    ctx: &OperationContext,
    first: (i64, i64),
    second: (i64, i64),
) -> Result<(Account, Account), LedgerError> {
    let account1 = add_balance(q, ctx, first).await?;
    let account2 = add_balance(q, ctx, second).await?;
    Ok((account1, account2))
}

async fn add_balance(
    q: &mut dyn Querier,
    ctx: &OperationContext,
    (id, amount): (i64, i64),
) -> Result<Account, LedgerError> {
    q.add_account_balance(ctx, &AddAccountBalanceParams { id, amount })
        .await
        .map_err(|e| match e {
            StoreError::CheckViolation { .. } => LedgerError::InsufficientFunds { account_id: id },
            other => not_found_as(other, format!("account {}", id)),
        })
}
