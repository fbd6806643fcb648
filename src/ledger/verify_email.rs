//! Verify-email scope

use tracing::instrument;

use crate::domain::{LedgerError, OperationContext};
use crate::store::{UpdateUserParams, UpdateVerifyEmailParams};

use super::{not_found_as, Ledger, VerifyEmailTxParams, VerifyEmailTxResult};

impl Ledger {
    /// Consume a verification record and mark its owner verified.
    ///
    /// A wrong, used or expired secret matches no row and yields `NotFound`
    /// without touching the user.
    #[instrument(skip(self, ctx, arg), fields(email_id = arg.email_id))]
    pub async fn verify_email_tx(
        &self,
        ctx: &OperationContext,
        arg: VerifyEmailTxParams,
    ) -> Result<VerifyEmailTxResult, LedgerError> {
        arg.validate()?;

        let result = self
            .exec_tx(ctx, move |q, ctx| {
                Box::pin(async move {
                    let verify_email = q
                        .update_verify_email(
                            ctx,
                            &UpdateVerifyEmailParams {
                                id: arg.email_id,
                                secret_code: arg.secret_code,
                            },
                        )
                        .await
                        .map_err(|e| not_found_as(e, format!("verify email {}", arg.email_id)))?;

                    let user = q
                        .update_user(
                            ctx,
                            &UpdateUserParams::new(verify_email.username.clone())
                                .with_email_verified(),
                        )
                        .await
                        .map_err(|e| {
                            not_found_as(e, format!("user {}", verify_email.username))
                        })?;

                    Ok(VerifyEmailTxResult { user, verify_email })
                })
            })
            .await?;

        tracing::info!(username = %result.user.username, "Email verified");
        Ok(result)
    }
}
