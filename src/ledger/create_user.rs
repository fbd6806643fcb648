//! Create-user scope with a vetoing follow-up task

use tracing::instrument;

use crate::domain::{LedgerError, OperationContext};
use crate::store::User;
use crate::worker::{DistributeError, TaskRequest};

use super::{not_found_as, CreateUserTxParams, CreateUserTxResult, Ledger};

impl Ledger {
    /// Create a user and enqueue its follow-up task in one atomic scope.
    ///
    /// `prepare` runs inside the scope once the row exists and only describes
    /// the follow-up; the coordinator enqueues it on the scope's own
    /// connection. A failed enqueue rolls the user back, and a rolled-back
    /// scope takes the task with it.
    #[instrument(skip(self, ctx, arg, prepare), fields(username = %arg.user.username))]
    pub async fn create_user_tx<P>(
        &self,
        ctx: &OperationContext,
        arg: CreateUserTxParams,
        prepare: P,
    ) -> Result<CreateUserTxResult, LedgerError>
    where
        P: FnOnce(&User) -> Result<Option<TaskRequest>, DistributeError> + Send + 'static,
    {
        let distributor = self.distributor.clone();

        let result = self
            .exec_tx(ctx, move |q, ctx| {
                Box::pin(async move {
                    let user = q
                        .create_user(ctx, &arg.user)
                        .await
                        .map_err(|e| not_found_as(e, format!("user {}", arg.user.username)))?;

                    let task = match prepare(&user)? {
                        Some(request) => Some(distributor.distribute_in(ctx, q, request).await?),
                        None => None,
                    };

                    Ok(CreateUserTxResult { user, task })
                })
            })
            .await?;

        tracing::info!(
            username = %result.user.username,
            task_id = result.task.as_ref().map(|t| t.id),
            "User created"
        );
        Ok(result)
    }
}
