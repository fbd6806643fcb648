//! Coordinator tests over the in-memory store and broker

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::store::{
    CreateUserParams, CreateVerifyEmailParams, MemoryStore, StoreOp, UpdateVerifyEmailParams, User,
};
use crate::worker::{
    random_string, BrokerTaskDistributor, DistributeError, MemoryBroker, PayloadSendVerifyEmail,
    TaskOptions, TaskRequest, TaskState, QUEUE_CRITICAL,
};

struct Fixture {
    ledger: Ledger,
    store: MemoryStore,
    broker: MemoryBroker,
}

fn fixture() -> Fixture {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new().with_broker(broker.clone());
    let ledger = Ledger::new(
        Arc::new(store.clone()),
        Arc::new(BrokerTaskDistributor::new(Arc::new(broker.clone()))),
    );
    Fixture {
        ledger,
        store,
        broker,
    }
}

fn user_params(username: &str) -> CreateUserParams {
    CreateUserParams {
        username: username.to_string(),
        hashed_password: "hashed".to_string(),
        full_name: "Test User".to_string(),
        email: format!("{}@example.com", username),
    }
}

fn verify_email_followup(user: &User) -> Result<Option<TaskRequest>, DistributeError> {
    PayloadSendVerifyEmail::new(user.username.clone())
        .to_request(TaskOptions::new().queue(QUEUE_CRITICAL).max_retry(10))
        .map(Some)
        .map_err(DistributeError::from)
}

async fn account(f: &Fixture, owner: &str, balance: i64) -> Account {
    let ctx = OperationContext::new();
    f.ledger
        .create_user_tx(&ctx, user_params(owner).into(), |_| Ok(None))
        .await
        .unwrap();
    f.ledger
        .create_account(
            &ctx,
            CreateAccountParams {
                owner: owner.to_string(),
                balance,
                currency: "USD".to_string(),
            },
        )
        .await
        .unwrap()
}

// =========================================================================
// Transfer
// =========================================================================

#[tokio::test]
async fn test_transfer_conserves_money() {
    let f = fixture();
    let a = account(&f, "alice", 100).await;
    let b = account(&f, "bob", 50).await;
    let ctx = OperationContext::new();

    let result = f
        .ledger
        .transfer_tx(
            &ctx,
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 30,
            },
        )
        .await
        .unwrap();

    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.balance, 80);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.to_entry.amount, 30);
    assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
    assert_eq!(result.transfer.amount, 30);

    assert_eq!(f.store.entries_for_account(a.id).await.len(), 1);
    assert_eq!(f.store.entries_for_account(b.id).await.len(), 1);
    assert_eq!(f.ledger.get_account(&ctx, a.id).await.unwrap().balance, 70);
}

#[tokio::test]
async fn test_balances_update_in_ascending_id_order() {
    let f = fixture();
    let a = account(&f, "alice", 100).await;
    let b = account(&f, "bob", 100).await;
    assert!(a.id < b.id);
    let ctx = OperationContext::new();

    for (from, to) in [(a.id, b.id), (b.id, a.id)] {
        f.ledger
            .transfer_tx(
                &ctx,
                TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount: 10,
                },
            )
            .await
            .unwrap();
    }

    assert_eq!(f.store.balance_update_order(), vec![a.id, b.id, a.id, b.id]);
}

#[tokio::test]
async fn test_reverse_transfer_reports_accounts_by_role() {
    let f = fixture();
    let a = account(&f, "alice", 100).await;
    let b = account(&f, "bob", 100).await;

    let result = f
        .ledger
        .transfer_tx(
            &OperationContext::new(),
            TransferTxParams {
                from_account_id: b.id,
                to_account_id: a.id,
                amount: 25,
            },
        )
        .await
        .unwrap();

    assert_eq!(result.from_account.id, b.id);
    assert_eq!(result.from_account.balance, 75);
    assert_eq!(result.to_account.id, a.id);
    assert_eq!(result.to_account.balance, 125);
}

#[tokio::test]
async fn test_insufficient_funds_rolls_back() {
    let f = fixture();
    let a = account(&f, "alice", 10).await;
    let b = account(&f, "bob", 0).await;
    let ctx = OperationContext::new();

    let err = f
        .ledger
        .transfer_tx(
            &ctx,
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 11,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InsufficientFunds { account_id } if account_id == a.id));
    assert_eq!(f.ledger.get_account(&ctx, a.id).await.unwrap().balance, 10);
    assert_eq!(f.ledger.get_account(&ctx, b.id).await.unwrap().balance, 0);
    assert!(f.store.transfers().await.is_empty());
    assert!(f.store.entries_for_account(a.id).await.is_empty());
}

#[tokio::test]
async fn test_second_entry_failure_rolls_back_everything() {
    let f = fixture();
    let a = account(&f, "alice", 100).await;
    let b = account(&f, "bob", 100).await;
    let ctx = OperationContext::new();
    f.store
        .fail_nth(StoreOp::CreateEntry, 2, StoreError::Internal("disk full".to_string()));

    let err = f
        .ledger
        .transfer_tx(
            &ctx,
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 40,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Internal(_)));
    assert!(f.store.transfers().await.is_empty());
    assert!(f.store.entries_for_account(a.id).await.is_empty());
    assert!(f.store.entries_for_account(b.id).await.is_empty());
    assert_eq!(f.ledger.get_account(&ctx, a.id).await.unwrap().balance, 100);
    assert_eq!(f.ledger.get_account(&ctx, b.id).await.unwrap().balance, 100);
}

#[tokio::test]
async fn test_commit_failure_rolls_back() {
    let f = fixture();
    let a = account(&f, "alice", 100).await;
    let b = account(&f, "bob", 100).await;
    let ctx = OperationContext::new();
    f.store.fail_nth(
        StoreOp::Commit,
        1,
        StoreError::Transient("connection reset".to_string()),
    );

    let err = f
        .ledger
        .transfer_tx(
            &ctx,
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 40,
            },
        )
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(f.store.transfers().await.is_empty());
    assert_eq!(f.ledger.get_account(&ctx, a.id).await.unwrap().balance, 100);
}

#[tokio::test]
async fn test_self_transfer_is_rejected_before_store() {
    let f = fixture();
    let a = account(&f, "alice", 100).await;
    f.store
        .fail_nth(StoreOp::Begin, 1, StoreError::Internal("unexpected".to_string()));

    let err = f
        .ledger
        .transfer_tx(
            &OperationContext::new(),
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: a.id,
                amount: 1,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Validation(_)));
}

#[tokio::test]
async fn test_transfer_to_missing_account() {
    let f = fixture();
    let a = account(&f, "alice", 100).await;

    let err = f
        .ledger
        .transfer_tx(
            &OperationContext::new(),
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: 9999,
                amount: 1,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn test_concurrent_opposite_transfers_settle() {
    let f = fixture();
    let a = account(&f, "alice", 1_000).await;
    let b = account(&f, "bob", 1_000).await;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let ledger = f.ledger.clone();
            let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
            tokio::spawn(async move {
                ledger
                    .transfer_tx(
                        &OperationContext::new(),
                        TransferTxParams {
                            from_account_id: from,
                            to_account_id: to,
                            amount: 10,
                        },
                    )
                    .await
            })
        })
        .collect();

    for handle in futures::future::join_all(handles).await {
        handle.unwrap().unwrap();
    }

    let ctx = OperationContext::new();
    assert_eq!(f.ledger.get_account(&ctx, a.id).await.unwrap().balance, 1_000);
    assert_eq!(f.ledger.get_account(&ctx, b.id).await.unwrap().balance, 1_000);
    assert_eq!(f.store.transfers().await.len(), 10);
}

#[tokio::test]
async fn test_cancelled_context_aborts_scope() {
    let f = fixture();
    let a = account(&f, "alice", 100).await;
    let b = account(&f, "bob", 100).await;
    let ctx = OperationContext::new();
    ctx.cancel();

    let err = f
        .ledger
        .transfer_tx(
            &ctx,
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 10,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Cancelled));
    let ctx = OperationContext::new();
    assert_eq!(f.ledger.get_account(&ctx, a.id).await.unwrap().balance, 100);
}

#[tokio::test]
async fn test_dropped_scope_releases_store() {
    let f = fixture();
    let a = account(&f, "alice", 100).await;
    let b = account(&f, "bob", 100).await;

    // Hold a transaction open so the transfer blocks, then time out the caller
    let blocker = f.store.begin(&OperationContext::new()).await.unwrap();
    let ctx = OperationContext::new().with_timeout(Duration::from_millis(20));
    let err = f
        .ledger
        .transfer_tx(
            &ctx,
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 10,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::DeadlineExceeded));
    drop(blocker);

    let result = f
        .ledger
        .transfer_tx(
            &OperationContext::new(),
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 10,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.from_account.balance, 90);
}

// =========================================================================
// Create user
// =========================================================================

#[tokio::test]
async fn test_create_user_enqueues_followup() {
    let f = fixture();

    let result = f
        .ledger
        .create_user_tx(
            &OperationContext::new(),
            user_params("alice").into(),
            verify_email_followup,
        )
        .await
        .unwrap();

    assert_eq!(result.user.username, "alice");
    assert!(!result.user.is_email_verified);
    let info = result.task.unwrap();
    assert_eq!(info.queue, QUEUE_CRITICAL);
    assert_eq!(info.max_retry, 10);

    let pending = f.broker.tasks_in_state(TaskState::Pending);
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].task.decode::<PayloadSendVerifyEmail>().unwrap(),
        PayloadSendVerifyEmail::new("alice")
    );
}

#[tokio::test]
async fn test_duplicate_username_conflicts_without_followup() {
    let f = fixture();
    let ctx = OperationContext::new();
    f.ledger
        .create_user_tx(&ctx, user_params("alice").into(), verify_email_followup)
        .await
        .unwrap();

    let mut duplicate = user_params("alice");
    duplicate.email = "other@example.com".to_string();
    let err = f
        .ledger
        .create_user_tx(&ctx, duplicate.into(), verify_email_followup)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Conflict(_)));
    assert_eq!(f.broker.tasks().len(), 1);
}

#[tokio::test]
async fn test_duplicate_email_conflicts() {
    let f = fixture();
    let ctx = OperationContext::new();
    f.ledger
        .create_user_tx(&ctx, user_params("alice").into(), |_| Ok(None))
        .await
        .unwrap();

    let mut duplicate = user_params("bob");
    duplicate.email = "alice@example.com".to_string();
    let err = f
        .ledger
        .create_user_tx(&ctx, duplicate.into(), |_| Ok(None))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Conflict(ref c) if c == "users_email_key"));
}

#[tokio::test]
async fn test_enqueue_failure_vetoes_user() {
    let f = fixture();
    let ctx = OperationContext::new();
    f.broker.set_unavailable(true);

    let err = f
        .ledger
        .create_user_tx(&ctx, user_params("alice").into(), verify_email_followup)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Enqueue(_)));
    assert!(err.is_retryable());

    f.broker.set_unavailable(false);
    let mut conn = f.store.connect(&ctx).await.unwrap();
    assert!(conn.get_user(&ctx, "alice").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_failed_commit_drops_followup_task() {
    let f = fixture();
    let ctx = OperationContext::new();
    f.store.fail_nth(
        StoreOp::Commit,
        1,
        StoreError::Transient("connection reset".to_string()),
    );

    let err = f
        .ledger
        .create_user_tx(&ctx, user_params("alice").into(), verify_email_followup)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(f.broker.tasks().is_empty());

    let mut conn = f.store.connect(&ctx).await.unwrap();
    assert!(conn.get_user(&ctx, "alice").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_followup_is_not_leasable_before_commit() {
    let f = fixture();
    let broker = f.broker.clone();

    let result = f
        .ledger
        .exec_tx(&OperationContext::new(), move |q, ctx| {
            Box::pin(async move {
                q.create_user(ctx, &user_params("alice")).await?;
                let request = PayloadSendVerifyEmail::new("alice")
                    .to_request(TaskOptions::new())
                    .map_err(DistributeError::from)?;
                let info = q.enqueue_task(ctx, &request.task, &request.options).await?;
                Ok((info, broker.tasks().len()))
            })
        })
        .await
        .unwrap();

    let (info, visible_inside) = result;
    assert_eq!(visible_inside, 0);
    assert_eq!(f.broker.get(info.id).unwrap().state, TaskState::Pending);
}

#[tokio::test]
async fn test_scope_error_discards_enqueued_task() {
    let f = fixture();

    let err = f
        .ledger
        .exec_tx(&OperationContext::new(), |q, ctx| {
            Box::pin(async move {
                let request = PayloadSendVerifyEmail::new("alice")
                    .to_request(TaskOptions::new())
                    .map_err(DistributeError::from)?;
                q.enqueue_task(ctx, &request.task, &request.options).await?;
                Err::<(), _>(LedgerError::Internal("abort".to_string()))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Internal(_)));
    assert!(f.broker.tasks().is_empty());
}

// =========================================================================
// Verify email
// =========================================================================

async fn issue_verify_email(f: &Fixture, username: &str) -> (i64, String) {
    let ctx = OperationContext::new();
    let mut conn = f.store.connect(&ctx).await.unwrap();
    let record = conn
        .create_verify_email(
            &ctx,
            &CreateVerifyEmailParams {
                username: username.to_string(),
                email: format!("{}@example.com", username),
                secret_code: random_string(32),
            },
        )
        .await
        .unwrap();
    (record.id, record.secret_code)
}

#[tokio::test]
async fn test_verify_email_is_one_shot() {
    let f = fixture();
    let ctx = OperationContext::new();
    f.ledger
        .create_user_tx(&ctx, user_params("alice").into(), |_| Ok(None))
        .await
        .unwrap();
    let (email_id, secret_code) = issue_verify_email(&f, "alice").await;
    let params = VerifyEmailTxParams {
        email_id,
        secret_code,
    };

    let result = f.ledger.verify_email_tx(&ctx, params.clone()).await.unwrap();
    assert!(result.user.is_email_verified);
    assert!(result.verify_email.is_used);

    let err = f.ledger.verify_email_tx(&ctx, params).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));

    let mut conn = f.store.connect(&ctx).await.unwrap();
    assert!(conn.get_user(&ctx, "alice").await.unwrap().is_email_verified);
}

#[tokio::test]
async fn test_wrong_secret_does_not_verify() {
    let f = fixture();
    let ctx = OperationContext::new();
    f.ledger
        .create_user_tx(&ctx, user_params("alice").into(), |_| Ok(None))
        .await
        .unwrap();
    let (email_id, _) = issue_verify_email(&f, "alice").await;

    let err = f
        .ledger
        .verify_email_tx(
            &ctx,
            VerifyEmailTxParams {
                email_id,
                secret_code: "x".repeat(32),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));

    let mut conn = f.store.connect(&ctx).await.unwrap();
    assert!(!conn.get_user(&ctx, "alice").await.unwrap().is_email_verified);
    let record = conn.get_verify_email(&ctx, email_id).await.unwrap();
    assert!(!record.is_used);
}

#[tokio::test]
async fn test_user_update_failure_keeps_record_unused() {
    let f = fixture();
    let ctx = OperationContext::new();
    f.ledger
        .create_user_tx(&ctx, user_params("alice").into(), |_| Ok(None))
        .await
        .unwrap();
    let (email_id, secret_code) = issue_verify_email(&f, "alice").await;
    f.store.fail_nth(
        StoreOp::UpdateUser,
        1,
        StoreError::Transient("connection reset".to_string()),
    );

    let err = f
        .ledger
        .verify_email_tx(
            &ctx,
            VerifyEmailTxParams {
                email_id,
                secret_code: secret_code.clone(),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // The consumed flag rolled back with the scope, so a retry succeeds
    let mut conn = f.store.connect(&ctx).await.unwrap();
    let record = conn
        .update_verify_email(
            &ctx,
            &UpdateVerifyEmailParams {
                id: email_id,
                secret_code,
            },
        )
        .await
        .unwrap();
    assert!(record.is_used);
}
