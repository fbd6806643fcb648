//! PostgreSQL store
//!
//! `PgQueries` runs the SQL over any connection-like handle, so pooled
//! connections and open transactions share one implementation.

use std::ops::DerefMut;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::domain::OperationContext;
use crate::worker::{insert_task, Task, TaskInfo, TaskOptions};

use super::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry, Querier, Store,
    StoreError, StoreResult, StoreTx, Transfer, UpdateUserParams, UpdateVerifyEmailParams, User,
    VerifyEmail,
};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str =
    "username, hashed_password, full_name, email, is_email_verified, password_changed_at, created_at";
const VERIFY_EMAIL_COLUMNS: &str =
    "id, username, email, secret_code, is_used, created_at, expired_at";

/// Store backed by a PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new PgStore with a database pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self, ctx: &OperationContext) -> StoreResult<Box<dyn StoreTx>> {
        let tx = ctx
            .guard(async { self.pool.begin().await.map_err(StoreError::from) })
            .await?;
        Ok(Box::new(PgQueries::new(tx)))
    }

    async fn connect(&self, ctx: &OperationContext) -> StoreResult<Box<dyn Querier>> {
        let conn = ctx
            .guard(async { self.pool.acquire().await.map_err(StoreError::from) })
            .await?;
        Ok(Box::new(PgQueries::<PoolConnection<Postgres>>::new(conn)))
    }
}

/// Query bindings over a single connection or transaction
pub struct PgQueries<C> {
    conn: C,
}

impl<C> PgQueries<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StoreTx for PgQueries<Transaction<'static, Postgres>> {
    fn queries(&mut self) -> &mut dyn Querier {
        self
    }

    async fn commit(self: Box<Self>, ctx: &OperationContext) -> StoreResult<()> {
        let tx = self.conn;
        // A commit abandoned by cancellation drops `tx`, which rolls back
        ctx.guard(async move { tx.commit().await.map_err(StoreError::from) })
            .await
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.conn.rollback().await.map_err(StoreError::from)
    }
}

#[async_trait]
impl<C> Querier for PgQueries<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn create_account(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateAccountParams,
    ) -> StoreResult<Account> {
        let sql = format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, Account>(&sql)
                .bind(&arg.owner)
                .bind(arg.balance)
                .bind(&arg.currency)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn get_account(&mut self, ctx: &OperationContext, id: i64) -> StoreResult<Account> {
        let sql = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, Account>(&sql)
                .bind(id)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn add_account_balance(
        &mut self,
        ctx: &OperationContext,
        arg: &AddAccountBalanceParams,
    ) -> StoreResult<Account> {
        // Row lock is taken here and held until the enclosing scope ends
        let sql = format!(
            "UPDATE accounts SET balance = balance + $2 WHERE id = $1 RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, Account>(&sql)
                .bind(arg.id)
                .bind(arg.amount)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn create_entry(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateEntryParams,
    ) -> StoreResult<Entry> {
        let sql = format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {}",
            ENTRY_COLUMNS
        );
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, Entry>(&sql)
                .bind(arg.account_id)
                .bind(arg.amount)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn get_entry(&mut self, ctx: &OperationContext, id: i64) -> StoreResult<Entry> {
        let sql = format!("SELECT {} FROM entries WHERE id = $1", ENTRY_COLUMNS);
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, Entry>(&sql)
                .bind(id)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn create_transfer(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateTransferParams,
    ) -> StoreResult<Transfer> {
        let sql = format!(
            r#"
            INSERT INTO transfers (from_account_id, to_account_id, amount)
            VALUES ($1, $2, $3)
            RETURNING {}
            "#,
            TRANSFER_COLUMNS
        );
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, Transfer>(&sql)
                .bind(arg.from_account_id)
                .bind(arg.to_account_id)
                .bind(arg.amount)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn get_transfer(&mut self, ctx: &OperationContext, id: i64) -> StoreResult<Transfer> {
        let sql = format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS);
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, Transfer>(&sql)
                .bind(id)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn create_user(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateUserParams,
    ) -> StoreResult<User> {
        let sql = format!(
            r#"
            INSERT INTO users (username, hashed_password, full_name, email)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, User>(&sql)
                .bind(&arg.username)
                .bind(&arg.hashed_password)
                .bind(&arg.full_name)
                .bind(&arg.email)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn get_user(&mut self, ctx: &OperationContext, username: &str) -> StoreResult<User> {
        let sql = format!("SELECT {} FROM users WHERE username = $1", USER_COLUMNS);
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, User>(&sql)
                .bind(username)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn update_user(
        &mut self,
        ctx: &OperationContext,
        arg: &UpdateUserParams,
    ) -> StoreResult<User> {
        // The verified flag only ever moves from false to true
        let sql = format!(
            r#"
            UPDATE users SET
                hashed_password = COALESCE($2, hashed_password),
                password_changed_at = COALESCE($3, password_changed_at),
                full_name = COALESCE($4, full_name),
                email = COALESCE($5, email),
                is_email_verified = is_email_verified OR COALESCE($6, FALSE)
            WHERE username = $1
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, User>(&sql)
                .bind(&arg.username)
                .bind(&arg.hashed_password)
                .bind(arg.password_changed_at)
                .bind(&arg.full_name)
                .bind(&arg.email)
                .bind(arg.is_email_verified)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn create_verify_email(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail> {
        let sql = format!(
            r#"
            INSERT INTO verify_emails (username, email, secret_code)
            VALUES ($1, $2, $3)
            RETURNING {}
            "#,
            VERIFY_EMAIL_COLUMNS
        );
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, VerifyEmail>(&sql)
                .bind(&arg.username)
                .bind(&arg.email)
                .bind(&arg.secret_code)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn get_verify_email(
        &mut self,
        ctx: &OperationContext,
        id: i64,
    ) -> StoreResult<VerifyEmail> {
        let sql = format!("SELECT {} FROM verify_emails WHERE id = $1", VERIFY_EMAIL_COLUMNS);
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, VerifyEmail>(&sql)
                .bind(id)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn update_verify_email(
        &mut self,
        ctx: &OperationContext,
        arg: &UpdateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail> {
        // Secret comparison lives in the predicate, never in a prior read
        let sql = format!(
            r#"
            UPDATE verify_emails SET is_used = TRUE
            WHERE id = $1
              AND secret_code = $2
              AND is_used = FALSE
              AND expired_at > NOW()
            RETURNING {}
            "#,
            VERIFY_EMAIL_COLUMNS
        );
        let conn = &mut *self.conn;
        ctx.guard(async move {
            sqlx::query_as::<_, VerifyEmail>(&sql)
                .bind(arg.id)
                .bind(&arg.secret_code)
                .fetch_one(conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn enqueue_task(
        &mut self,
        ctx: &OperationContext,
        task: &Task,
        options: &TaskOptions,
    ) -> StoreResult<TaskInfo> {
        let conn = &mut *self.conn;
        ctx.guard(insert_task(conn, task, options)).await
    }
}
