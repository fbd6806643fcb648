//! In-memory store
//!
//! Same semantics as the PostgreSQL store, for tests and local development.
//! Transactions are serialized behind one lock and roll back by restoring a
//! snapshot taken at `begin`. Faults can be injected per operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::OperationContext;
use crate::worker::{Broker, MemoryBroker, Task, TaskInfo, TaskOptions};

use super::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry, Querier, Store,
    StoreError, StoreResult, StoreTx, Transfer, UpdateUserParams, UpdateVerifyEmailParams, User,
    VerifyEmail,
};

/// Operations a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Begin,
    Commit,
    CreateAccount,
    GetAccount,
    AddAccountBalance,
    CreateEntry,
    GetEntry,
    CreateTransfer,
    GetTransfer,
    CreateUser,
    GetUser,
    UpdateUser,
    CreateVerifyEmail,
    GetVerifyEmail,
    UpdateVerifyEmail,
    EnqueueTask,
}

#[derive(Debug, Clone)]
struct Tables {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
    last_id: i64,
    verify_email_ttl: Duration,
}

impl Tables {
    fn new(verify_email_ttl: Duration) -> Self {
        Self {
            users: BTreeMap::new(),
            accounts: BTreeMap::new(),
            entries: BTreeMap::new(),
            transfers: BTreeMap::new(),
            verify_emails: BTreeMap::new(),
            last_id: 0,
            verify_email_ttl,
        }
    }

    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn create_account(&mut self, arg: &CreateAccountParams) -> StoreResult<Account> {
        if !self.users.contains_key(&arg.owner) {
            return Err(StoreError::NotFound);
        }
        if self
            .accounts
            .values()
            .any(|a| a.owner == arg.owner && a.currency == arg.currency)
        {
            return Err(StoreError::conflict("accounts_owner_currency_key"));
        }
        if arg.balance < 0 {
            return Err(StoreError::check_violation("accounts_balance_non_negative"));
        }

        let account = Account {
            id: self.next_id(),
            owner: arg.owner.clone(),
            balance: arg.balance,
            currency: arg.currency.clone(),
            created_at: Utc::now(),
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn add_account_balance(&mut self, arg: &AddAccountBalanceParams) -> StoreResult<Account> {
        let account = self.accounts.get_mut(&arg.id).ok_or(StoreError::NotFound)?;
        let balance = account
            .balance
            .checked_add(arg.amount)
            .ok_or_else(|| StoreError::Internal("balance overflow".to_string()))?;
        if balance < 0 {
            return Err(StoreError::check_violation("accounts_balance_non_negative"));
        }
        account.balance = balance;
        Ok(account.clone())
    }

    fn create_entry(&mut self, arg: &CreateEntryParams) -> StoreResult<Entry> {
        if !self.accounts.contains_key(&arg.account_id) {
            return Err(StoreError::NotFound);
        }
        let entry = Entry {
            id: self.next_id(),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn create_transfer(&mut self, arg: &CreateTransferParams) -> StoreResult<Transfer> {
        if !self.accounts.contains_key(&arg.from_account_id)
            || !self.accounts.contains_key(&arg.to_account_id)
        {
            return Err(StoreError::NotFound);
        }
        if arg.amount <= 0 {
            return Err(StoreError::check_violation("transfers_amount_check"));
        }
        let transfer = Transfer {
            id: self.next_id(),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    fn create_user(&mut self, arg: &CreateUserParams) -> StoreResult<User> {
        if self.users.contains_key(&arg.username) {
            return Err(StoreError::conflict("users_pkey"));
        }
        if self.users.values().any(|u| u.email == arg.email) {
            return Err(StoreError::conflict("users_email_key"));
        }
        let user = User {
            username: arg.username.clone(),
            hashed_password: arg.hashed_password.clone(),
            full_name: arg.full_name.clone(),
            email: arg.email.clone(),
            is_email_verified: false,
            password_changed_at: DateTime::<Utc>::MIN_UTC,
            created_at: Utc::now(),
        };
        self.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    fn update_user(&mut self, arg: &UpdateUserParams) -> StoreResult<User> {
        if let Some(email) = &arg.email {
            if self
                .users
                .values()
                .any(|u| &u.email == email && u.username != arg.username)
            {
                return Err(StoreError::conflict("users_email_key"));
            }
        }

        let user = self.users.get_mut(&arg.username).ok_or(StoreError::NotFound)?;
        if let Some(hashed_password) = &arg.hashed_password {
            user.hashed_password = hashed_password.clone();
        }
        if let Some(changed_at) = arg.password_changed_at {
            user.password_changed_at = changed_at;
        }
        if let Some(full_name) = &arg.full_name {
            user.full_name = full_name.clone();
        }
        if let Some(email) = &arg.email {
            user.email = email.clone();
        }
        user.is_email_verified = user.is_email_verified || arg.is_email_verified.unwrap_or(false);
        Ok(user.clone())
    }

    fn create_verify_email(&mut self, arg: &CreateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        if !self.users.contains_key(&arg.username) {
            return Err(StoreError::NotFound);
        }
        let now = Utc::now();
        let record = VerifyEmail {
            id: self.next_id(),
            username: arg.username.clone(),
            email: arg.email.clone(),
            secret_code: arg.secret_code.clone(),
            is_used: false,
            created_at: now,
            expired_at: now + self.verify_email_ttl,
        };
        self.verify_emails.insert(record.id, record.clone());
        Ok(record)
    }

    fn update_verify_email(&mut self, arg: &UpdateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        let now = Utc::now();
        match self.verify_emails.get_mut(&arg.id) {
            Some(record)
                if record.secret_code == arg.secret_code
                    && !record.is_used
                    && record.expired_at > now =>
            {
                record.is_used = true;
                Ok(record.clone())
            }
            _ => Err(StoreError::NotFound),
        }
    }
}

struct Fault {
    op: StoreOp,
    at_call: usize,
    error: StoreError,
}

#[derive(Default)]
struct FaultPlan {
    calls: HashMap<StoreOp, usize>,
    faults: Vec<Fault>,
    balance_updates: Vec<i64>,
}

impl FaultPlan {
    fn trip(&mut self, op: StoreOp) -> StoreResult<()> {
        let call = self.calls.entry(op).or_insert(0);
        *call += 1;
        let call = *call;

        match self
            .faults
            .iter()
            .position(|f| f.op == op && f.at_call == call)
        {
            Some(idx) => Err(self.faults.remove(idx).error),
            None => Ok(()),
        }
    }
}

/// In-process store with serialized transactions
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<StdMutex<FaultPlan>>,
    broker: Option<MemoryBroker>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::new(Duration::minutes(15)))),
            faults: Arc::new(StdMutex::new(FaultPlan::default())),
            broker: None,
        }
    }

    /// Route `enqueue_task` into `broker`, publishing scoped tasks on commit
    pub fn with_broker(mut self, broker: MemoryBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Lifetime of newly created verification records
    pub async fn set_verify_email_ttl(&self, ttl: Duration) {
        self.tables.lock().await.verify_email_ttl = ttl;
    }

    /// Make the `nth` upcoming call of `op` (1-based) fail with `error`
    pub fn fail_nth(&self, op: StoreOp, nth: usize, error: StoreError) {
        let mut plan = self.plan();
        let at_call = plan.calls.get(&op).copied().unwrap_or(0) + nth;
        plan.faults.push(Fault { op, at_call, error });
    }

    pub async fn entries_for_account(&self, account_id: i64) -> Vec<Entry> {
        self.tables
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    pub async fn transfers(&self) -> Vec<Transfer> {
        self.tables.lock().await.transfers.values().cloned().collect()
    }

    pub async fn verify_emails_for(&self, username: &str) -> Vec<VerifyEmail> {
        self.tables
            .lock()
            .await
            .verify_emails
            .values()
            .filter(|v| v.username == username)
            .cloned()
            .collect()
    }

    /// Account ids in the order their balances were updated, across all scopes
    pub fn balance_update_order(&self) -> Vec<i64> {
        self.plan().balance_updates.clone()
    }

    fn trip(&self, op: StoreOp) -> StoreResult<()> {
        self.plan().trip(op)
    }

    fn plan(&self) -> std::sync::MutexGuard<'_, FaultPlan> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, ctx: &OperationContext) -> StoreResult<Box<dyn StoreTx>> {
        self.trip(StoreOp::Begin)?;
        let tables = self.tables.clone();
        let guard = ctx.guard(async move { Ok(tables.lock_owned().await) }).await?;
        let snapshot = guard.clone();

        Ok(Box::new(MemoryQueries {
            handle: Handle::Tx {
                guard,
                snapshot: Some(snapshot),
            },
            store: self.clone(),
            staged: Vec::new(),
        }))
    }

    async fn connect(&self, _ctx: &OperationContext) -> StoreResult<Box<dyn Querier>> {
        Ok(Box::new(MemoryQueries {
            handle: Handle::Conn(self.tables.clone()),
            store: self.clone(),
            staged: Vec::new(),
        }))
    }
}

enum Handle {
    /// Holds the store lock until commit or rollback
    Tx {
        guard: OwnedMutexGuard<Tables>,
        snapshot: Option<Tables>,
    },
    /// Locks per statement
    Conn(Arc<Mutex<Tables>>),
}

/// Query handle over the in-memory tables
pub struct MemoryQueries {
    handle: Handle,
    store: MemoryStore,
    /// Task ids staged in the broker by this scope
    staged: Vec<i64>,
}

impl MemoryQueries {
    async fn run<T, F>(&mut self, ctx: &OperationContext, op: StoreOp, f: F) -> StoreResult<T>
    where
        T: Send,
        F: FnOnce(&mut Tables) -> StoreResult<T> + Send,
    {
        // Let concurrent scopes interleave the way a network round-trip would
        tokio::task::yield_now().await;
        self.store.trip(op)?;

        match &mut self.handle {
            Handle::Tx { guard, .. } => {
                if ctx.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
                f(&mut **guard)
            }
            Handle::Conn(tables) => {
                let mut tables = ctx.guard(async { Ok(tables.lock().await) }).await?;
                f(&mut *tables)
            }
        }
    }
}

impl Drop for MemoryQueries {
    fn drop(&mut self) {
        if let Handle::Tx { guard, snapshot } = &mut self.handle {
            if let Some(snapshot) = snapshot.take() {
                **guard = snapshot;
                if let Some(broker) = &self.store.broker {
                    broker.discard(&self.staged);
                }
            }
        }
    }
}

#[async_trait]
impl StoreTx for MemoryQueries {
    fn queries(&mut self) -> &mut dyn Querier {
        self
    }

    async fn commit(self: Box<Self>, ctx: &OperationContext) -> StoreResult<()> {
        let mut this = self;
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        this.store.trip(StoreOp::Commit)?;
        if let Handle::Tx { snapshot, .. } = &mut this.handle {
            snapshot.take();
        }
        if let Some(broker) = &this.store.broker {
            broker.publish(&this.staged);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        // Drop restores the snapshot
        Ok(())
    }
}

#[async_trait]
impl Querier for MemoryQueries {
    async fn create_account(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateAccountParams,
    ) -> StoreResult<Account> {
        self.run(ctx, StoreOp::CreateAccount, |t| t.create_account(arg))
            .await
    }

    async fn get_account(&mut self, ctx: &OperationContext, id: i64) -> StoreResult<Account> {
        self.run(ctx, StoreOp::GetAccount, |t| {
            t.accounts.get(&id).cloned().ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn add_account_balance(
        &mut self,
        ctx: &OperationContext,
        arg: &AddAccountBalanceParams,
    ) -> StoreResult<Account> {
        let account = self
            .run(ctx, StoreOp::AddAccountBalance, |t| t.add_account_balance(arg))
            .await?;
        self.store.plan().balance_updates.push(account.id);
        Ok(account)
    }

    async fn create_entry(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateEntryParams,
    ) -> StoreResult<Entry> {
        self.run(ctx, StoreOp::CreateEntry, |t| t.create_entry(arg)).await
    }

    async fn get_entry(&mut self, ctx: &OperationContext, id: i64) -> StoreResult<Entry> {
        self.run(ctx, StoreOp::GetEntry, |t| {
            t.entries.get(&id).cloned().ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn create_transfer(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateTransferParams,
    ) -> StoreResult<Transfer> {
        self.run(ctx, StoreOp::CreateTransfer, |t| t.create_transfer(arg))
            .await
    }

    async fn get_transfer(&mut self, ctx: &OperationContext, id: i64) -> StoreResult<Transfer> {
        self.run(ctx, StoreOp::GetTransfer, |t| {
            t.transfers.get(&id).cloned().ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn create_user(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateUserParams,
    ) -> StoreResult<User> {
        self.run(ctx, StoreOp::CreateUser, |t| t.create_user(arg)).await
    }

    async fn get_user(&mut self, ctx: &OperationContext, username: &str) -> StoreResult<User> {
        self.run(ctx, StoreOp::GetUser, |t| {
            t.users.get(username).cloned().ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn update_user(
        &mut self,
        ctx: &OperationContext,
        arg: &UpdateUserParams,
    ) -> StoreResult<User> {
        self.run(ctx, StoreOp::UpdateUser, |t| t.update_user(arg)).await
    }

    async fn create_verify_email(
        &mut self,
        ctx: &OperationContext,
        arg: &CreateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail> {
        self.run(ctx, StoreOp::CreateVerifyEmail, |t| t.create_verify_email(arg))
            .await
    }

    async fn get_verify_email(
        &mut self,
        ctx: &OperationContext,
        id: i64,
    ) -> StoreResult<VerifyEmail> {
        self.run(ctx, StoreOp::GetVerifyEmail, |t| {
            t.verify_emails.get(&id).cloned().ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn update_verify_email(
        &mut self,
        ctx: &OperationContext,
        arg: &UpdateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail> {
        self.run(ctx, StoreOp::UpdateVerifyEmail, |t| t.update_verify_email(arg))
            .await
    }

    async fn enqueue_task(
        &mut self,
        ctx: &OperationContext,
        task: &Task,
        options: &TaskOptions,
    ) -> StoreResult<TaskInfo> {
        tokio::task::yield_now().await;
        self.store.trip(StoreOp::EnqueueTask)?;
        let broker = self
            .store
            .broker
            .clone()
            .ok_or_else(|| StoreError::Internal("no broker attached to store".to_string()))?;

        match self.handle {
            Handle::Tx { .. } => {
                let info = broker.stage(ctx, task, options)?;
                self.staged.push(info.id);
                Ok(info)
            }
            Handle::Conn(_) => broker.enqueue(ctx, task, options).await,
        }
    }
}
