//! In-process broker
//!
//! Same lease semantics as the PostgreSQL broker without durability.
//! Used by tests and by local runs without a database.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::OperationContext;
use crate::store::{StoreError, StoreResult};

use super::{Broker, LeasedTask, Task, TaskInfo, TaskOptions, TaskState};

/// Snapshot of a task as the broker holds it
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub queue: String,
    pub task: Task,
    pub state: TaskState,
    pub retried: u32,
    pub max_retry: u32,
    pub timeout: Duration,
    pub process_at: DateTime<Utc>,
    pub leased_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BrokerState {
    tasks: BTreeMap<i64, TaskRecord>,
    /// Enqueued inside an open store scope, invisible until it commits
    staged: BTreeMap<i64, TaskRecord>,
    last_id: i64,
    unavailable: bool,
}

impl BrokerState {
    fn new_record(&mut self, task: &Task, options: &TaskOptions) -> (TaskRecord, TaskInfo) {
        self.last_id += 1;
        let record = TaskRecord {
            id: self.last_id,
            queue: options.queue.clone(),
            task: task.clone(),
            state: TaskState::Pending,
            retried: 0,
            max_retry: options.max_retry,
            timeout: options.timeout,
            process_at: options.process_at(),
            leased_at: None,
            last_error: None,
            updated_at: Utc::now(),
        };
        let info = TaskInfo {
            id: record.id,
            kind: task.kind.clone(),
            queue: record.queue.clone(),
            max_retry: record.max_retry,
            process_at: record.process_at,
            state: record.state,
        };
        (record, info)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the broker were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.lock().tasks.values().cloned().collect()
    }

    pub fn tasks_in_state(&self, state: TaskState) -> Vec<TaskRecord> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: i64) -> Option<TaskRecord> {
        self.lock().tasks.get(&id).cloned()
    }

    /// Make a scheduled task due now
    pub fn make_due(&self, id: i64) {
        if let Some(record) = self.lock().tasks.get_mut(&id) {
            record.process_at = Utc::now();
        }
    }

    /// Enqueue on behalf of an open store scope. The task stays out of
    /// `dequeue` until `publish` and is dropped by `discard`.
    pub(crate) fn stage(
        &self,
        ctx: &OperationContext,
        task: &Task,
        options: &TaskOptions,
    ) -> StoreResult<TaskInfo> {
        let mut state = self.open(ctx)?;
        let (record, info) = state.new_record(task, options);
        state.staged.insert(record.id, record);
        Ok(info)
    }

    pub(crate) fn publish(&self, ids: &[i64]) {
        let mut state = self.lock();
        for id in ids {
            if let Some(record) = state.staged.remove(id) {
                state.tasks.insert(*id, record);
            }
        }
    }

    pub(crate) fn discard(&self, ids: &[i64]) {
        let mut state = self.lock();
        for id in ids {
            state.staged.remove(id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self, ctx: &OperationContext) -> StoreResult<MutexGuard<'_, BrokerState>> {
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let state = self.lock();
        if state.unavailable {
            return Err(StoreError::Transient("broker unavailable".to_string()));
        }
        Ok(state)
    }

    fn purge_state(
        &self,
        ctx: &OperationContext,
        target: TaskState,
        before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.open(ctx)?;
        let count = state.tasks.len();
        state
            .tasks
            .retain(|_, t| !(t.state == target && t.updated_at < before));
        Ok((count - state.tasks.len()) as u64)
    }

    fn update(
        &self,
        ctx: &OperationContext,
        id: i64,
        f: impl FnOnce(&mut TaskRecord),
    ) -> StoreResult<()> {
        let mut state = self.open(ctx)?;
        let record = state.tasks.get_mut(&id).ok_or(StoreError::NotFound)?;
        f(record);
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(
        &self,
        ctx: &OperationContext,
        task: &Task,
        options: &TaskOptions,
    ) -> StoreResult<TaskInfo> {
        let mut state = self.open(ctx)?;
        let (record, info) = state.new_record(task, options);
        state.tasks.insert(record.id, record);
        Ok(info)
    }

    async fn dequeue(
        &self,
        ctx: &OperationContext,
        queue: &str,
    ) -> StoreResult<Option<LeasedTask>> {
        let mut state = self.open(ctx)?;
        let now = Utc::now();
        let next = state
            .tasks
            .values_mut()
            .filter(|t| {
                t.queue == queue
                    && matches!(t.state, TaskState::Pending | TaskState::Retry)
                    && t.process_at <= now
            })
            .min_by_key(|t| (t.process_at, t.id));

        Ok(next.map(|record| {
            record.state = TaskState::Active;
            record.leased_at = Some(now);
            record.updated_at = now;
            LeasedTask {
                id: record.id,
                task: record.task.clone(),
                queue: record.queue.clone(),
                retried: record.retried,
                max_retry: record.max_retry,
                timeout: record.timeout,
            }
        }))
    }

    async fn complete(&self, ctx: &OperationContext, id: i64) -> StoreResult<()> {
        self.update(ctx, id, |record| {
            record.state = TaskState::Completed;
            record.leased_at = None;
        })
    }

    async fn retry(
        &self,
        ctx: &OperationContext,
        id: i64,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        self.update(ctx, id, |record| {
            record.state = TaskState::Retry;
            record.retried += 1;
            record.process_at = process_at;
            record.leased_at = None;
            record.last_error = Some(error.to_string());
        })
    }

    async fn archive(&self, ctx: &OperationContext, id: i64, error: &str) -> StoreResult<()> {
        self.update(ctx, id, |record| {
            record.state = TaskState::Archived;
            record.leased_at = None;
            record.last_error = Some(error.to_string());
        })
    }

    async fn recover_stale(&self, ctx: &OperationContext, grace: Duration) -> StoreResult<u64> {
        let mut state = self.open(ctx)?;
        let now = Utc::now();
        let mut recovered = 0;
        for record in state.tasks.values_mut() {
            let Some(leased_at) = record.leased_at else {
                continue;
            };
            if record.state != TaskState::Active {
                continue;
            }
            let lease = chrono::Duration::from_std(record.timeout + grace)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            if leased_at + lease >= now {
                continue;
            }
            record.leased_at = None;
            record.updated_at = now;
            record.last_error = Some("lease expired".to_string());
            if record.retried >= record.max_retry {
                record.state = TaskState::Archived;
            } else {
                record.state = TaskState::Retry;
                record.retried += 1;
                record.process_at = now;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn purge_archived(
        &self,
        ctx: &OperationContext,
        before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.purge_state(ctx, TaskState::Archived, before)
    }

    async fn purge_completed(
        &self,
        ctx: &OperationContext,
        before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.purge_state(ctx, TaskState::Completed, before)
    }
}
