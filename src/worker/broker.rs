//! Broker abstraction
//!
//! A broker durably holds tasks between the distributor and the processor.
//! Every dequeue is a lease: the task stays `active` until the worker
//! reports back, and the recoverer hands expired leases out again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::OperationContext;
use crate::store::StoreResult;

use super::{LeasedTask, Task, TaskInfo, TaskOptions};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Persist a task; it becomes visible at `options.process_at()`
    async fn enqueue(
        &self,
        ctx: &OperationContext,
        task: &Task,
        options: &TaskOptions,
    ) -> StoreResult<TaskInfo>;

    /// Lease the oldest due task on `queue`, if any
    async fn dequeue(&self, ctx: &OperationContext, queue: &str)
        -> StoreResult<Option<LeasedTask>>;

    async fn complete(&self, ctx: &OperationContext, id: i64) -> StoreResult<()>;

    /// Release the lease and schedule another attempt
    async fn retry(
        &self,
        ctx: &OperationContext,
        id: i64,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()>;

    /// Terminal failure
    async fn archive(&self, ctx: &OperationContext, id: i64, error: &str) -> StoreResult<()>;

    /// Hand out again every lease older than the task's timeout plus `grace`.
    /// Returns how many tasks were recovered.
    async fn recover_stale(&self, ctx: &OperationContext, grace: Duration) -> StoreResult<u64>;

    /// Delete archived tasks last touched before `before`
    async fn purge_archived(
        &self,
        ctx: &OperationContext,
        before: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Delete completed tasks last touched before `before`
    async fn purge_completed(
        &self,
        ctx: &OperationContext,
        before: DateTime<Utc>,
    ) -> StoreResult<u64>;
}
