//! PostgreSQL broker
//!
//! Tasks live in the `tasks` table. Dequeue claims one due row with
//! `FOR UPDATE SKIP LOCKED`, so concurrent workers never lease the same task.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgExecutor, PgPool};

use crate::domain::OperationContext;
use crate::store::{StoreError, StoreResult};

use super::{Broker, LeasedTask, Task, TaskInfo, TaskOptions, TaskState};

#[derive(Debug, FromRow)]
struct TaskRow {
    id: i64,
    queue: String,
    kind: String,
    payload: serde_json::Value,
    retried: i32,
    max_retry: i32,
    timeout_ms: i64,
}

impl From<TaskRow> for LeasedTask {
    fn from(row: TaskRow) -> Self {
        LeasedTask {
            id: row.id,
            task: Task::new(row.kind, row.payload),
            queue: row.queue,
            retried: u32::try_from(row.retried).unwrap_or(0),
            max_retry: u32::try_from(row.max_retry).unwrap_or(0),
            timeout: Duration::from_millis(u64::try_from(row.timeout_ms).unwrap_or(0)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Insert a pending task through `executor`. Run on a transaction, the task
/// commits or rolls back with it.
pub(crate) async fn insert_task<'e, E>(
    executor: E,
    task: &Task,
    options: &TaskOptions,
) -> StoreResult<TaskInfo>
where
    E: PgExecutor<'e>,
{
    let process_at = options.process_at();
    let max_retry = i32::try_from(options.max_retry).unwrap_or(i32::MAX);
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO tasks (queue, kind, payload, max_retry, timeout_ms, process_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(&options.queue)
    .bind(&task.kind)
    .bind(&task.payload)
    .bind(max_retry)
    .bind(millis(options.timeout))
    .bind(process_at)
    .fetch_one(executor)
    .await
    .map_err(StoreError::from)?;

    Ok(TaskInfo {
        id,
        kind: task.kind.clone(),
        queue: options.queue.clone(),
        max_retry: options.max_retry,
        process_at,
        state: TaskState::Pending,
    })
}

#[async_trait]
impl Broker for PgBroker {
    async fn enqueue(
        &self,
        ctx: &OperationContext,
        task: &Task,
        options: &TaskOptions,
    ) -> StoreResult<TaskInfo> {
        ctx.guard(insert_task(&self.pool, task, options)).await
    }

    async fn dequeue(
        &self,
        ctx: &OperationContext,
        queue: &str,
    ) -> StoreResult<Option<LeasedTask>> {
        let row: Option<TaskRow> = ctx
            .guard(async {
                sqlx::query_as(
                    r#"
                    UPDATE tasks SET state = 'active', leased_at = NOW(), updated_at = NOW()
                    WHERE id = (
                        SELECT id FROM tasks
                        WHERE queue = $1
                          AND state IN ('pending', 'retry')
                          AND process_at <= NOW()
                        ORDER BY process_at, id
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    RETURNING id, queue, kind, payload, retried, max_retry, timeout_ms
                    "#,
                )
                .bind(queue)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)
            })
            .await?;

        Ok(row.map(LeasedTask::from))
    }

    async fn complete(&self, ctx: &OperationContext, id: i64) -> StoreResult<()> {
        ctx.guard(async {
            sqlx::query(
                r#"
                UPDATE tasks SET state = 'completed', leased_at = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)
        })
        .await
        .and_then(expect_one_row)
    }

    async fn retry(
        &self,
        ctx: &OperationContext,
        id: i64,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        ctx.guard(async {
            sqlx::query(
                r#"
                UPDATE tasks SET
                    state = 'retry',
                    retried = retried + 1,
                    process_at = $2,
                    last_error = $3,
                    leased_at = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(process_at)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)
        })
        .await
        .and_then(expect_one_row)
    }

    async fn archive(&self, ctx: &OperationContext, id: i64, error: &str) -> StoreResult<()> {
        ctx.guard(async {
            sqlx::query(
                r#"
                UPDATE tasks SET
                    state = 'archived',
                    last_error = $2,
                    leased_at = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)
        })
        .await
        .and_then(expect_one_row)
    }

    async fn recover_stale(&self, ctx: &OperationContext, grace: Duration) -> StoreResult<u64> {
        let result = ctx
            .guard(async {
                sqlx::query(
                    r#"
                    UPDATE tasks SET
                        state = CASE WHEN retried >= max_retry THEN 'archived' ELSE 'retry' END,
                        retried = CASE WHEN retried >= max_retry THEN retried ELSE retried + 1 END,
                        process_at = NOW(),
                        last_error = 'lease expired',
                        leased_at = NULL,
                        updated_at = NOW()
                    WHERE state = 'active'
                      AND leased_at + (timeout_ms + $1)::DOUBLE PRECISION * INTERVAL '1 millisecond' < NOW()
                    "#,
                )
                .bind(millis(grace))
                .execute(&self.pool)
                .await
                .map_err(StoreError::from)
            })
            .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!(recovered = recovered, "Recovered tasks with expired leases");
        }
        Ok(recovered)
    }

    async fn purge_archived(
        &self,
        ctx: &OperationContext,
        before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = ctx
            .guard(async {
                sqlx::query("DELETE FROM tasks WHERE state = 'archived' AND updated_at < $1")
                    .bind(before)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::from)
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_completed(
        &self,
        ctx: &OperationContext,
        before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = ctx
            .guard(async {
                sqlx::query("DELETE FROM tasks WHERE state = 'completed' AND updated_at < $1")
                    .bind(before)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::from)
            })
            .await?;
        Ok(result.rows_affected())
    }
}

fn expect_one_row(result: sqlx::postgres::PgQueryResult) -> StoreResult<()> {
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}
