//! Task processor
//!
//! Pulls leased tasks from the broker and runs them through the `ServeMux`.
//! Each queue gets its own lane with a fixed number of concurrent handlers;
//! a recoverer loop hands expired leases back to the broker.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::domain::OperationContext;
use crate::store::StoreResult;

use super::{Broker, LeasedTask, RetryPolicy, Task, TaskError, QUEUE_CRITICAL, QUEUE_DEFAULT};

// =========================================================================
// Handlers
// =========================================================================

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process_task(&self, ctx: &OperationContext, task: &Task) -> Result<(), TaskError>;
}

/// Routes a task to the handler registered for its kind
#[derive(Default, Clone)]
pub struct ServeMux {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    pub async fn dispatch(&self, ctx: &OperationContext, task: &Task) -> Result<(), TaskError> {
        match self.handlers.get(&task.kind) {
            Some(handler) => handler.process_task(ctx, task).await,
            None => Err(TaskError::SkipRetry(format!(
                "no handler registered for task kind {}",
                task.kind
            ))),
        }
    }
}

/// Receives every task that failed for good
pub trait ErrorSink: Send + Sync {
    fn task_failed(&self, task: &LeasedTask, error: &TaskError);
}

/// Default sink: one structured error line per archived task
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn task_failed(&self, task: &LeasedTask, error: &TaskError) {
        tracing::error!(
            task_id = task.id,
            kind = %task.task.kind,
            payload = %task.task.payload,
            retried = task.retried,
            error = %error,
            "Task failed permanently"
        );
    }
}

// =========================================================================
// Configuration
// =========================================================================

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue name and handler concurrency for each lane
    pub queues: Vec<(String, usize)>,
    /// Sleep between empty dequeues
    pub poll_interval: Duration,
    pub recover_interval: Duration,
    /// Extra time past a task's timeout before its lease counts as lost
    pub recover_grace: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![
                (QUEUE_CRITICAL.to_string(), 10),
                (QUEUE_DEFAULT.to_string(), 5),
            ],
            poll_interval: Duration::from_millis(500),
            recover_interval: Duration::from_secs(60),
            recover_grace: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

// =========================================================================
// Processor
// =========================================================================

/// What happened to one leased task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Retried { process_at: DateTime<Utc> },
    Archived,
}

struct Inner {
    broker: Arc<dyn Broker>,
    mux: ServeMux,
    config: WorkerConfig,
    error_sink: Arc<dyn ErrorSink>,
}

pub struct TaskProcessor {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskProcessor {
    pub fn new(broker: Arc<dyn Broker>, mux: ServeMux, config: WorkerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                mux,
                config,
                error_sink: Arc::new(LogErrorSink),
            }),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Replace the default logging sink. Call before `start`.
    pub fn with_error_sink(self, error_sink: Arc<dyn ErrorSink>) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => Inner { error_sink, ..inner },
            Err(shared) => Inner {
                broker: shared.broker.clone(),
                mux: shared.mux.clone(),
                config: shared.config.clone(),
                error_sink,
            },
        };
        Self {
            inner: Arc::new(inner),
            shutdown: self.shutdown,
            handles: self.handles,
        }
    }

    /// Spawn one polling loop per lane plus the lease recoverer
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for (queue, concurrency) in &self.inner.config.queues {
            tracing::info!(queue = %queue, concurrency = concurrency, "Starting task lane");
            handles.push(tokio::spawn(run_lane(
                self.inner.clone(),
                queue.clone(),
                (*concurrency).max(1),
                self.shutdown.clone(),
            )));
        }
        handles.push(tokio::spawn(run_recoverer(
            self.inner.clone(),
            self.shutdown.clone(),
        )));
    }

    /// Stop polling and wait for in-flight handlers to finish
    pub async fn shutdown(&self) {
        tracing::info!("Task processor shutting down...");
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Task lane terminated abnormally");
            }
        }
        tracing::info!("Task processor stopped");
    }

    /// Lease and run at most one task from `queue` on the calling task
    pub async fn process_next(&self, queue: &str) -> StoreResult<Option<TaskOutcome>> {
        let leased = self
            .inner
            .broker
            .dequeue(&OperationContext::new(), queue)
            .await?;
        match leased {
            Some(leased) => Ok(Some(self.inner.execute(leased).await)),
            None => Ok(None),
        }
    }

    /// Run recovery once; returns how many leases were handed back
    pub async fn recover_stale(&self) -> StoreResult<u64> {
        self.inner
            .broker
            .recover_stale(&OperationContext::new(), self.inner.config.recover_grace)
            .await
    }
}

async fn run_lane(
    inner: Arc<Inner>,
    queue: String,
    concurrency: usize,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let poll_ctx = OperationContext::new();

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let leased = tokio::select! {
            _ = shutdown.cancelled() => break,
            leased = inner.broker.dequeue(&poll_ctx, &queue) => leased,
        };

        match leased {
            Ok(Some(task)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    inner.execute(task).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                idle(&shutdown, inner.config.poll_interval).await;
            }
            Err(e) => {
                drop(permit);
                tracing::warn!(queue = %queue, error = %e, "Failed to dequeue task");
                idle(&shutdown, inner.config.poll_interval).await;
            }
        }
    }

    // In-flight handlers hold permits; taking all of them waits them out
    let permits = u32::try_from(concurrency).unwrap_or(u32::MAX);
    let _ = semaphore.acquire_many(permits).await;
    tracing::debug!(queue = %queue, "Task lane drained");
}

async fn run_recoverer(inner: Arc<Inner>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(inner.config.recover_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let ctx = OperationContext::new();
                if let Err(e) = inner.broker.recover_stale(&ctx, inner.config.recover_grace).await {
                    tracing::warn!(error = %e, "Lease recovery failed");
                }
            }
        }
    }
}

async fn idle(shutdown: &CancellationToken, period: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(period) => {}
    }
}

impl Inner {
    async fn execute(&self, leased: LeasedTask) -> TaskOutcome {
        let span = tracing::info_span!(
            "task",
            task_id = leased.id,
            kind = %leased.task.kind,
            queue = %leased.queue,
            retried = leased.retried,
        );
        self.execute_inner(leased).instrument(span).await
    }

    async fn execute_inner(&self, leased: LeasedTask) -> TaskOutcome {
        let ctx = OperationContext::new()
            .with_correlation_id(uuid::Uuid::new_v4())
            .with_timeout(leased.timeout);

        let attempt = AssertUnwindSafe(self.mux.dispatch(&ctx, &leased.task)).catch_unwind();
        let result = match tokio::time::timeout(leased.timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::Retry("task handler panicked".to_string())),
            Err(_) => Err(TaskError::Retry("task deadline exceeded".to_string())),
        };

        // Bookkeeping must not inherit the attempt's deadline
        let ctx = OperationContext::new();
        match result {
            Ok(()) => {
                if let Err(e) = self.broker.complete(&ctx, leased.id).await {
                    tracing::error!(error = %e, "Failed to mark task completed");
                }
                tracing::info!("Processed task");
                TaskOutcome::Completed
            }
            Err(err) if err.is_skip_retry() || leased.retries_exhausted() => {
                if let Err(e) = self.broker.archive(&ctx, leased.id, &err.to_string()).await {
                    tracing::error!(error = %e, "Failed to archive task");
                }
                self.error_sink.task_failed(&leased, &err);
                TaskOutcome::Archived
            }
            Err(err) => {
                let delay = self.config.retry_policy.delay(leased.retried);
                let process_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(0));
                tracing::warn!(error = %err, retry_in = ?delay, "Task failed, scheduling retry");
                if let Err(e) = self
                    .broker
                    .retry(&ctx, leased.id, process_at, &err.to_string())
                    .await
                {
                    tracing::error!(error = %e, "Failed to schedule task retry");
                }
                TaskOutcome::Retried { process_at }
            }
        }
    }
}
