//! Scheduled Jobs
//!
//! Periodic maintenance: expired verification records are deleted, and
//! finished tasks (completed or archived) are purged once they age past
//! their retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::OperationContext;
use crate::store::StoreError;
use crate::worker::Broker;

// =========================================================================
// Verification record cleanup
// =========================================================================

/// Delete unused verification records whose link has expired
pub async fn delete_expired_verify_emails(pool: &PgPool) -> Result<u64, JobError> {
    let result = sqlx::query(
        r#"
        DELETE FROM verify_emails
        WHERE is_used = FALSE AND expired_at < NOW()
        "#,
    )
    .execute(pool)
    .await?;

    let rows_deleted = result.rows_affected();

    if rows_deleted > 0 {
        tracing::info!(rows_deleted = rows_deleted, "Deleted expired verify emails");
    }

    Ok(rows_deleted)
}

// =========================================================================
// Finished task purge
// =========================================================================

fn cutoff(retention: Duration) -> Result<DateTime<Utc>, JobError> {
    let retention = chrono::Duration::from_std(retention)
        .map_err(|e| JobError::InvalidRetention(e.to_string()))?;
    Ok(Utc::now() - retention)
}

/// Delete completed tasks older than `retention`
pub async fn purge_completed_tasks(
    broker: &dyn Broker,
    retention: Duration,
) -> Result<u64, JobError> {
    let before = cutoff(retention)?;
    let rows_deleted = broker
        .purge_completed(&OperationContext::new(), before)
        .await?;

    if rows_deleted > 0 {
        tracing::info!(
            rows_deleted = rows_deleted,
            before = %before,
            "Purged completed tasks"
        );
    }

    Ok(rows_deleted)
}

/// Delete archived tasks older than `retention`
pub async fn purge_archived_tasks(
    broker: &dyn Broker,
    retention: Duration,
) -> Result<u64, JobError> {
    let before = cutoff(retention)?;
    let rows_deleted = broker
        .purge_archived(&OperationContext::new(), before)
        .await?;

    if rows_deleted > 0 {
        tracing::info!(
            rows_deleted = rows_deleted,
            before = %before,
            "Purged archived tasks"
        );
    }

    Ok(rows_deleted)
}

// =========================================================================
// Job Scheduler
// =========================================================================

/// Configuration for job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval for verification record cleanup (default: 10 minutes)
    pub verify_email_cleanup_interval: Duration,
    /// Interval for finished task purge (default: 1 hour)
    pub task_purge_interval: Duration,
    /// How long completed tasks are kept (default: 1 hour)
    pub completed_task_retention: Duration,
    /// How long archived tasks stay inspectable (default: 7 days)
    pub archived_task_retention: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            verify_email_cleanup_interval: Duration::from_secs(600),
            task_purge_interval: Duration::from_secs(3600),
            completed_task_retention: Duration::from_secs(3600),
            archived_task_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Job Scheduler - runs periodic maintenance tasks
pub struct JobScheduler {
    pool: PgPool,
    broker: Arc<dyn Broker>,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    pub fn new(pool: PgPool, broker: Arc<dyn Broker>) -> Self {
        Self::with_config(pool, broker, JobSchedulerConfig::default())
    }

    pub fn with_config(pool: PgPool, broker: Arc<dyn Broker>, config: JobSchedulerConfig) -> Self {
        Self {
            pool,
            broker,
            config,
        }
    }

    /// Start the scheduler in the background; it exits once `shutdown` fires
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("Job scheduler started");

        let mut verify_email_interval = interval(self.config.verify_email_cleanup_interval);
        let mut purge_interval = interval(self.config.task_purge_interval);
        verify_email_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        purge_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = verify_email_interval.tick() => {
                    if let Err(e) = delete_expired_verify_emails(&self.pool).await {
                        tracing::error!(error = %e, "Verify email cleanup failed");
                    }
                }
                _ = purge_interval.tick() => {
                    if let Err(e) = purge_completed_tasks(
                        self.broker.as_ref(),
                        self.config.completed_task_retention,
                    ).await {
                        tracing::error!(error = %e, "Completed task purge failed");
                    }
                    if let Err(e) = purge_archived_tasks(
                        self.broker.as_ref(),
                        self.config.archived_task_retention,
                    ).await {
                        tracing::error!(error = %e, "Archived task purge failed");
                    }
                }
            }
        }

        tracing::info!("Job scheduler stopped");
    }

    /// Run all maintenance jobs once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match delete_expired_verify_emails(&self.pool).await {
            Ok(count) => report.verify_emails_deleted = count,
            Err(e) => report.errors.push(format!("Verify email cleanup: {}", e)),
        }

        match purge_completed_tasks(self.broker.as_ref(), self.config.completed_task_retention)
            .await
        {
            Ok(count) => report.completed_tasks_purged = count,
            Err(e) => report.errors.push(format!("Completed task purge: {}", e)),
        }

        match purge_archived_tasks(self.broker.as_ref(), self.config.archived_task_retention)
            .await
        {
            Ok(count) => report.archived_tasks_purged = count,
            Err(e) => report.errors.push(format!("Archived task purge: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub verify_emails_deleted: u64,
    pub completed_tasks_purged: u64,
    pub archived_tasks_purged: u64,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] StoreError),

    #[error("Invalid retention window: {0}")]
    InvalidRetention(String),
}

// =========================================================================
// Tests
// =========================================================================
