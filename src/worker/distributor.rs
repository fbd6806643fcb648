//! Task distributor
//!
//! The producer side of the queue. Callers hand over a `TaskRequest` and get
//! back the broker's `TaskInfo` once the task is durably stored.
//! `distribute_in` writes through an open store scope instead, so the task
//! commits or rolls back with the rows around it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::OperationContext;
use crate::store::Querier;

use super::{
    Broker, DistributeError, PayloadSendVerifyEmail, TaskInfo, TaskOptions, TaskRequest,
};

#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn distribute(
        &self,
        ctx: &OperationContext,
        request: TaskRequest,
    ) -> Result<TaskInfo, DistributeError>;

    async fn distribute_task_send_verify_email(
        &self,
        ctx: &OperationContext,
        payload: &PayloadSendVerifyEmail,
        options: TaskOptions,
    ) -> Result<TaskInfo, DistributeError> {
        let request = payload.to_request(options)?;
        self.distribute(ctx, request).await
    }

    /// Enqueue on the connection that `q` is bound to
    async fn distribute_in(
        &self,
        ctx: &OperationContext,
        q: &mut dyn Querier,
        request: TaskRequest,
    ) -> Result<TaskInfo, DistributeError> {
        let info = q.enqueue_task(ctx, &request.task, &request.options).await?;
        log_enqueued(&info);
        Ok(info)
    }
}

fn log_enqueued(info: &TaskInfo) {
    tracing::info!(
        task_id = info.id,
        kind = %info.kind,
        queue = %info.queue,
        max_retry = info.max_retry,
        process_at = %info.process_at,
        "Enqueued task"
    );
}

/// Distributor that writes straight into a broker
#[derive(Clone)]
pub struct BrokerTaskDistributor {
    broker: Arc<dyn Broker>,
}

impl BrokerTaskDistributor {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl TaskDistributor for BrokerTaskDistributor {
    async fn distribute(
        &self,
        ctx: &OperationContext,
        request: TaskRequest,
    ) -> Result<TaskInfo, DistributeError> {
        let info = self
            .broker
            .enqueue(ctx, &request.task, &request.options)
            .await?;

        log_enqueued(&info);
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use crate::worker::{MemoryBroker, TaskState, QUEUE_CRITICAL, TASK_SEND_VERIFY_EMAIL};

    #[tokio::test]
    async fn test_distribute_send_verify_email() {
        let broker = MemoryBroker::new();
        let distributor = BrokerTaskDistributor::new(Arc::new(broker.clone()));
        let payload = PayloadSendVerifyEmail {
            username: "alice".to_string(),
        };

        let info = distributor
            .distribute_task_send_verify_email(
                &OperationContext::new(),
                &payload,
                TaskOptions::new().queue(QUEUE_CRITICAL).max_retry(10),
            )
            .await
            .unwrap();

        assert_eq!(info.kind, TASK_SEND_VERIFY_EMAIL);
        assert_eq!(info.queue, QUEUE_CRITICAL);
        let record = broker.get(info.id).unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.task.decode::<PayloadSendVerifyEmail>().unwrap(), payload);
    }

    #[tokio::test]
    async fn test_unavailable_broker_surfaces_retryable_error() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        let distributor = BrokerTaskDistributor::new(Arc::new(broker));

        let err = distributor
            .distribute_task_send_verify_email(
                &OperationContext::new(),
                &PayloadSendVerifyEmail {
                    username: "alice".to_string(),
                },
                TaskOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_distribute_in_follows_scope() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new().with_broker(broker.clone());
        let distributor = BrokerTaskDistributor::new(Arc::new(broker.clone()));
        let ctx = OperationContext::new();
        let request = PayloadSendVerifyEmail::new("alice")
            .to_request(TaskOptions::new())
            .unwrap();

        let mut tx = store.begin(&ctx).await.unwrap();
        let info = distributor
            .distribute_in(&ctx, tx.queries(), request)
            .await
            .unwrap();
        assert!(broker.get(info.id).is_none());

        tx.commit(&ctx).await.unwrap();
        assert_eq!(broker.get(info.id).unwrap().state, TaskState::Pending);
    }
}
