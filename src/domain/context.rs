//! Operation Context
//!
//! Carries cancellation, deadline and correlation metadata through every
//! store, coordinator and broker call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::store::StoreError;

/// Context for an operation, used for cancellation and tracing.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Correlation ID for request tracing
    pub correlation_id: Option<Uuid>,

    /// Point in time after which blocking calls give up
    pub deadline: Option<Instant>,

    cancel: CancellationToken,
}

impl OperationContext {
    /// Create a new context with no deadline and a fresh cancellation token
    pub fn new() -> Self {
        Self {
            correlation_id: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Create context with correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Create context that expires after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Create context bound to an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Generate a new correlation ID if not present
    pub fn ensure_correlation_id(&mut self) -> Uuid {
        *self.correlation_id.get_or_insert_with(Uuid::new_v4)
    }

    /// Derive a context that is cancelled with this one but can also be
    /// cancelled on its own. The earlier of both deadlines applies.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout) {
            (Some(parent), Some(t)) => Some(parent.min(Instant::now() + t)),
            (None, Some(t)) => Some(Instant::now() + t),
            (parent, None) => parent,
        };

        Self {
            correlation_id: self.correlation_id,
            deadline,
            cancel: self.cancel.child_token(),
        }
    }

    /// Cancel this context and every child derived from it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Run a blocking store or broker call under this context.
    ///
    /// Cancellation wins over completion when both are ready.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(StoreError::Cancelled),
                    result = tokio::time::timeout_at(deadline, fut) => {
                        result.unwrap_or(Err(StoreError::DeadlineExceeded))
                    }
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(StoreError::Cancelled),
                    result = fut => result,
                }
            }
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder() {
        let correlation_id = Uuid::new_v4();

        let context = OperationContext::new().with_correlation_id(correlation_id);

        assert_eq!(context.correlation_id, Some(correlation_id));
        assert!(context.deadline.is_none());
        assert!(!context.is_cancelled());
    }

    #[test]
    fn test_ensure_correlation_id() {
        let mut context = OperationContext::new();
        assert!(context.correlation_id.is_none());

        let id = context.ensure_correlation_id();
        assert_eq!(context.correlation_id, Some(id));

        // Calling again should return the same ID
        let id2 = context.ensure_correlation_id();
        assert_eq!(id, id2);
    }

    #[tokio::test]
    async fn test_guard_reports_cancellation() {
        let context = OperationContext::new();
        context.cancel();

        let result = context.guard(async { Ok::<_, StoreError>(1) }).await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_guard_reports_deadline() {
        let context = OperationContext::new().with_timeout(Duration::from_millis(10));

        let result = context
            .guard(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StoreError>(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_child_follows_parent_cancellation() {
        let parent = OperationContext::new();
        let child = parent.child(None);

        child.cancel();
        assert!(!parent.is_cancelled());

        let other = parent.child(Some(Duration::from_secs(1)));
        parent.cancel();
        assert!(other.is_cancelled());
        assert!(other.deadline.is_some());
    }
}
