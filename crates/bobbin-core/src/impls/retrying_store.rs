//! RetryingStore - transient-failure backoff in front of any store.
//!
//! Only `Unavailable` is retried. Conflicts and not-found pass straight
//! through so the core can interpret them.

use std::future::Future;

use async_trait::async_trait;

use crate::domain::{BobbinError, ETag, TaskId, TaskRecord, TaskType};
use crate::lease::RetryPolicy;
use crate::ports::TaskStore;

pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
    max_attempts: u32,
}

impl<S: TaskStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            inner,
            policy,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, BobbinError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, BobbinError>> + Send,
        T: Send,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match call().await {
                Err(err) if err.is_retryable() && attempts < self.max_attempts => {
                    let delay = self.policy.next_delay(attempts);
                    tracing::debug!(op, attempts, ?delay, error = %err, "store call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<S: TaskStore> TaskStore for RetryingStore<S> {
    async fn create(&self, record: TaskRecord) -> Result<TaskRecord, BobbinError> {
        self.with_retry("create", || self.inner.create(record.clone()))
            .await
    }

    async fn get(
        &self,
        task_type: &TaskType,
        id: TaskId,
    ) -> Result<Option<TaskRecord>, BobbinError> {
        self.with_retry("get", || self.inner.get(task_type, id)).await
    }

    async fn replace(
        &self,
        record: TaskRecord,
        expected: &ETag,
    ) -> Result<TaskRecord, BobbinError> {
        self.with_retry("replace", || self.inner.replace(record.clone(), expected))
            .await
    }

    async fn delete(&self, task_type: &TaskType, id: TaskId) -> Result<(), BobbinError> {
        self.with_retry("delete", || self.inner.delete(task_type, id))
            .await
    }

    async fn query_eligible_for_lease(
        &self,
        task_type: &TaskType,
        now: i64,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, BobbinError> {
        self.with_retry("query_eligible_for_lease", || {
            self.inner.query_eligible_for_lease(task_type, now, limit)
        })
        .await
    }

    async fn list(&self, task_type: &TaskType) -> Result<Vec<TaskRecord>, BobbinError> {
        self.with_retry("list", || self.inner.list(task_type)).await
    }
}
