//! TaskStore port - the shared document store holding task records.
//!
//! # 設計原則
//! - The store is authoritative; nothing is locked in-process
//! - All exclusion goes through `replace`'s version check plus the lease token
//! - Every call is scoped to one task type (the partition key)
//!
//! # Errors
//! - `Conflict` when `expected` no longer matches (surfaced immediately)
//! - `NotFound` when the record is gone (surfaced immediately)
//! - `Unavailable` for transient failures; see `RetryingStore` for the backoff
//!   layer

use async_trait::async_trait;

use crate::domain::{BobbinError, ETag, TaskId, TaskRecord, TaskType};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record and return it with its first version.
    async fn create(&self, record: TaskRecord) -> Result<TaskRecord, BobbinError>;

    async fn get(&self, task_type: &TaskType, id: TaskId)
    -> Result<Option<TaskRecord>, BobbinError>;

    /// Replace the record only if its version still equals `expected`.
    async fn replace(&self, record: TaskRecord, expected: &ETag)
    -> Result<TaskRecord, BobbinError>;

    /// Idempotent: deleting a missing record succeeds.
    async fn delete(&self, task_type: &TaskType, id: TaskId) -> Result<(), BobbinError>;

    /// Up to `limit` records that are enabled, due (`next_run_time < now`)
    /// and unlocked (`locked_until_time < now`), oldest due first.
    async fn query_eligible_for_lease(
        &self,
        task_type: &TaskType,
        now: i64,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, BobbinError>;

    async fn list(&self, task_type: &TaskType) -> Result<Vec<TaskRecord>, BobbinError>;
}
