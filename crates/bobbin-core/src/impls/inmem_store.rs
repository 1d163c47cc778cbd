//! InMemoryTaskStore - 開発用・テスト用の正本
//!
//! Behaves like the document store the core is written against:
//! - every write stamps a fresh `version` and `updated_time`
//! - `replace` is a compare-and-swap on `version`
//! - records whose `ttl` elapsed since their last write disappear
//! - `fail_next(n)` makes the next `n` calls fail with `Unavailable`

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{BobbinError, ETag, TaskId, TaskRecord, TaskType};
use crate::ports::{Clock, TaskStore};

type Key = (TaskType, TaskId);

pub struct InMemoryTaskStore {
    records: Mutex<HashMap<Key, TaskRecord>>,
    clock: Arc<dyn Clock>,
    next_version: AtomicU64,
    pending_failures: AtomicUsize,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
            next_version: AtomicU64::new(1),
            pending_failures: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` calls with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    fn take_failure(&self) -> Result<(), BobbinError> {
        let took = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(BobbinError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn stamp(&self, record: &mut TaskRecord, now: i64) {
        let n = self.next_version.fetch_add(1, Ordering::SeqCst);
        record.version = Some(ETag::new(format!("v{n}")));
        record.updated_time = now;
    }

    fn purge_expired(records: &mut HashMap<Key, TaskRecord>, now: i64) {
        records.retain(|_, r| !is_expired(r, now));
    }
}

fn is_expired(record: &TaskRecord, now: i64) -> bool {
    record
        .ttl
        .is_some_and(|ttl| record.updated_time + ttl * 1_000 <= now)
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, mut record: TaskRecord) -> Result<TaskRecord, BobbinError> {
        self.take_failure()?;
        let now = self.clock.now_ms();
        let mut records = self.records.lock().await;
        Self::purge_expired(&mut records, now);

        let key = (record.task_type.clone(), record.id);
        if records.contains_key(&key) {
            return Err(BobbinError::Conflict(record.id));
        }
        self.stamp(&mut record, now);
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn get(
        &self,
        task_type: &TaskType,
        id: TaskId,
    ) -> Result<Option<TaskRecord>, BobbinError> {
        self.take_failure()?;
        let now = self.clock.now_ms();
        let mut records = self.records.lock().await;
        Self::purge_expired(&mut records, now);
        Ok(records.get(&(task_type.clone(), id)).cloned())
    }

    async fn replace(
        &self,
        mut record: TaskRecord,
        expected: &ETag,
    ) -> Result<TaskRecord, BobbinError> {
        self.take_failure()?;
        let now = self.clock.now_ms();
        let mut records = self.records.lock().await;
        Self::purge_expired(&mut records, now);

        let key = (record.task_type.clone(), record.id);
        let Some(current) = records.get(&key) else {
            return Err(BobbinError::NotFound(record.id));
        };
        if current.version.as_ref() != Some(expected) {
            return Err(BobbinError::Conflict(record.id));
        }
        self.stamp(&mut record, now);
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn delete(&self, task_type: &TaskType, id: TaskId) -> Result<(), BobbinError> {
        self.take_failure()?;
        let mut records = self.records.lock().await;
        records.remove(&(task_type.clone(), id));
        Ok(())
    }

    async fn query_eligible_for_lease(
        &self,
        task_type: &TaskType,
        now: i64,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, BobbinError> {
        self.take_failure()?;
        let mut records = self.records.lock().await;
        Self::purge_expired(&mut records, self.clock.now_ms());

        let mut eligible: Vec<TaskRecord> = records
            .values()
            .filter(|r| &r.task_type == task_type)
            .filter(|r| r.enabled && r.locked_until_time < now)
            .filter(|r| r.next_run_time.is_some_and(|next| next < now))
            .cloned()
            .collect();
        eligible.sort_by_key(|r| (r.next_run_time, r.id));
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn list(&self, task_type: &TaskType) -> Result<Vec<TaskRecord>, BobbinError> {
        self.take_failure()?;
        let mut records = self.records.lock().await;
        Self::purge_expired(&mut records, self.clock.now_ms());

        let mut listed: Vec<TaskRecord> = records
            .values()
            .filter(|r| &r.task_type == task_type)
            .cloned()
            .collect();
        listed.sort_by_key(|r| (r.create_time, r.id));
        Ok(listed)
    }
}
