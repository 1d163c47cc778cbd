//! Per-task optimistic patch engine.
//!
//! The controller keeps three payload snapshots:
//! - `server`: the payload of the last record read from or written to the store
//! - `reference`: the payload at the last reconciliation point
//! - `working`: the caller's live copy
//!
//! A payload save sends only `diff(reference, working)`, replayed onto a fresh
//! copy of `server`. Writes made by others in the meantime (lease renewals,
//! external updates) are kept, and the caller's delta is never lost to a stale
//! full copy. Snapshots are replaced, never edited in place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::lane::{Priority, SerialLane};
use super::merge;
use crate::domain::{BobbinError, TaskId, TaskRecord, TaskType};
use crate::ports::{Clock, TaskStore};

/// How one `patch` call is queued and whether it carries the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOptions {
    pub priority: Priority,
    pub save_payload: bool,
}

impl PatchOptions {
    /// Field-only write that jumps queued normal work.
    pub fn urgent() -> Self {
        Self {
            priority: Priority::Urgent,
            save_payload: false,
        }
    }

    pub fn normal(save_payload: bool) -> Self {
        Self {
            priority: Priority::Normal,
            save_payload,
        }
    }
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self::normal(true)
    }
}

struct Snapshots {
    /// Latest known record; its payload is the `server` snapshot.
    record: TaskRecord,
    reference: Value,
    working: Value,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    task_type: TaskType,
    id: TaskId,
    lane: SerialLane,
    snapshots: Mutex<Snapshots>,
    saving: AtomicBool,
}

#[derive(Clone)]
pub struct TaskDataController {
    inner: Arc<Inner>,
}

impl TaskDataController {
    /// Take ownership of a record view. Expired leases are accounted locally
    /// right away.
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, mut record: TaskRecord) -> Self {
        record.account_abandoned_lease(clock.now_ms());
        let payload = record.payload.clone();
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                task_type: record.task_type.clone(),
                id: record.id,
                lane: SerialLane::new(),
                snapshots: Mutex::new(Snapshots {
                    record,
                    reference: payload.clone(),
                    working: payload,
                }),
                saving: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.inner.task_type
    }

    /// Latest known record (server payload).
    pub fn record(&self) -> TaskRecord {
        self.inner.lock().record.clone()
    }

    /// The working payload.
    pub fn payload(&self) -> Value {
        self.inner.lock().working.clone()
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, BobbinError> {
        serde_json::from_value(self.payload())
            .map_err(|e| BobbinError::Other(format!("payload decode: {e}")))
    }

    pub fn set_payload(&self, payload: Value) {
        self.inner.lock().working = payload;
    }

    /// Replace the working payload with an edited copy of it.
    pub fn update_payload(&self, edit: impl FnOnce(&mut Value)) {
        let mut snapshots = self.inner.lock();
        let mut next = snapshots.working.clone();
        edit(&mut next);
        snapshots.working = next;
    }

    /// Queue a write and wait for it to persist.
    ///
    /// `mutator` receives a draft built from the latest record and the
    /// reconciled payload, and may be called once per attempt. Returning an
    /// error aborts the write without touching the store. Conflicts are
    /// retried against a freshly read record without limit.
    pub async fn patch<M>(&self, options: PatchOptions, mutator: M) -> Result<TaskRecord, BobbinError>
    where
        M: FnMut(&mut TaskRecord) -> Result<(), BobbinError> + Send + 'static,
    {
        let working = if options.save_payload {
            if self.inner.saving.swap(true, Ordering::AcqRel) {
                return Err(BobbinError::ConcurrentSave(self.inner.id));
            }
            Some(self.payload())
        } else {
            None
        };

        let inner = self.inner.clone();
        let result = self
            .inner
            .lane
            .run(options.priority, async move {
                let result = inner.write(working.clone(), mutator).await;
                if working.is_some() {
                    inner.saving.store(false, Ordering::Release);
                }
                result
            })
            .await;

        match result {
            Ok(written) => written,
            Err(err) => {
                if options.save_payload {
                    self.inner.saving.store(false, Ordering::Release);
                }
                Err(err)
            }
        }
    }

    /// Re-read the record. `None` means it was deleted; the controller keeps
    /// its last view in that case.
    pub async fn sync(&self) -> Result<Option<TaskRecord>, BobbinError> {
        let inner = self.inner.clone();
        self.inner
            .lane
            .run(Priority::Normal, async move { inner.refresh().await })
            .await?
    }

    /// Delete the record. A record that is already gone counts as deleted.
    pub async fn delete(&self) -> Result<(), BobbinError> {
        self.delete_if(|_| Ok(())).await
    }

    /// Delete the record if `guard` accepts its current server copy.
    ///
    /// The store's delete carries no version, so the guard only sees the copy
    /// read just before deleting.
    pub async fn delete_if<G>(&self, guard: G) -> Result<(), BobbinError>
    where
        G: FnOnce(&TaskRecord) -> Result<(), BobbinError> + Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner
            .lane
            .run(Priority::Normal, async move {
                let Some(current) = inner.store.get(&inner.task_type, inner.id).await? else {
                    return Ok(());
                };
                guard(&current)?;
                inner.store.delete(&inner.task_type, inner.id).await
            })
            .await?
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Snapshots> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn refresh(&self) -> Result<Option<TaskRecord>, BobbinError> {
        let Some(mut fresh) = self.store.get(&self.task_type, self.id).await? else {
            tracing::debug!(task_id = %self.id, "record is gone");
            return Ok(None);
        };
        fresh.account_abandoned_lease(self.clock.now_ms());
        self.lock().record = fresh.clone();
        Ok(Some(fresh))
    }

    /// One patch, retried on conflict.
    async fn write<M>(&self, working: Option<Value>, mut mutator: M) -> Result<TaskRecord, BobbinError>
    where
        M: FnMut(&mut TaskRecord) -> Result<(), BobbinError>,
    {
        let mut retrying = false;
        loop {
            let stale = self.lock().record.version.is_none();
            if (retrying || stale) && self.refresh().await?.is_none() {
                return Err(BobbinError::NotFound(self.id));
            }

            let (latest, reference) = {
                let snapshots = self.lock();
                (snapshots.record.clone(), snapshots.reference.clone())
            };
            let Some(expected) = latest.version.clone() else {
                return Err(BobbinError::NotFound(self.id));
            };

            let delta = working
                .as_ref()
                .and_then(|working| merge::diff(&reference, working));
            let reconciled = match &delta {
                Some(delta) => merge::apply(&latest.payload, delta),
                None => latest.payload.clone(),
            };

            let mut draft = latest.clone();
            draft.payload = reconciled;
            mutator(&mut draft)?;
            apply_ttl(&mut draft, &latest, self.clock.now_ms());

            match self.store.replace(draft, &expected).await {
                Ok(persisted) => {
                    let mut snapshots = self.lock();
                    snapshots.record = persisted.clone();
                    if let Some(working) = working {
                        snapshots.reference = working;
                    }
                    return Ok(persisted);
                }
                Err(BobbinError::Conflict(_)) => {
                    tracing::debug!(task_id = %self.id, "version conflict, rereading");
                    retrying = true;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Keep a terminal record's deletion deadline, or clear the TTL of a record
/// that is no longer terminal.
fn apply_ttl(draft: &mut TaskRecord, previous: &TaskRecord, now: i64) {
    if !draft.status(now).is_terminal() {
        draft.ttl = None;
        return;
    }
    let Some(after_finish_ms) = draft.ttl_after_finish_ms else {
        return;
    };
    let deadline = match previous.ttl {
        Some(ttl) if previous.status(now).is_terminal() => previous.updated_time + ttl * 1_000,
        _ => now + after_finish_ms,
    };
    let remaining_s = (deadline - now + 999) / 1_000;
    draft.ttl = Some(remaining_s.max(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ETag, LeaseToken, TaskOptions};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const NOW: i64 = 1_700_000_000_000;

    async fn setup(payload: Value) -> (Arc<FixedClock>, Arc<InMemoryTaskStore>, TaskDataController) {
        let clock = Arc::new(FixedClock::from_millis(NOW));
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let record = TaskRecord::new(TaskType::new("mail"), payload, TaskOptions::default(), NOW)
            .unwrap();
        let created = store.create(record).await.unwrap();
        let controller = TaskDataController::new(store.clone(), clock.clone(), created);
        (clock, store, controller)
    }

    async fn external_lease_write(store: &InMemoryTaskStore, id: TaskId) {
        let mut current = store.get(&TaskType::new("mail"), id).await.unwrap().unwrap();
        let version = current.version.clone().unwrap();
        current.lease_token = Some(LeaseToken::new("other.0"));
        current.locked_until_time = NOW + 5_000;
        store.replace(current, &version).await.unwrap();
    }

    #[tokio::test]
    async fn sequential_patches_survive_an_external_lease_write() {
        let (_clock, store, controller) = setup(json!({})).await;

        controller.update_payload(|p| p["a"] = json!(1));
        controller.patch(PatchOptions::default(), |_| Ok(())).await.unwrap();

        external_lease_write(&store, controller.id()).await;

        controller.update_payload(|p| p["b"] = json!(2));
        let persisted = controller.patch(PatchOptions::default(), |_| Ok(())).await.unwrap();

        assert_eq!(persisted.payload, json!({"a": 1, "b": 2}));
        // the external lease fields were not clobbered
        assert_eq!(persisted.lease_token, Some(LeaseToken::new("other.0")));
    }

    #[tokio::test]
    async fn only_the_delta_is_replayed_onto_a_changed_server_payload() {
        let (_clock, store, controller) = setup(json!({"counter": 1})).await;

        let mut current = store
            .get(&TaskType::new("mail"), controller.id())
            .await
            .unwrap()
            .unwrap();
        let version = current.version.clone().unwrap();
        current.payload = json!({"counter": 1, "tag": "external"});
        store.replace(current, &version).await.unwrap();

        controller.update_payload(|p| p["counter"] = json!(2));
        let persisted = controller.patch(PatchOptions::default(), |_| Ok(())).await.unwrap();

        assert_eq!(persisted.payload, json!({"counter": 2, "tag": "external"}));
    }

    #[tokio::test]
    async fn field_only_patch_leaves_payload_edits_pending() {
        let (_clock, _store, controller) = setup(json!({"n": 1})).await;
        controller.set_payload(json!({"n": 2}));

        let persisted = controller
            .patch(PatchOptions::urgent(), |draft| {
                draft.locked_until_time = NOW + 1_000;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(persisted.payload, json!({"n": 1}));
        assert_eq!(persisted.locked_until_time, NOW + 1_000);

        let saved = controller.patch(PatchOptions::default(), |_| Ok(())).await.unwrap();
        assert_eq!(saved.payload, json!({"n": 2}));
    }

    #[tokio::test]
    async fn mutator_error_aborts_without_writing() {
        let (_clock, store, controller) = setup(json!({})).await;
        let before = controller.record().version;
        let id = controller.id();

        let err = controller
            .patch(PatchOptions::default(), move |_| Err(BobbinError::LockLost(id)))
            .await
            .unwrap_err();
        assert!(matches!(err, BobbinError::LockLost(_)));

        let stored = store.get(&TaskType::new("mail"), controller.id()).await.unwrap().unwrap();
        assert_eq!(stored.version, before);
        // the save guard was released
        controller.patch(PatchOptions::default(), |_| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn deleted_record_surfaces_not_found() {
        let (_clock, store, controller) = setup(json!({})).await;
        store.delete(&TaskType::new("mail"), controller.id()).await.unwrap();

        assert_eq!(controller.sync().await.unwrap(), None);
        let err = controller.patch(PatchOptions::default(), |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, BobbinError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_clock, store, controller) = setup(json!({})).await;
        controller.delete().await.unwrap();
        controller.delete().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn rejected_guard_keeps_the_record() {
        let (_clock, store, controller) = setup(json!({})).await;
        let err = controller
            .delete_if(|current| Err(BobbinError::LockLost(current.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, BobbinError::LockLost(_)));
        assert!(!store.is_empty().await);
    }

    #[tokio::test]
    async fn normalization_accounts_an_expired_lease() {
        let clock = Arc::new(FixedClock::from_millis(NOW));
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let mut record =
            TaskRecord::new(TaskType::new("mail"), json!({}), TaskOptions::default(), NOW).unwrap();
        record.lease_token = Some(LeaseToken::new("gone.0"));
        record.locked_until_time = NOW - 1;

        let controller = TaskDataController::new(store, clock, record);
        let view = controller.record();
        assert_eq!((view.attempts, view.deliveries), (1, 1));
        assert!(view.lease_token.is_none());
    }

    /// Store whose replace blocks until released, to hold a save in flight.
    struct SlowStore {
        inner: InMemoryTaskStore,
        gate: tokio::sync::Semaphore,
        replaces: AtomicUsize,
    }

    #[async_trait]
    impl TaskStore for SlowStore {
        async fn create(&self, record: TaskRecord) -> Result<TaskRecord, BobbinError> {
            self.inner.create(record).await
        }
        async fn get(&self, task_type: &TaskType, id: TaskId) -> Result<Option<TaskRecord>, BobbinError> {
            self.inner.get(task_type, id).await
        }
        async fn replace(&self, record: TaskRecord, expected: &ETag) -> Result<TaskRecord, BobbinError> {
            self.replaces.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.map_err(|e| BobbinError::Other(e.to_string()))?;
            self.inner.replace(record, expected).await
        }
        async fn delete(&self, task_type: &TaskType, id: TaskId) -> Result<(), BobbinError> {
            self.inner.delete(task_type, id).await
        }
        async fn query_eligible_for_lease(
            &self,
            task_type: &TaskType,
            now: i64,
            limit: usize,
        ) -> Result<Vec<TaskRecord>, BobbinError> {
            self.inner.query_eligible_for_lease(task_type, now, limit).await
        }
        async fn list(&self, task_type: &TaskType) -> Result<Vec<TaskRecord>, BobbinError> {
            self.inner.list(task_type).await
        }
    }

    #[tokio::test]
    async fn second_concurrent_save_is_rejected_synchronously() {
        let clock = Arc::new(FixedClock::from_millis(NOW));
        let inner = InMemoryTaskStore::new(clock.clone());
        let created = inner
            .create(TaskRecord::new(TaskType::new("mail"), json!({}), TaskOptions::default(), NOW).unwrap())
            .await
            .unwrap();
        let store = Arc::new(SlowStore {
            inner,
            gate: tokio::sync::Semaphore::new(0),
            replaces: AtomicUsize::new(0),
        });
        let controller = TaskDataController::new(store.clone(), clock, created);

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.patch(PatchOptions::default(), |_| Ok(())).await })
        };
        while store.replaces.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let err = controller.patch(PatchOptions::default(), |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, BobbinError::ConcurrentSave(_)));

        store.gate.add_permits(1);
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn finish_ttl_keeps_the_original_deadline() {
        let clock = Arc::new(FixedClock::from_millis(NOW));
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let options = TaskOptions {
            ttl_after_finish_ms: Some(60_000),
            ..Default::default()
        };
        let created = store
            .create(TaskRecord::new(TaskType::new("mail"), json!({}), options, NOW).unwrap())
            .await
            .unwrap();
        let controller = TaskDataController::new(store.clone(), clock.clone(), created);

        let finished = controller
            .patch(PatchOptions::default(), |draft| {
                draft.next_run_time = None;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(finished.ttl, Some(60));

        clock.advance(chrono::Duration::seconds(20));
        controller.update_payload(|p| p["note"] = json!("late edit"));
        let saved = controller.patch(PatchOptions::default(), |_| Ok(())).await.unwrap();
        assert_eq!(saved.ttl, Some(40));

        let revived = controller
            .patch(PatchOptions::default(), |draft| {
                draft.next_run_time = Some(NOW + 100_000);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(revived.ttl, None);
    }
}
