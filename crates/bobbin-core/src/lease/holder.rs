//! LeaseHolder - processing-side handle of one leased task.
//!
//! # State machine
//! - Active -> Finishing -> Finished
//! - Finishing -> Active when the finishing write fails
//! - Active | Finishing -> LockLost, only when lease expiry is detected
//!
//! # Timers
//! Started on construction, torn down when the holder leaves processing:
//! - disable poll: every `refresh_interval_ms`, re-read the record and report
//!   `Disabled` once if the task was switched off
//! - renewal: in the last third of the lease window, extend the lease with a
//!   new token through an urgent patch
//! - expiry check: at `locked_until_time`, declare `LockLost` unless the lease
//!   is still held
//!
//! Timers keep only a weak reference, so dropping every handle of a holder
//! also stops them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::retry::RetryPolicy;
use crate::domain::{
    BobbinError, FinishOutcome, HolderEvent, LastRun, LeaseToken, ProcessingState, TaskId,
    TaskRecord, compute_next_run,
};
use crate::patch::{PatchOptions, TaskDataController};
use crate::ports::{Clock, IdGenerator, TaskStore};

const EVENT_CAPACITY: usize = 64;

/// Per-holder timing and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HolderSettings {
    pub lease_duration_ms: i64,
    /// Disable-poll period; 0 turns the poll off.
    pub refresh_interval_ms: u64,
    /// A retry after this many attempts becomes a terminal fail.
    pub retries: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for HolderSettings {
    fn default() -> Self {
        Self {
            lease_duration_ms: 30_000,
            refresh_interval_ms: 30_000,
            retries: 4,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Options shared by the finishing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishOptions {
    /// Persist pending payload edits along with the outcome.
    pub save_payload: bool,
}

impl FinishOptions {
    pub fn without_payload() -> Self {
        Self {
            save_payload: false,
        }
    }
}

impl Default for FinishOptions {
    fn default() -> Self {
        Self { save_payload: true }
    }
}

/// Tokens this holder accepts as its own.
#[derive(Debug)]
struct LeaseView {
    owned: LeaseToken,
    /// Token of a renewal that is being written.
    renewing: Option<LeaseToken>,
    locked_until: i64,
}

impl LeaseView {
    fn owns(&self, token: Option<&LeaseToken>) -> bool {
        token.is_some_and(|t| *t == self.owned || self.renewing.as_ref() == Some(t))
    }
}

struct Inner {
    id: TaskId,
    controller: TaskDataController,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    settings: HolderSettings,
    acquired_at: i64,
    initially_enabled: bool,
    lease: Arc<Mutex<LeaseView>>,
    state: watch::Sender<ProcessingState>,
    events: broadcast::Sender<HolderEvent>,
    timers: CancellationToken,
    disabled_reported: AtomicBool,
    inactive_reported: AtomicBool,
}

#[derive(Clone)]
pub struct LeaseHolder {
    inner: Arc<Inner>,
}

impl LeaseHolder {
    /// Wrap a freshly leased record and start its timers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        record: TaskRecord,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        settings: HolderSettings,
    ) -> Self {
        let now = clock.now_ms();
        let lease = LeaseView {
            owned: record
                .lease_token
                .clone()
                .unwrap_or_else(|| LeaseToken::new(String::new())),
            renewing: None,
            locked_until: record.locked_until_time,
        };
        let id = record.id;
        let initially_enabled = record.enabled;
        let controller = TaskDataController::new(store, clock.clone(), record);
        let (state, _) = watch::channel(ProcessingState::Active);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let holder = Self {
            inner: Arc::new(Inner {
                id,
                controller,
                clock,
                ids,
                settings,
                acquired_at: now,
                initially_enabled,
                lease: Arc::new(Mutex::new(lease)),
                state,
                events,
                timers: CancellationToken::new(),
                disabled_reported: AtomicBool::new(false),
                inactive_reported: AtomicBool::new(false),
            }),
        };
        holder.start_timers();
        tracing::debug!(task_id = %id, "lease holder started");
        holder
    }

    fn start_timers(&self) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.timers.clone();
        tokio::spawn(renewal_loop(weak.clone(), cancel.clone()));
        tokio::spawn(expiry_loop(weak.clone(), cancel.clone()));
        if self.inner.settings.refresh_interval_ms > 0 {
            tokio::spawn(disable_poll_loop(weak, cancel));
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn state(&self) -> ProcessingState {
        *self.inner.state.borrow()
    }

    /// Watch processing state changes.
    pub fn watch_state(&self) -> watch::Receiver<ProcessingState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HolderEvent> {
        self.inner.events.subscribe()
    }

    /// Latest known record.
    pub fn record(&self) -> TaskRecord {
        self.inner.controller.record()
    }

    pub fn lock_expires_at(&self) -> i64 {
        self.inner.lease().locked_until
    }

    pub fn is_lock_held(&self) -> bool {
        self.inner.is_lock_held()
    }

    pub fn payload(&self) -> Value {
        self.inner.controller.payload()
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, BobbinError> {
        self.inner.controller.payload_as()
    }

    pub fn set_payload(&self, payload: Value) {
        self.inner.controller.set_payload(payload);
    }

    pub fn update_payload(&self, edit: impl FnOnce(&mut Value)) {
        self.inner.controller.update_payload(edit);
    }

    /// Persist the working payload without finishing.
    pub async fn save(&self) -> Result<TaskRecord, BobbinError> {
        self.inner.ensure_processing()?;
        let fence = self.inner.fence();
        self.inner
            .controller
            .patch(PatchOptions::normal(true), move |draft| fence(draft))
            .await
    }

    /// Finish the run successfully.
    ///
    /// The next run is `now + next_run_delay_ms` when given, otherwise the
    /// schedule's next run after this run's start.
    pub async fn complete(
        &self,
        next_run_delay_ms: Option<i64>,
        options: FinishOptions,
    ) -> Result<TaskRecord, BobbinError> {
        let clock = self.inner.clock.clone();
        let acquired_at = self.inner.acquired_at;
        self.finish(FinishOutcome::Completed, None, next_run_delay_ms, options, move |draft| {
            finish_run(draft, true, next_run_delay_ms, clock.now_ms(), acquired_at)
        })
        .await
    }

    /// Finish the run as failed. Recurring tasks keep their schedule.
    pub async fn fail(
        &self,
        error: Option<String>,
        next_run_delay_ms: Option<i64>,
        options: FinishOptions,
    ) -> Result<TaskRecord, BobbinError> {
        if let Some(error) = &error {
            tracing::info!(task_id = %self.inner.id, %error, "task failed");
        }
        let clock = self.inner.clock.clone();
        let acquired_at = self.inner.acquired_at;
        self.finish(FinishOutcome::Failed, error, next_run_delay_ms, options, move |draft| {
            finish_run(draft, false, next_run_delay_ms, clock.now_ms(), acquired_at)
        })
        .await
    }

    /// Schedule a redelivery that counts as an attempt, or fail the run once
    /// the retry budget is spent.
    pub async fn retry(
        &self,
        error: Option<String>,
        delay_ms: Option<i64>,
        options: FinishOptions,
    ) -> Result<TaskRecord, BobbinError> {
        let attempts = self.record().attempts;
        if attempts >= self.inner.settings.retries {
            tracing::info!(task_id = %self.inner.id, attempts, "retries exhausted");
            return self.fail(error, None, options).await;
        }

        let delay_ms = delay_ms.unwrap_or_else(|| {
            let backoff = self.inner.settings.retry_policy.next_delay(attempts + 1);
            i64::try_from(backoff.as_millis()).unwrap_or(i64::MAX)
        });
        tracing::debug!(task_id = %self.inner.id, attempts, delay_ms, "scheduling retry");
        let clock = self.inner.clock.clone();
        self.finish(FinishOutcome::Retried, error, Some(delay_ms), options, move |draft| {
            draft.next_run_time = Some(clock.now_ms() + delay_ms);
            draft.attempts += 1;
            draft.deliveries += 1;
            draft.clear_lease();
            Ok(())
        })
        .await
    }

    /// Schedule a redelivery that does not count as an attempt.
    pub async fn defer(&self, delay_ms: i64, options: FinishOptions) -> Result<TaskRecord, BobbinError> {
        let clock = self.inner.clock.clone();
        self.finish(FinishOutcome::Deferred, None, Some(delay_ms), options, move |draft| {
            draft.next_run_time = Some(clock.now_ms() + delay_ms);
            draft.deliveries += 1;
            draft.clear_lease();
            Ok(())
        })
        .await
    }

    /// Give the lease back without an outcome; the task is immediately
    /// eligible again.
    pub async fn release(&self, options: FinishOptions) -> Result<TaskRecord, BobbinError> {
        self.finish(FinishOutcome::Released, None, None, options, |draft| {
            draft.deliveries += 1;
            draft.clear_lease();
            Ok(())
        })
        .await
    }

    /// Delete the task record. Counts as finishing.
    ///
    /// Fenced like the other finishing calls: a record leased by someone else
    /// is left alone and the call fails with `LockLost`.
    pub async fn delete(&self) -> Result<(), BobbinError> {
        self.inner.begin_finish()?;
        let fence = self.inner.fence();
        match self.inner.controller.delete_if(fence).await {
            Ok(()) => {
                self.inner.end_finish(FinishOutcome::Deleted, None, None);
                Ok(())
            }
            Err(err) => {
                self.inner.abort_finish();
                Err(err)
            }
        }
    }

    /// Stop processing locally without touching the store.
    ///
    /// The server-side lease is left to expire. A holder that already lost its
    /// lock stays `LockLost`.
    pub fn force_release(&self, error: Option<String>) {
        let inner = &self.inner;
        inner.settle(|s| s.is_processing(), ProcessingState::Finished, || {
            tracing::warn!(task_id = %inner.id, error = error.as_deref().unwrap_or(""), "lease force-released");
            inner.emit(HolderEvent::Finished {
                outcome: FinishOutcome::ForceReleased,
                error,
                delay_ms: None,
            });
            inner.emit_inactive();
        });
        inner.timers.cancel();
    }

    /// Common finishing path: `Active -> Finishing`, fenced patch, then
    /// `Finished` on success or back to `Active` on failure.
    async fn finish<M>(
        &self,
        outcome: FinishOutcome,
        error: Option<String>,
        delay_ms: Option<i64>,
        options: FinishOptions,
        mut change: M,
    ) -> Result<TaskRecord, BobbinError>
    where
        M: FnMut(&mut TaskRecord) -> Result<(), BobbinError> + Send + 'static,
    {
        self.inner.begin_finish()?;
        let fence = self.inner.fence();
        let result = self
            .inner
            .controller
            .patch(PatchOptions::normal(options.save_payload), move |draft| {
                fence(draft)?;
                change(draft)
            })
            .await;

        match result {
            Ok(persisted) => {
                self.inner.end_finish(outcome, error, delay_ms);
                Ok(persisted)
            }
            Err(err) => {
                tracing::warn!(task_id = %self.inner.id, ?outcome, error = %err, "finish failed");
                self.inner.abort_finish();
                Err(err)
            }
        }
    }
}

/// Run bookkeeping shared by `complete` and `fail`.
fn finish_run(
    draft: &mut TaskRecord,
    succeeded: bool,
    next_run_delay_ms: Option<i64>,
    now: i64,
    acquired_at: i64,
) -> Result<(), BobbinError> {
    let start_time = draft.current_run_start_time.unwrap_or(acquired_at);
    draft.next_run_time = match next_run_delay_ms {
        Some(delay) => Some(now + delay),
        None => compute_next_run(draft.interval.as_ref(), Some(start_time), now)?,
    };
    draft.runs += 1;
    draft.attempts = 0;
    draft.deliveries = 0;
    draft.last_run = Some(LastRun {
        start_time,
        finish_time: now,
        succeeded,
    });
    draft.current_run_start_time = None;
    draft.clear_lease();
    Ok(())
}

impl Inner {
    fn lease(&self) -> std::sync::MutexGuard<'_, LeaseView> {
        self.lease.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ProcessingState {
        *self.state.borrow()
    }

    fn emit(&self, event: HolderEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_inactive(&self) {
        if !self.inactive_reported.swap(true, Ordering::AcqRel) {
            self.emit(HolderEvent::Inactive);
        }
    }

    /// Move to `to` if the current state passes `allowed`.
    fn transition(&self, allowed: impl Fn(ProcessingState) -> bool, to: ProcessingState) -> bool {
        self.settle(allowed, to, || {})
    }

    /// `transition` whose events, `announce` included, are sent before
    /// anyone watching the state can see `to`. `announce` runs under the
    /// state lock and must not read the state.
    fn settle(
        &self,
        allowed: impl Fn(ProcessingState) -> bool,
        to: ProcessingState,
        announce: impl FnOnce(),
    ) -> bool {
        self.state.send_if_modified(|state| {
            if !allowed(*state) || *state == to {
                return false;
            }
            let from = *state;
            tracing::debug!(task_id = %self.id, ?from, ?to, "processing state changed");
            self.emit(HolderEvent::StateChanged { from, to });
            announce();
            *state = to;
            true
        })
    }

    fn misuse(&self, state: ProcessingState) -> BobbinError {
        match state {
            ProcessingState::LockLost => BobbinError::LockLost(self.id),
            ProcessingState::Finishing => BobbinError::FinishInProgress(self.id),
            _ => BobbinError::AlreadyFinished(self.id),
        }
    }

    fn ensure_processing(&self) -> Result<(), BobbinError> {
        let state = self.state();
        if state.is_processing() {
            Ok(())
        } else {
            Err(self.misuse(state))
        }
    }

    fn begin_finish(&self) -> Result<(), BobbinError> {
        let mut rejected = None;
        self.state.send_if_modified(|state| {
            if *state == ProcessingState::Active {
                *state = ProcessingState::Finishing;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        match rejected {
            Some(state) => Err(self.misuse(state)),
            None => {
                self.emit(HolderEvent::StateChanged {
                    from: ProcessingState::Active,
                    to: ProcessingState::Finishing,
                });
                Ok(())
            }
        }
    }

    fn end_finish(&self, outcome: FinishOutcome, error: Option<String>, delay_ms: Option<i64>) {
        // a lock lost while the write was in flight stays lost
        self.settle(|s| s == ProcessingState::Finishing, ProcessingState::Finished, || {
            self.timers.cancel();
            tracing::debug!(task_id = %self.id, ?outcome, "task finished");
            self.emit(HolderEvent::Finished {
                outcome,
                error,
                delay_ms,
            });
            self.emit_inactive();
        });
    }

    fn abort_finish(&self) {
        self.transition(|s| s == ProcessingState::Finishing, ProcessingState::Active);
    }

    /// Mutator guard: the draft must still carry one of our tokens.
    fn fence(&self) -> impl Fn(&TaskRecord) -> Result<(), BobbinError> + Send + 'static + use<> {
        let lease = self.lease.clone();
        let id = self.id;
        move |draft| {
            let view = lease.lock().unwrap_or_else(|e| e.into_inner());
            if view.owns(draft.lease_token.as_ref()) {
                Ok(())
            } else {
                Err(BobbinError::LockLost(id))
            }
        }
    }

    fn is_lock_held(&self) -> bool {
        let record_token = self.controller.record().lease_token;
        let view = self.lease();
        view.owns(record_token.as_ref()) && self.clock.now_ms() < view.locked_until
    }

    /// Whether another renewal fits in the execution budget.
    fn within_budget(&self, now: i64) -> bool {
        match self.controller.record().max_execution_time_ms {
            None | Some(0) => true,
            Some(max) => now + self.settings.lease_duration_ms - self.acquired_at <= max,
        }
    }

    async fn renew(&self) -> Result<i64, BobbinError> {
        let token = self.ids.fencing_seed().token(0);
        self.lease().renewing = Some(token.clone());

        let lease = self.lease.clone();
        let clock = self.clock.clone();
        let mut state = self.state.subscribe();
        let duration = self.settings.lease_duration_ms;
        let id = self.id;
        let next = token.clone();
        let result = self
            .controller
            .patch(PatchOptions::urgent(), move |draft| {
                let now = clock.now_ms();
                let owned = {
                    let view = lease.lock().unwrap_or_else(|e| e.into_inner());
                    draft.lease_token.as_ref() == Some(&view.owned)
                };
                // eligibility may have been lost while the patch was queued
                if !state.borrow_and_update().is_processing() || !owned || draft.locked_until_time <= now {
                    return Err(BobbinError::LockLost(id));
                }
                draft.lease_token = Some(next.clone());
                draft.locked_until_time = now + duration;
                Ok(())
            })
            .await;

        let mut view = self.lease();
        view.renewing = None;
        let persisted = result?;
        if !self.state().is_processing() {
            return Err(BobbinError::LockLost(self.id));
        }
        view.owned = token;
        view.locked_until = persisted.locked_until_time;
        Ok(persisted.locked_until_time)
    }

    fn lose_lock(&self) {
        self.settle(|s| s.is_processing(), ProcessingState::LockLost, || {
            tracing::warn!(task_id = %self.id, "lease lost");
            self.timers.cancel();
            self.emit(HolderEvent::LockLost);
            self.emit_inactive();
        });
    }
}

fn millis_until(deadline: i64, now: i64) -> Duration {
    Duration::from_millis(u64::try_from(deadline - now).unwrap_or(0))
}

/// Sleep unless cancelled first. Returns false when cancelled.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn renewal_loop(weak: Weak<Inner>, cancel: CancellationToken) {
    loop {
        let wait = {
            let Some(inner) = weak.upgrade() else { return };
            let locked_until = inner.lease().locked_until;
            let renew_at = locked_until - inner.settings.lease_duration_ms / 3;
            millis_until(renew_at, inner.clock.now_ms())
        };
        if !pause(&cancel, wait).await {
            return;
        }

        let Some(inner) = weak.upgrade() else { return };
        let now = inner.clock.now_ms();
        if !inner.state().is_processing() || !inner.is_lock_held() {
            return;
        }
        if !inner.within_budget(now) {
            tracing::info!(task_id = %inner.id, "execution budget spent, renewal stopped");
            return;
        }

        match inner.renew().await {
            Ok(locked_until_time) => {
                tracing::debug!(task_id = %inner.id, locked_until_time, "lease renewed");
                inner.emit(HolderEvent::LeaseRenewed { locked_until_time });
            }
            Err(BobbinError::LockLost(_)) => return,
            Err(err) => {
                tracing::warn!(task_id = %inner.id, error = %err, "lease renewal failed");
                inner.emit(HolderEvent::MaintenanceFailed {
                    error: err.to_string(),
                });
                let backoff = (inner.settings.lease_duration_ms / 10).max(10);
                drop(inner);
                if !pause(&cancel, Duration::from_millis(backoff as u64)).await {
                    return;
                }
            }
        }
    }
}

async fn expiry_loop(weak: Weak<Inner>, cancel: CancellationToken) {
    loop {
        let wait = {
            let Some(inner) = weak.upgrade() else { return };
            millis_until(inner.lease().locked_until, inner.clock.now_ms())
        };
        if !pause(&cancel, wait).await {
            return;
        }

        let Some(inner) = weak.upgrade() else { return };
        if !inner.state().is_processing() {
            return;
        }
        if inner.is_lock_held() {
            continue;
        }
        inner.lose_lock();
        return;
    }
}

async fn disable_poll_loop(weak: Weak<Inner>, cancel: CancellationToken) {
    let period = match weak.upgrade() {
        Some(inner) => Duration::from_millis(inner.settings.refresh_interval_ms),
        None => return,
    };
    loop {
        if !pause(&cancel, period).await {
            return;
        }
        let Some(inner) = weak.upgrade() else { return };
        if !inner.state().is_processing() {
            return;
        }
        if !inner.controller.record().enabled {
            continue;
        }

        match inner.controller.sync().await {
            Ok(Some(record)) => {
                if inner.initially_enabled
                    && !record.enabled
                    && !inner.disabled_reported.swap(true, Ordering::AcqRel)
                {
                    tracing::info!(task_id = %inner.id, "task disabled while running");
                    inner.emit(HolderEvent::Disabled);
                }
            }
            Ok(None) => {
                let err = BobbinError::NotFound(inner.id);
                tracing::warn!(task_id = %inner.id, "record deleted while running");
                inner.emit(HolderEvent::MaintenanceFailed {
                    error: err.to_string(),
                });
            }
            Err(err) => {
                tracing::warn!(task_id = %inner.id, error = %err, "disable poll failed");
                inner.emit(HolderEvent::MaintenanceFailed {
                    error: err.to_string(),
                });
            }
        }
    }
}
