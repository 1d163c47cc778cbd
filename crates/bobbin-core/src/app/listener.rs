//! Listener - per task type polling loop.
//!
//! # Flow
//! 1. `poll`: lease up to the free capacity through `LeaseAcquirer`
//! 2. wrap every lease in a `LeaseHolder` and run the handler on it
//! 3. `has_more` polls again at once; otherwise wait `poll_interval_ms` + jitter
//! 4. acquire errors walk the cyclic backoff list, reporting `PollingStuck`
//!    after each full cycle
//!
//! A task leaving the active set triggers another poll, since capacity just
//! freed up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::config::ListenerConfig;
use super::handler::TaskHandler;
use crate::domain::{BobbinError, ListenerEvent, ProcessingState, TaskId, TaskRecord, TaskType};
use crate::lease::{FinishOptions, LeaseAcquirer, LeaseHolder};
use crate::ports::{Clock, IdGenerator, TaskStore};

const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct PollState {
    consecutive_failures: usize,
}

struct Inner {
    task_type: TaskType,
    config: ListenerConfig,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    handler: Arc<dyn TaskHandler>,
    acquirer: LeaseAcquirer,
    running: AtomicBool,
    destroyed: AtomicBool,
    active: Mutex<HashMap<TaskId, LeaseHolder>>,
    /// Held for the duration of one poll.
    poll: tokio::sync::Mutex<PollState>,
    /// Cancels the pending poll timer.
    timer: Mutex<CancellationToken>,
    events: broadcast::Sender<ListenerEvent>,
}

pub struct Listener {
    inner: Arc<Inner>,
}

impl Listener {
    pub(crate) fn new(
        task_type: TaskType,
        config: ListenerConfig,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                acquirer: LeaseAcquirer::new(store.clone(), clock.clone()),
                task_type,
                config,
                store,
                clock,
                ids,
                handler,
                running: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                active: Mutex::new(HashMap::new()),
                poll: tokio::sync::Mutex::new(PollState::default()),
                timer: Mutex::new(CancellationToken::new()),
                events,
            }),
        }
    }

    pub fn task_type(&self) -> &TaskType {
        &self.inner.task_type
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.inner.config
    }

    /// Start polling. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), BobbinError> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(BobbinError::ListenerDestroyed(self.inner.task_type.clone()));
        }
        if !self.inner.running.swap(true, Ordering::AcqRel) {
            tracing::info!(task_type = %self.inner.task_type, "listener started");
            self.inner.schedule_poll(Duration::ZERO);
        }
        Ok(())
    }

    /// Stop polling. Tasks already running are left alone.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            tracing::info!(task_type = %self.inner.task_type, "listener stopped");
        }
        self.inner.cancel_timer();
    }

    /// Stop, wait for a poll in progress, then release every active task
    /// without saving payloads. Fails when called a second time.
    pub async fn destroy(&self) -> Result<(), BobbinError> {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Err(BobbinError::ListenerDestroyed(self.inner.task_type.clone()));
        }
        self.stop();
        let _poll = self.inner.poll.lock().await;

        let holders: Vec<LeaseHolder> = {
            let mut active = self.inner.lock_active();
            active.drain().map(|(_, holder)| holder).collect()
        };
        tracing::info!(task_type = %self.inner.task_type, releasing = holders.len(), "listener destroyed");
        for holder in holders {
            if let Err(err) = holder.release(FinishOptions::without_payload()).await {
                tracing::warn!(task_id = %holder.id(), error = %err, "release on destroy failed");
                holder.force_release(Some(err.to_string()));
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock_active().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.inner.events.subscribe()
    }

    /// Poll right away instead of waiting for the timer.
    pub async fn poll_now(&self) {
        self.inner.poll().await;
    }
}

impl Inner {
    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, LeaseHolder>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ListenerEvent) {
        let _ = self.events.send(event);
    }

    fn cancel_timer(&self) {
        self.timer.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    /// Replace the pending poll timer with one firing after `delay`.
    fn schedule_poll(self: &Arc<Self>, delay: Duration) {
        let cancel = CancellationToken::new();
        {
            let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
            timer.cancel();
            *timer = cancel.clone();
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(inner) = weak.upgrade() {
                inner.poll().await;
            }
        });
    }

    fn idle_delay(&self) -> Duration {
        let jitter = match self.config.poll_jitter_ms {
            0 => 0,
            max => rand::thread_rng().gen_range(0..=max),
        };
        Duration::from_millis(self.config.poll_interval_ms + jitter)
    }

    async fn poll(self: &Arc<Self>) {
        let mut state = self.poll.lock().await;
        loop {
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            let active = self.lock_active().len();
            let capacity = self.config.max_active_tasks.saturating_sub(active);
            if capacity == 0 {
                return;
            }

            let seed = self.ids.fencing_seed();
            let batch = self
                .acquirer
                .acquire(&self.task_type, self.config.lease_duration_ms, capacity, &seed)
                .await;

            match batch {
                Ok(batch) => {
                    state.consecutive_failures = 0;
                    let leased = batch.leased.len();
                    for record in batch.leased {
                        self.dispatch(record);
                    }
                    self.emit(ListenerEvent::Polled {
                        leased,
                        has_more: batch.has_more,
                        failed: false,
                    });
                    if batch.has_more {
                        continue;
                    }
                    self.schedule_poll(self.idle_delay());
                    return;
                }
                Err(err) => {
                    let backoff = &self.config.poll_failure_backoff_ms;
                    let cycle = backoff.len().max(1);
                    let delay = backoff
                        .get(state.consecutive_failures % cycle)
                        .copied()
                        .unwrap_or(self.config.poll_interval_ms);
                    state.consecutive_failures += 1;
                    tracing::warn!(
                        task_type = %self.task_type,
                        error = %err,
                        failures = state.consecutive_failures,
                        "poll failed"
                    );
                    if state.consecutive_failures % cycle == 0 {
                        tracing::error!(
                            task_type = %self.task_type,
                            failures = state.consecutive_failures,
                            "polling is stuck"
                        );
                        self.emit(ListenerEvent::PollingStuck {
                            consecutive_failures: state.consecutive_failures,
                        });
                    }
                    self.emit(ListenerEvent::Polled {
                        leased: 0,
                        has_more: false,
                        failed: true,
                    });
                    self.schedule_poll(Duration::from_millis(delay));
                    return;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, record: TaskRecord) {
        let holder = LeaseHolder::new(
            record,
            self.store.clone(),
            self.clock.clone(),
            self.ids.clone(),
            self.config.holder_settings(),
        );
        self.lock_active().insert(holder.id(), holder.clone());
        tokio::spawn(run_task(Arc::downgrade(self), self.handler.clone(), holder));
    }

    fn on_task_finished(self: &Arc<Self>, id: TaskId, state: ProcessingState) {
        let active_tasks = self.lock_active().len();
        self.emit(ListenerEvent::FinishedTask {
            task_id: id,
            state,
            active_tasks,
        });
        self.lock_active().remove(&id);
        if self.running.load(Ordering::Acquire) {
            let inner = self.clone();
            tokio::spawn(async move { inner.poll().await });
        }
    }
}

/// Run the handler, racing it against the holder finishing from outside,
/// then supply the implicit finish.
async fn run_task(listener: Weak<Inner>, handler: Arc<dyn TaskHandler>, holder: LeaseHolder) {
    let id = holder.id();
    let mut work = {
        let holder = holder.clone();
        tokio::spawn(async move { handler.handle(holder).await })
    };
    let returned = tokio::select! {
        joined = &mut work => Some(joined),
        _ = until_terminal(holder.watch_state()) => None,
    };

    match returned {
        Some(Ok(Ok(()))) => {
            if holder.state() == ProcessingState::Active {
                if let Err(err) = holder.complete(None, FinishOptions::default()).await {
                    tracing::warn!(task_id = %id, error = %err, "implicit complete failed");
                    holder.force_release(Some(err.to_string()));
                }
            }
        }
        Some(Ok(Err(err))) => implicit_retry(&holder, err.to_string()).await,
        Some(Err(join_err)) => implicit_retry(&holder, format!("handler panicked: {join_err}")).await,
        None => {
            // the handler keeps running; drain it so its outcome is logged
            tokio::spawn(async move {
                match work.await {
                    Ok(Ok(())) => tracing::debug!(task_id = %id, "handler returned after the task finished"),
                    Ok(Err(err)) => tracing::debug!(task_id = %id, error = %err, "handler failed after the task finished"),
                    Err(join_err) => tracing::warn!(task_id = %id, error = %join_err, "handler panicked after the task finished"),
                }
            });
        }
    }

    // a finish started by the handler may still be in flight
    until_terminal(holder.watch_state()).await;
    if let Some(listener) = listener.upgrade() {
        listener.on_task_finished(id, holder.state());
    }
}

async fn until_terminal(mut state: watch::Receiver<ProcessingState>) {
    let _ = state.wait_for(|s| s.is_terminal()).await;
}

async fn implicit_retry(holder: &LeaseHolder, error: String) {
    tracing::info!(task_id = %holder.id(), %error, "handler failed, retrying");
    if holder.state() != ProcessingState::Active {
        return;
    }
    if let Err(err) = holder
        .retry(Some(error), None, FinishOptions::without_payload())
        .await
    {
        tracing::warn!(task_id = %holder.id(), error = %err, "implicit retry failed");
        holder.force_release(Some(err.to_string()));
    }
}
