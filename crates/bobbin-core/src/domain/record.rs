//! Task record: the persisted, versioned document.
//!
//! This is the single source of truth for a task. Every process that leases,
//! renews or finishes a task does so by reading a `TaskRecord`, editing a copy
//! and writing it back guarded by `version`.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::errors::BobbinError;
use super::ids::{ETag, LeaseToken, TaskId};
use super::schedule::{Interval, compute_next_run};
use super::status::{TaskStatus, status};
use super::task_type::TaskType;

/// Outcome of the most recently finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastRun {
    pub start_time: i64,
    pub finish_time: i64,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub enabled: bool,

    /// All times are unix milliseconds.
    pub create_time: i64,
    /// `None` means no future run is scheduled (terminal).
    pub next_run_time: Option<i64>,

    /// 0 means unlocked.
    pub locked_until_time: i64,
    pub lease_token: Option<LeaseToken>,

    /// Stable across the deliveries of one run.
    pub current_run_start_time: Option<i64>,

    pub deliveries: u32,
    pub attempts: u32,
    pub runs: u32,
    pub last_run: Option<LastRun>,

    pub interval: Option<Interval>,
    pub ttl_after_finish_ms: Option<i64>,
    /// 0 or `None` means unlimited.
    pub max_execution_time_ms: Option<i64>,

    /// Store-native time to live in seconds, counted from `updated_time`.
    pub ttl: Option<i64>,
    /// Time of the last successful write. Maintained by the store.
    #[serde(default)]
    pub updated_time: i64,

    pub payload: serde_json::Value,

    /// `None` until the record has been written once.
    pub version: Option<ETag>,
}

/// Options for creating a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskOptions {
    pub id: Option<TaskId>,
    /// Explicit first run time; defaults to the schedule's first run.
    pub run_at: Option<i64>,
    pub interval: Option<Interval>,
    pub enabled: Option<bool>,
    pub ttl_after_finish_ms: Option<i64>,
    pub max_execution_time_ms: Option<i64>,
}

impl TaskRecord {
    /// Build a fresh, never-written record.
    pub fn new(
        task_type: TaskType,
        payload: serde_json::Value,
        options: TaskOptions,
        now: i64,
    ) -> Result<Self, BobbinError> {
        if let Some(interval) = &options.interval {
            interval.validate()?;
        }
        let next_run_time = match options.run_at {
            Some(at) => Some(at),
            None => compute_next_run(options.interval.as_ref(), None, now)?,
        };
        Ok(Self {
            id: options.id.unwrap_or_else(|| TaskId::from_ulid(Ulid::new())),
            task_type,
            enabled: options.enabled.unwrap_or(true),
            create_time: now,
            next_run_time,
            locked_until_time: 0,
            lease_token: None,
            current_run_start_time: None,
            deliveries: 0,
            attempts: 0,
            runs: 0,
            last_run: None,
            interval: options.interval,
            ttl_after_finish_ms: options.ttl_after_finish_ms,
            max_execution_time_ms: options.max_execution_time_ms,
            ttl: None,
            updated_time: now,
            payload,
            version: None,
        })
    }

    pub fn status(&self, now: i64) -> TaskStatus {
        status(self, now)
    }

    pub fn is_locked(&self, now: i64) -> bool {
        self.locked_until_time > now
    }

    /// Drop the lease fields.
    pub fn clear_lease(&mut self) {
        self.locked_until_time = 0;
        self.lease_token = None;
    }

    /// Account for a lease that expired without an explicit finish.
    ///
    /// Counts the abandoned delivery once (`attempts` and `deliveries`) and
    /// drops the stale token so no later observer counts it again. Returns
    /// whether anything changed. Shared by the lease acquirer and by the local
    /// normalization of the patch engine.
    pub fn account_abandoned_lease(&mut self, now: i64) -> bool {
        if self.lease_token.is_none() || self.locked_until_time > now {
            return false;
        }
        self.attempts += 1;
        self.deliveries += 1;
        self.lease_token = None;
        true
    }
}
