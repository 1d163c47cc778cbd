//! Status projection: the human-facing status of a task.

use serde::{Deserialize, Serialize};

use super::record::TaskRecord;

/// Task status derived from the raw record fields.
///
/// State transitions (driven by time and writes, never stored):
/// - Scheduled -> Pending (next run time passes)
/// - Pending -> Running (lease acquired)
/// - Running -> Pending (lease expires without a finish)
/// - Running -> Scheduled | Completed | Failed (run finished)
/// - any non-terminal -> Disabled / Disabling (task disabled)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Scheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Disabling,
    Disabled,
}

impl TaskStatus {
    /// Is this a terminal state (no further runs)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Project the status of `record` at `now`.
///
/// Terminal states win over disablement.
pub fn status(record: &TaskRecord, now: i64) -> TaskStatus {
    let as_if_enabled = match record.next_run_time {
        None if record.last_run.is_some_and(|r| r.succeeded) => TaskStatus::Completed,
        None => TaskStatus::Failed,
        Some(_) if record.locked_until_time > now => TaskStatus::Running,
        Some(next) if next < now => TaskStatus::Pending,
        Some(_) => TaskStatus::Scheduled,
    };

    if record.enabled || as_if_enabled.is_terminal() {
        return as_if_enabled;
    }
    match as_if_enabled {
        TaskStatus::Running => TaskStatus::Disabling,
        _ => TaskStatus::Disabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::{LastRun, TaskOptions};
    use crate::domain::task_type::TaskType;
    use rstest::rstest;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn record(
        enabled: bool,
        next_run_time: Option<i64>,
        locked_until_time: i64,
        last_succeeded: Option<bool>,
    ) -> TaskRecord {
        let mut r =
            TaskRecord::new(TaskType::new("t"), json!({}), TaskOptions::default(), NOW).unwrap();
        r.enabled = enabled;
        r.next_run_time = next_run_time;
        r.locked_until_time = locked_until_time;
        r.last_run = last_succeeded.map(|succeeded| LastRun {
            start_time: NOW - 10,
            finish_time: NOW - 5,
            succeeded,
        });
        r
    }

    #[rstest]
    #[case(true, None, 0, Some(true), TaskStatus::Completed)]
    #[case(true, None, 0, Some(false), TaskStatus::Failed)]
    #[case(true, None, 0, None, TaskStatus::Failed)]
    #[case(true, Some(NOW - 1), NOW + 1, None, TaskStatus::Running)]
    #[case(true, Some(NOW - 1), 0, None, TaskStatus::Pending)]
    #[case(true, Some(NOW), 0, None, TaskStatus::Scheduled)]
    #[case(true, Some(NOW + 1), 0, None, TaskStatus::Scheduled)]
    #[case(false, Some(NOW - 1), NOW + 1, None, TaskStatus::Disabling)]
    #[case(false, Some(NOW - 1), 0, None, TaskStatus::Disabled)]
    #[case(false, Some(NOW + 1), 0, None, TaskStatus::Disabled)]
    #[case(false, None, 0, Some(true), TaskStatus::Completed)]
    #[case(false, None, 0, Some(false), TaskStatus::Failed)]
    fn projects_status(
        #[case] enabled: bool,
        #[case] next_run_time: Option<i64>,
        #[case] locked_until_time: i64,
        #[case] last_succeeded: Option<bool>,
        #[case] expected: TaskStatus,
    ) {
        let r = record(enabled, next_run_time, locked_until_time, last_succeeded);
        assert_eq!(status(&r, NOW), expected);
    }

    #[test]
    fn advancing_time_moves_scheduled_to_pending() {
        let r = record(true, Some(NOW + 100), 0, None);
        assert_eq!(status(&r, NOW), TaskStatus::Scheduled);
        assert_eq!(status(&r, NOW + 101), TaskStatus::Pending);
    }

    #[test]
    fn advancing_time_past_lock_moves_running_to_pending() {
        let r = record(true, Some(NOW - 100), NOW + 50, None);
        assert_eq!(status(&r, NOW), TaskStatus::Running);
        assert_eq!(status(&r, NOW + 50), TaskStatus::Pending);
    }
}
