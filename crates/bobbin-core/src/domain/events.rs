//! Events emitted by lease holders and listeners.
//!
//! Each holder and each listener owns its own broadcast channel; there is no
//! global bus.

use super::ids::TaskId;
use super::outcome::FinishOutcome;
use super::state::ProcessingState;

#[derive(Debug, Clone, PartialEq)]
pub enum HolderEvent {
    StateChanged {
        from: ProcessingState,
        to: ProcessingState,
    },
    Finished {
        outcome: FinishOutcome,
        error: Option<String>,
        delay_ms: Option<i64>,
    },
    LeaseRenewed {
        locked_until_time: i64,
    },
    LockLost,
    Disabled,
    /// A background timer (renewal, disable poll) hit an error and kept going.
    MaintenanceFailed {
        error: String,
    },
    /// Fires exactly once, when the holder stops owning the task for any reason.
    Inactive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    /// End of one poll cycle. A failed cycle leases nothing.
    Polled {
        leased: usize,
        has_more: bool,
        failed: bool,
    },
    /// The poll loop cycled through the whole failure backoff sequence.
    PollingStuck { consecutive_failures: usize },
    /// A holder is leaving the active set.
    FinishedTask {
        task_id: TaskId,
        state: ProcessingState,
        /// Size of the active set when the event fired, this task included.
        active_tasks: usize,
    },
}
