//! Processing state of a lease holder.

use serde::{Deserialize, Serialize};

/// In-memory processing state of one leased task.
///
/// State transitions:
/// - Active -> Finishing -> Finished
/// - Finishing -> Active (the finishing write failed, the caller may retry)
/// - Active | Finishing -> LockLost (lease expiry detected; terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingState {
    Active,
    Finishing,
    Finished,
    LockLost,
}

impl ProcessingState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingState::Finished | ProcessingState::LockLost)
    }

    /// Still owns the task from the holder's point of view.
    pub fn is_processing(self) -> bool {
        matches!(self, ProcessingState::Active | ProcessingState::Finishing)
    }
}
