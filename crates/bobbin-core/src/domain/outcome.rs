//! Outcome of a finished delivery.

use serde::{Deserialize, Serialize};

/// How a lease holder finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinishOutcome {
    /// Run completed successfully.
    Completed,
    /// Run failed; recurrence continues if the schedule has more runs.
    Failed,
    /// Redelivery scheduled after a failed attempt.
    Retried,
    /// Redelivery scheduled without counting an attempt.
    Deferred,
    /// Lease given back without an outcome.
    Released,
    /// Holder abandoned locally; the server-side lease is left to expire.
    ForceReleased,
    /// Record deleted.
    Deleted,
}
