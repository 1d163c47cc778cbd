//! Domain model (ids, records, schedules, status, errors, events).

pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod record;
pub mod schedule;
pub mod state;
pub mod status;
pub mod task_type;

pub use self::errors::{BobbinError, ErrorKind};
pub use self::events::{HolderEvent, ListenerEvent};
pub use self::ids::{ETag, FencingSeed, LeaseToken, TaskId};
pub use self::outcome::FinishOutcome;
pub use self::record::{LastRun, TaskOptions, TaskRecord};
pub use self::schedule::{Interval, compute_next_run};
pub use self::state::ProcessingState;
pub use self::status::{TaskStatus, status};
pub use self::task_type::TaskType;
