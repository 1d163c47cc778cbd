//! Patch engine: merge patch, per-task serial lane and the data controller.

pub mod controller;
pub mod lane;
pub mod merge;

pub use self::controller::{PatchOptions, TaskDataController};
pub use self::lane::{Priority, SerialLane};
