//! Ports - 抽象化レイヤー
//!
//! Interfaces to everything outside the core: the document store, the clock
//! and id generation. Implementations live in `impls` (in-memory, retrying) or
//! in downstream crates.

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;
