//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{FencingSeed, TaskId};
use crate::ports::Clock;

/// Generates task ids and the fencing seeds lease tokens are derived from.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    /// Fresh seed for one acquisition batch.
    fn fencing_seed(&self) -> FencingSeed;
}

/// ULID generator driven by a `Clock`.
///
/// With a `FixedClock` the timestamp half is deterministic; the random half
/// still keeps every id distinct.
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now_ms().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from_ulid(self.next_ulid())
    }

    fn fencing_seed(&self) -> FencingSeed {
        FencingSeed::new(self.next_ulid())
    }
}
