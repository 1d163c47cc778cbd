//! Lease protocol: batch acquisition, the per-task holder and retry backoff.

pub mod acquirer;
pub mod holder;
pub mod retry;

pub use self::acquirer::{LeaseAcquirer, LeaseBatch};
pub use self::holder::{FinishOptions, HolderSettings, LeaseHolder};
pub use self::retry::RetryPolicy;
