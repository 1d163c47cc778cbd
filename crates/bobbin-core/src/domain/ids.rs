//! Domain identifiers (strongly-typed IDs) and lease fencing tokens.
//!
//! Task ids are ULIDs behind a phantom-typed `Id<T>`, so a `TaskId` cannot be
//! mixed up with any other identifier even though they share one layout.
//!
//! Lease tokens are opaque strings. The acquirer derives them from a per-batch
//! [`FencingSeed`] plus the candidate's position in the batch, which keeps the
//! tokens of one batch distinguishable from each other and from every other
//! batch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each id family.
///
/// Provides the prefix used by `Display`.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// `T` is a zero-sized marker; `Id<T>` has exactly the size of a `Ulid`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for task ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Identifier of a task record (unique within its task type).
pub type TaskId = Id<Task>;

/// Per-batch seed that lease tokens are derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FencingSeed(Ulid);

impl FencingSeed {
    pub fn new(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Token for the candidate at `index` within the batch seeded by `self`.
    pub fn token(&self, index: usize) -> LeaseToken {
        LeaseToken(format!("{}.{}", self.0, index))
    }
}

impl fmt::Display for FencingSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Fencing token proving which holder currently owns a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Optimistic-concurrency tag of a persisted record.
///
/// Every successful write produces a new value; a replace succeeds only when the
/// caller presents the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_display_has_prefix() {
        let ulid = Ulid::new();
        let id = TaskId::from_ulid(ulid);
        assert_eq!(id.as_ulid(), ulid);
        assert_eq!(id.to_string(), format!("task-{ulid}"));
    }

    #[test]
    fn task_id_serializes_as_bare_ulid() {
        let id = TaskId::from_ulid(Ulid::new());
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, format!("\"{}\"", id.as_ulid()));
        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        assert_eq!(std::mem::size_of::<TaskId>(), std::mem::size_of::<Ulid>());
    }

    #[test]
    fn tokens_from_one_seed_differ_per_position() {
        let seed = FencingSeed::new(Ulid::new());
        assert_ne!(seed.token(0), seed.token(1));
        assert_eq!(seed.token(3), seed.token(3));

        let other = FencingSeed::new(Ulid::new());
        assert_ne!(seed.token(0), other.token(0));
    }
}
