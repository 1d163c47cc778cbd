//! Errors and their operational classification.
//!
//! # Classification
//! - Conflict: optimistic-concurrency violation, retried internally by the patch engine
//! - NotFound: surfaced, the caller decides
//! - Transient: store unavailable, retried with backoff at the store layer
//! - Fatal: never retried (invalid schedule, handler failure)
//! - Misuse: lifecycle programmer errors, surfaced synchronously

use thiserror::Error;

use super::ids::TaskId;
use super::task_type::TaskType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    NotFound,
    Transient,
    Fatal,
    Misuse,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BobbinError {
    #[error("version conflict while writing {0}")]
    Conflict(TaskId),

    #[error("{0} not found")]
    NotFound(TaskId),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid schedule `{expression}`: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("{0} has already finished processing")]
    AlreadyFinished(TaskId),

    #[error("{0} is already finishing")]
    FinishInProgress(TaskId),

    #[error("payload of {0} is already being saved")]
    ConcurrentSave(TaskId),

    #[error("listener for task_type={0} was already destroyed")]
    ListenerDestroyed(TaskType),

    #[error("lease on {0} was lost")]
    LockLost(TaskId),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("{0}")]
    Other(String),
}

impl BobbinError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BobbinError::Conflict(_) => ErrorKind::Conflict,
            BobbinError::NotFound(_) => ErrorKind::NotFound,
            BobbinError::Unavailable(_) => ErrorKind::Transient,
            BobbinError::InvalidSchedule { .. }
            | BobbinError::Handler(_)
            | BobbinError::Other(_) => ErrorKind::Fatal,
            BobbinError::AlreadyFinished(_)
            | BobbinError::FinishInProgress(_)
            | BobbinError::ConcurrentSave(_)
            | BobbinError::ListenerDestroyed(_)
            | BobbinError::LockLost(_) => ErrorKind::Misuse,
        }
    }

    /// Whether the store layer should retry the failed call.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn handler(message: impl Into<String>) -> Self {
        BobbinError::Handler(message.into())
    }
}
