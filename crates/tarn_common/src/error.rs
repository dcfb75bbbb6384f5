//! Error taxonomy for lock acquisition.
//!
//! Only *recoverable* failures are represented here; the caller may retry or
//! abort its operation. Programming errors (dropping a Locker with
//! outstanding locks, taking a collection lock without the Global lock,
//! saving state mid unit-of-work) are assertion failures, never `Err`.
//!
//! Every failed wait comes with guaranteed cleanup: the session holds no
//! record of the resource it failed to acquire.

use thiserror::Error;

use crate::types::{LockMode, LockerId, ResourceId};

/// Convenience alias for `Result<T, LockError>`.
pub type TarnResult<T> = Result<T, LockError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Deadline elapsed while waiting. Also raised for ticket-pool
    /// exhaustion, so admission backpressure is indistinguishable from lock
    /// contention to callers.
    #[error("timed out waiting for {resource} in mode {mode}")]
    Timeout {
        resource: ResourceId,
        mode: LockMode,
    },

    /// The polling session found itself in a wait-for cycle. The request has
    /// been unwound; the caller must release its locks and may retry.
    #[error("deadlock detected waiting for {resource} (cycle: {cycle:?})")]
    Deadlock {
        resource: ResourceId,
        cycle: Vec<LockerId>,
    },

    /// The operation was externally cancelled while waiting. Not retried by
    /// this layer.
    #[error("interrupted while waiting for {resource} in mode {mode}")]
    Interrupted {
        resource: ResourceId,
        mode: LockMode,
    },
}

impl LockError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, LockError::Deadlock { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}
