//! Domain errors for the Synapse graph engine.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::blueprint::BlueprintError;

/// Errors surfaced by the engine core.
///
/// `LockMiss` and `VersionConflict` are expected outcomes of optimistic
/// concurrency, not faults: a worker that observes one returns quietly and
/// relies on the next change notification to redeliver the task.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task {0} is locked by another worker")]
    LockMiss(Uuid),

    #[error("Version conflict on task {task_id}: expected {expected}")]
    VersionConflict { task_id: Uuid, expected: i64 },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("History version {version} not found for task {task_id}")]
    HistoryVersionNotFound { task_id: Uuid, version: i64 },

    #[error(transparent)]
    Blueprint(#[from] BlueprintError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether the error is worth retrying with backoff. Connection drops and
    /// serialization failures resolve on redelivery; everything else is
    /// either expected (lock miss, version conflict) or permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Broker(_))
    }

    /// Expected optimistic-concurrency outcomes that should stay below the
    /// warning threshold in logs.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LockMiss(_) | Self::VersionConflict { .. })
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for DomainError {
    fn from(err: redis::RedisError) -> Self {
        DomainError::Broker(err.to_string())
    }
}
