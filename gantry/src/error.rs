use thiserror::Error;

use crate::job::JobId;
use crate::unit::UnitId;

/// Result type for gantry operations.
pub type Result<T> = std::result::Result<T, GantryError>;

/// Errors that can occur in the gantry engine.
///
/// Expected business outcomes (quota denials, duplicate marks) are *not*
/// errors; they travel as data in [`crate::quota::QuotaDecision`] and the
/// tracking return values. This enum covers invalid calls and
/// infrastructure failures only.
#[derive(Debug, Error)]
pub enum GantryError {
    /// No job exists with the given id
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Job is not in a state that permits the requested operation
    #[error("Job {job} is {actual}, expected {expected}")]
    InvalidState {
        job: JobId,
        expected: String,
        actual: String,
    },

    /// No work unit exists with the given id
    #[error("Work unit not found: {0}")]
    UnitNotFound(UnitId),

    /// Invalid call parameters (e.g. negative unit counts)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Cache operation failed
    #[cfg(feature = "redis")]
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Internal error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
