//! Durable storage for jobs and their work units.
//!
//! The store is the source of truth for job lifecycle and unit claims.
//! Claiming is the one operation with cross-worker concurrency semantics:
//! implementations must guarantee that a unit is handed to at most one
//! claimer, and that claimers never block each other (locked rows are
//! skipped, not waited on).

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{Job, JobId, JobStatus, RunnerId};
use crate::unit::{AnyUnit, Claimed, WorkUnit};

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Input for enqueueing one work unit when a job is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUnit {
    /// Caller-supplied reference to the underlying record.
    pub unit_ref: String,
    /// Opaque payload handed to the processor.
    pub payload: serde_json::Value,
}

impl NewUnit {
    pub fn new(unit_ref: impl Into<String>, payload: serde_json::Value) -> Self {
        NewUnit {
            unit_ref: unit_ref.into(),
            payload,
        }
    }
}

/// Per-state unit counts for a job, used for authoritative recounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitStateCounts {
    pub pending: i64,
    pub claimed: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Storage contract for jobs and work units.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job in `Pending` state together with its work units,
    /// indexed densely from zero in the given order.
    async fn create_job(
        &self,
        kind: &str,
        units: Vec<NewUnit>,
        unit_limit: Option<i64>,
    ) -> Result<Job>;

    /// Fetch a job row.
    ///
    /// # Errors
    /// - `JobNotFound` if no such job exists
    async fn get_job(&self, job_id: JobId) -> Result<Job>;

    /// Transition a job `Pending -> InProgress`.
    ///
    /// # Errors
    /// - `JobNotFound` if no such job exists
    /// - `InvalidState` if the job is not `Pending`
    async fn start_job(&self, job_id: JobId) -> Result<Job>;

    /// Atomically claim up to `batch_size` pending units with
    /// `unit_index > after_index`, in index order.
    ///
    /// Units already claimed (or locked) by a concurrent claimer are
    /// skipped, never waited on: N runners working one job partition the
    /// units without contention and without double-claims. May return fewer
    /// than `batch_size` units; an empty result means no claimable work
    /// remains past the cursor.
    async fn claim_batch(
        &self,
        job_id: JobId,
        runner_id: RunnerId,
        after_index: Option<i64>,
        batch_size: usize,
    ) -> Result<Vec<WorkUnit<Claimed>>>;

    /// Persist a unit's current state.
    ///
    /// # Errors
    /// - `UnitNotFound` if the unit doesn't exist
    async fn persist_unit(&self, unit: &AnyUnit) -> Result<()>;

    /// Release any units still claimed by `runner_id` back to `Pending`,
    /// returning how many were released. Used on cancellation and when
    /// recovering from a crashed runner.
    async fn release_claimed(&self, job_id: JobId, runner_id: RunnerId) -> Result<u64>;

    /// Fold incremental counts into the durable job row. Deltas, not
    /// absolutes, so concurrent runners checkpointing the same job compose.
    async fn checkpoint_job(&self, job_id: JobId, completed_delta: i64, failed_delta: i64)
        -> Result<()>;

    /// Transition an `InProgress` job to a terminal status, writing the
    /// authoritative (absolute) final counts and the result metadata.
    ///
    /// # Errors
    /// - `InvalidRequest` if `status` is not terminal
    /// - `JobNotFound` / `InvalidState` as for [`start_job`](Self::start_job)
    async fn finalize_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        completed_units: i64,
        failed_units: i64,
        result_metadata: serde_json::Value,
    ) -> Result<Job>;

    /// Count units by state, for authoritative recounts at finalization.
    async fn unit_state_counts(&self, job_id: JobId) -> Result<UnitStateCounts>;
}
