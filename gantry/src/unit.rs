//! Work-unit lifecycle, modeled with the typestate pattern.
//!
//! A unit progresses `Pending -> Claimed -> Completed | Failed`. The state
//! parameter makes invalid transitions unrepresentable: only a claimed unit
//! can be completed or failed, and claiming is performed atomically by the
//! store, never by constructing a `Claimed` state by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobId, RunnerId};

/// Unique identifier for a work unit.
pub type UnitId = Uuid;

/// Marker trait for valid work-unit states.
pub trait UnitState: Send + Sync {}

/// A single unit of work belonging to a job.
#[derive(Debug, Clone)]
pub struct WorkUnit<S: UnitState> {
    /// The current state of the unit.
    pub state: S,
    /// The unit's identity and payload.
    pub data: UnitData,
}

/// Identity and payload of a work unit, constant across state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitData {
    pub id: UnitId,
    pub job_id: JobId,

    /// Position of the unit within its job. Stable, dense, zero-based;
    /// the claim cursor and the idempotency bitmap are both keyed on it.
    pub index: i64,

    /// Caller-supplied reference to the underlying record (e.g. a candidate
    /// id), used in error samples and logs.
    pub unit_ref: String,

    /// Opaque payload handed to the processor.
    pub payload: serde_json::Value,
}

/// Unit is waiting to be claimed.
#[derive(Debug, Clone)]
pub struct Pending {}

impl UnitState for Pending {}

/// Unit has been claimed by a runner.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub runner_id: RunnerId,
    pub claimed_at: DateTime<Utc>,
}

impl UnitState for Claimed {}

/// Unit was processed successfully.
#[derive(Debug, Clone)]
pub struct Completed {
    pub claimed_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl UnitState for Completed {}

/// Unit processing failed; the failure is recorded, the batch continues.
#[derive(Debug, Clone)]
pub struct Failed {
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl UnitState for Failed {}

impl WorkUnit<Claimed> {
    /// Transition to `Completed`. The caller persists the result via
    /// [`crate::store::JobStore::persist_unit`].
    pub fn complete(self) -> WorkUnit<Completed> {
        WorkUnit {
            state: Completed {
                claimed_at: self.state.claimed_at,
                completed_at: Utc::now(),
            },
            data: self.data,
        }
    }

    /// Transition to `Failed` with an error description.
    pub fn fail(self, error: impl Into<String>) -> WorkUnit<Failed> {
        WorkUnit {
            state: Failed {
                error: error.into(),
                failed_at: Utc::now(),
            },
            data: self.data,
        }
    }

    /// Transition back to `Pending`, releasing the claim.
    pub fn release(self) -> WorkUnit<Pending> {
        WorkUnit {
            state: Pending {},
            data: self.data,
        }
    }
}

// ============================================================================
// Unified Unit Representation
// ============================================================================

/// Enum that can hold a work unit in any state, for uniform storage.
#[derive(Debug, Clone)]
pub enum AnyUnit {
    Pending(WorkUnit<Pending>),
    Claimed(WorkUnit<Claimed>),
    Completed(WorkUnit<Completed>),
    Failed(WorkUnit<Failed>),
}

impl AnyUnit {
    /// Get the unit id regardless of state.
    pub fn id(&self) -> UnitId {
        self.data().id
    }

    /// Get the unit data regardless of state.
    pub fn data(&self) -> &UnitData {
        match self {
            AnyUnit::Pending(u) => &u.data,
            AnyUnit::Claimed(u) => &u.data,
            AnyUnit::Completed(u) => &u.data,
            AnyUnit::Failed(u) => &u.data,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AnyUnit::Pending(_))
    }

    /// Check if the unit is in a terminal state (completed or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyUnit::Completed(_) | AnyUnit::Failed(_))
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            AnyUnit::Pending(_) => "pending",
            AnyUnit::Claimed(_) => "claimed",
            AnyUnit::Completed(_) => "completed",
            AnyUnit::Failed(_) => "failed",
        }
    }
}

impl From<WorkUnit<Pending>> for AnyUnit {
    fn from(u: WorkUnit<Pending>) -> Self {
        AnyUnit::Pending(u)
    }
}

impl From<WorkUnit<Claimed>> for AnyUnit {
    fn from(u: WorkUnit<Claimed>) -> Self {
        AnyUnit::Claimed(u)
    }
}

impl From<WorkUnit<Completed>> for AnyUnit {
    fn from(u: WorkUnit<Completed>) -> Self {
        AnyUnit::Completed(u)
    }
}

impl From<WorkUnit<Failed>> for AnyUnit {
    fn from(u: WorkUnit<Failed>) -> Self {
        AnyUnit::Failed(u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed_unit() -> WorkUnit<Claimed> {
        WorkUnit {
            state: Claimed {
                runner_id: RunnerId::new(),
                claimed_at: Utc::now(),
            },
            data: UnitData {
                id: Uuid::new_v4(),
                job_id: JobId::new(),
                index: 0,
                unit_ref: "candidate-42".to_string(),
                payload: serde_json::json!({}),
            },
        }
    }

    #[test]
    fn complete_preserves_claim_time() {
        let unit = claimed_unit();
        let claimed_at = unit.state.claimed_at;
        let completed = unit.complete();
        assert_eq!(completed.state.claimed_at, claimed_at);
        assert!(completed.state.completed_at >= claimed_at);
    }

    #[test]
    fn fail_carries_the_error() {
        let failed = claimed_unit().fail("boom");
        assert_eq!(failed.state.error, "boom");
        assert!(AnyUnit::from(failed).is_terminal());
    }

    #[test]
    fn released_unit_is_pending_again() {
        let released = claimed_unit().release();
        assert!(AnyUnit::from(released).is_pending());
    }
}
