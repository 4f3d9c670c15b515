//! Ephemeral job tracking: live progress, the idempotency bitmap and
//! bounded error aggregation.
//!
//! Everything here is advisory and TTL-bound. A lost progress snapshot
//! degrades status reads to the durable job row; a lost idempotency bitmap
//! degrades a resumed run to at-least-once. Terminal counts are always
//! persisted durably by the runner before a job is reported complete;
//! these caches are never the only place a final number lives.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::JobId;

pub mod in_memory;

#[cfg(feature = "redis")]
pub mod redis;

/// Default number of error samples retained per job.
pub const DEFAULT_SAMPLE_CAP: usize = 5;

/// Live progress of a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    /// Units processed successfully.
    pub processed: i64,
    /// Units that failed.
    pub errors: i64,
    /// Reference of the most recently processed unit.
    pub current_item: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Processing rate in units per second; 0 when no time has elapsed.
    pub fn rate(&self) -> f64 {
        let elapsed_ms = (self.last_update_at - self.started_at).num_milliseconds();
        if elapsed_ms <= 0 {
            return 0.0;
        }
        self.processed as f64 / (elapsed_ms as f64 / 1000.0)
    }
}

/// A progress mutation. Increment fields apply atomically (commutative
/// across concurrent writers); absolute fields overwrite, for when the
/// caller has an authoritative recount and wants to correct drift.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub increment_processed: Option<i64>,
    pub increment_errors: Option<i64>,
    pub absolute_processed: Option<i64>,
    pub absolute_errors: Option<i64>,
    pub current_item: Option<String>,
}

impl ProgressUpdate {
    pub fn increments(processed: i64, errors: i64) -> Self {
        ProgressUpdate {
            increment_processed: (processed != 0).then_some(processed),
            increment_errors: (errors != 0).then_some(errors),
            ..Default::default()
        }
    }

    pub fn absolute(processed: i64, errors: i64) -> Self {
        ProgressUpdate {
            absolute_processed: Some(processed),
            absolute_errors: Some(errors),
            ..Default::default()
        }
    }

    pub fn with_current_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == ProgressUpdate::default()
    }
}

/// Fast-read progress mirror for polling clients.
#[async_trait::async_trait]
pub trait ProgressCache: Send + Sync {
    /// Begin tracking a job, zeroing any previous state under its key.
    async fn start_tracking(&self, job_id: JobId, current_item: Option<&str>) -> Result<()>;

    /// Read the live snapshot. `None` when tracking was never started,
    /// was stopped, or the entry expired; callers fall back to the
    /// durable job row.
    async fn get_progress(&self, job_id: JobId) -> Result<Option<ProgressSnapshot>>;

    /// Apply a progress mutation. Increments use the backend's atomic
    /// increment primitive, so concurrent writers never lose updates.
    async fn update_progress(&self, job_id: JobId, update: ProgressUpdate) -> Result<()>;

    /// Delete the tracking entry.
    async fn stop_tracking(&self, job_id: JobId) -> Result<()>;
}

/// Per-job bitmap of processed work-unit indices.
///
/// This index only prevents duplicate side effects when a job run is
/// retried or resumed; it is not durable beyond its TTL and it is not a
/// substitute for the quota ledger. If the bitmap is lost before the job
/// completes, a resumed run degrades to at-least-once: callers keep their
/// per-unit side effects idempotent or accept rare duplicates.
#[async_trait::async_trait]
pub trait IdempotencyIndex: Send + Sync {
    /// Set the bit for `index`, returning whether it was already set. The
    /// previous value is observed atomically with the write: of any number
    /// of racing callers, exactly one sees `false`.
    async fn mark_processed(&self, job_id: JobId, index: i64) -> Result<bool>;

    /// Read the bit for `index` without modifying it.
    async fn is_processed(&self, job_id: JobId, index: i64) -> Result<bool>;

    /// Drop the bitmap (called on job completion).
    async fn clear_processed(&self, job_id: JobId) -> Result<()>;
}

/// One sampled error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: String,
    pub unit_ref: String,
    pub batch_index: i64,
    pub message: String,
}

/// Bounded-memory error summary: exact totals, capped samples.
///
/// `total` and `counts_by_kind` reflect every recorded error; only
/// `samples` is truncated (the first N are kept).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total: i64,
    pub counts_by_kind: BTreeMap<String, i64>,
    pub samples: Vec<RecordedError>,
}

impl ErrorSummary {
    /// Caller-level policy helper: a run is fully failed when every
    /// attempted unit errored.
    pub fn is_total_failure(&self, units_attempted: i64) -> bool {
        units_attempted > 0 && self.total == units_attempted
    }
}

/// Bounded error collection per job.
#[async_trait::async_trait]
pub trait ErrorAggregator: Send + Sync {
    /// Record one error: bumps the exact total and the per-kind counter,
    /// and appends to the sample list if it is not yet full.
    async fn record_error(
        &self,
        scope: JobId,
        kind: &str,
        unit_ref: &str,
        batch_index: i64,
        message: &str,
    ) -> Result<()>;

    /// Current summary. `total == counts_by_kind.values().sum()` always.
    async fn error_summary(&self, scope: JobId) -> Result<ErrorSummary>;

    /// Drop all recorded errors for the scope.
    async fn clear_errors(&self, scope: JobId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn rate_is_zero_without_elapsed_time() {
        let now = Utc::now();
        let snapshot = ProgressSnapshot {
            job_id: JobId::new(),
            processed: 100,
            errors: 0,
            current_item: None,
            started_at: now,
            last_update_at: now,
        };
        assert_eq!(snapshot.rate(), 0.0);
    }

    #[test]
    fn rate_is_units_per_second() {
        let now = Utc::now();
        let snapshot = ProgressSnapshot {
            job_id: JobId::new(),
            processed: 50,
            errors: 3,
            current_item: None,
            started_at: now,
            last_update_at: now + Duration::seconds(10),
        };
        assert!((snapshot.rate() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_update_detection() {
        assert!(ProgressUpdate::default().is_empty());
        assert!(ProgressUpdate::increments(0, 0).is_empty());
        assert!(!ProgressUpdate::increments(1, 0).is_empty());
        assert!(!ProgressUpdate::absolute(0, 0).is_empty());
    }

    #[test]
    fn total_failure_requires_attempts() {
        let mut summary = ErrorSummary::default();
        assert!(!summary.is_total_failure(0));
        summary.total = 3;
        assert!(summary.is_total_failure(3));
        assert!(!summary.is_total_failure(4));
    }
}
