//! Batch-claim engine for long-running background operations with
//! per-tenant quota enforcement.
//!
//! This crate provides the machinery for driving bulk operations (record
//! approvals, content scans, scoring runs) across many concurrent workers:
//! - Jobs with type-safe work-unit state transitions and skip-locked,
//!   cursor-paged batch claiming
//! - A quota ledger that serializes competing writers per
//!   `(tenant, resource)` key, so limits hold under any concurrency
//! - An idempotency bitmap that makes resumed runs skip finished units
//! - A TTL-bound progress cache for cheap near-real-time polling
//! - Bounded error aggregation: exact totals, capped samples
//!
//! # Example
//! ```ignore
//! use gantry::{InMemoryJobStore, InMemoryQuotaLedger, InMemoryTracker};
//! use gantry::{JobRunner, NewUnit, RunnerConfig};
//!
//! let runner = JobRunner::new(store, tracker, ledger, processor, RunnerConfig::default());
//!
//! // Enqueue a job with its work units
//! let job = runner.submit("bulk_approval", units, None).await?;
//!
//! // Drive it to completion
//! let report = runner.run(job.id).await?;
//!
//! // Poll status cheaply from anywhere
//! let status = runner.status(job.id).await?;
//! ```
//!
//! Durable state lives behind [`store::JobStore`] and [`quota::QuotaLedger`]
//! (PostgreSQL backends under the `postgres` feature), ephemeral state
//! behind the three tracking traits (Redis backend under the `redis`
//! feature). Every trait ships an in-memory implementation for tests and
//! single-process embeddings.

pub mod error;
pub mod job;
pub mod processor;
pub mod quota;
pub mod runner;
pub mod store;
pub mod tracking;
pub mod unit;

// Re-export commonly used types
pub use error::{GantryError, Result};
pub use job::{Job, JobId, JobStats, JobStatus, RunnerId, StatusReport};
pub use processor::{MockProcessor, QuotaCharge, UnitError, UnitProcessor};
pub use quota::in_memory::InMemoryQuotaLedger;
pub use quota::{
    LimitDimension, LimitScope, QuotaDecision, QuotaLedger, QuotaLimits, ResourceQuota, TenantId,
    UsageRecord,
};
pub use runner::{JobRunner, RunReport, RunnerConfig};
pub use store::in_memory::InMemoryJobStore;
pub use store::{JobStore, NewUnit, UnitStateCounts};
pub use tracking::in_memory::InMemoryTracker;
pub use tracking::{
    ErrorAggregator, ErrorSummary, IdempotencyIndex, ProgressCache, ProgressSnapshot,
    ProgressUpdate, RecordedError,
};
pub use unit::{AnyUnit, UnitData, UnitId, UnitState, WorkUnit};

#[cfg(feature = "postgres")]
pub use quota::postgres::PostgresQuotaLedger;
#[cfg(feature = "postgres")]
pub use store::postgres::PostgresJobStore;

#[cfg(feature = "redis")]
pub use tracking::redis::{RedisTracker, TrackerConfig};
