//! The batch-claim runner: drives a job from `Pending` to a terminal state.
//!
//! The runner loops claiming batches of pending units (cursor-paged, skip-
//! locked), dispatches each batch onto a bounded `JoinSet`, and reports
//! through the progress cache on every batch and the durable job row at a
//! coarser checkpoint interval. Per-unit failures are isolated: they are
//! recorded in the error aggregator, counted, and the loop moves on. Only
//! infrastructure failures of the claim/persist path fail the job itself.
//!
//! Any number of runner instances may drive jobs concurrently: all
//! cross-worker correctness comes from the store's claim semantics and the
//! ledger's per-key serialization, never from in-process locks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{GantryError, Result};
use crate::job::{Job, JobId, JobStats, JobStatus, RunnerId, StatusReport};
use crate::processor::UnitProcessor;
use crate::quota::{QuotaDecision, QuotaLedger};
use crate::store::{JobStore, NewUnit};
use crate::tracking::{ErrorAggregator, IdempotencyIndex, ProgressCache, ProgressUpdate};
use crate::unit::{Claimed, WorkUnit};

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of units to claim per iteration.
    pub batch_size: usize,

    /// Maximum units processed concurrently within a batch.
    pub unit_concurrency: usize,

    /// Durable job-row checkpoint interval, in units. The progress cache is
    /// updated every batch regardless; this bounds write amplification on
    /// the primary store.
    pub checkpoint_every: i64,

    /// Extra iterations allowed beyond `limit / batch_size + 1` before the
    /// claim loop stops as a safety bound.
    pub iteration_slack: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            unit_concurrency: 8,
            checkpoint_every: 50,
            iteration_slack: 3,
        }
    }
}

/// Outcome of one `run` call.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub job_id: JobId,
    /// Job status after the run: terminal normally, `InProgress` when the
    /// run was cancelled and left for resumption.
    pub status: JobStatus,
    pub completed: i64,
    pub failed: i64,
    /// Units skipped because the idempotency index had already seen them.
    pub skipped: i64,
    pub iterations: u64,
    pub duration: std::time::Duration,
}

enum UnitVerdict {
    Completed,
    Failed,
    Skipped,
}

#[derive(Default)]
struct DriveOutcome {
    completed: i64,
    failed: i64,
    skipped: i64,
    iterations: u64,
    cancelled: bool,
}

/// Drives jobs to completion against a store, a tracker, a quota ledger
/// and a unit processor.
pub struct JobRunner<S, C, Q, P>
where
    S: JobStore + 'static,
    C: ProgressCache + IdempotencyIndex + ErrorAggregator + 'static,
    Q: QuotaLedger + 'static,
    P: UnitProcessor + 'static,
{
    runner_id: RunnerId,
    store: Arc<S>,
    tracker: Arc<C>,
    ledger: Arc<Q>,
    processor: Arc<P>,
    config: RunnerConfig,
    cancel: CancellationToken,
    units_in_flight: Arc<AtomicUsize>,
}

impl<S, C, Q, P> JobRunner<S, C, Q, P>
where
    S: JobStore + 'static,
    C: ProgressCache + IdempotencyIndex + ErrorAggregator + 'static,
    Q: QuotaLedger + 'static,
    P: UnitProcessor + 'static,
{
    pub fn new(
        store: Arc<S>,
        tracker: Arc<C>,
        ledger: Arc<Q>,
        processor: Arc<P>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            runner_id: RunnerId::new(),
            store,
            tracker,
            ledger,
            processor,
            config,
            cancel: CancellationToken::new(),
            units_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn runner_id(&self) -> RunnerId {
        self.runner_id
    }

    /// Token that stops the claim loop at the next iteration boundary. The
    /// in-flight batch finishes; the job is left `InProgress` for a later
    /// resumption.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Units currently being processed by this runner.
    pub fn units_in_flight(&self) -> usize {
        self.units_in_flight.load(Ordering::Relaxed)
    }

    /// Create a `Pending` job with its work units. Drive it with
    /// [`run`](Self::run).
    pub async fn submit(
        &self,
        kind: &str,
        units: Vec<NewUnit>,
        unit_limit: Option<i64>,
    ) -> Result<Job> {
        self.store.create_job(kind, units, unit_limit).await
    }

    /// Run a job to completion (or until cancellation).
    ///
    /// Accepts a `Pending` job (started here) or an `InProgress` one (a
    /// resumption after cancellation or a crashed runner); terminal jobs
    /// are an `InvalidState` error.
    #[tracing::instrument(skip(self), fields(job_id = %job_id, runner_id = %self.runner_id))]
    pub async fn run(&self, job_id: JobId) -> Result<RunReport> {
        let started = Instant::now();

        let job = self.store.get_job(job_id).await?;
        let job = match job.status {
            JobStatus::Pending => self.store.start_job(job_id).await?,
            JobStatus::InProgress => {
                tracing::info!("Resuming in-progress job");
                job
            }
            status => {
                return Err(GantryError::InvalidState {
                    job: job_id,
                    expected: JobStatus::Pending.to_string(),
                    actual: status.to_string(),
                })
            }
        };

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        tracing::info!(
            host = %host,
            kind = %job.kind,
            total_units = job.total_units,
            "Runner starting job"
        );

        // Keep an existing snapshot across resumptions; only initialize
        // tracking when none survives.
        match self.tracker.get_progress(job_id).await {
            Ok(None) => {
                if let Err(e) = self.tracker.start_tracking(job_id, None).await {
                    tracing::warn!(error = %e, "Failed to start progress tracking");
                }
            }
            Ok(Some(_)) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to read progress cache"),
        }

        match self.drive(job_id, &job).await {
            Ok(outcome) if outcome.cancelled => self.suspend(job_id, outcome, started).await,
            Ok(outcome) => self.finalize(job_id, outcome, started).await,
            Err(error) => {
                // Unrecoverable: persist what we know, then surface the
                // error for the caller's logging layer.
                self.fail_job(job_id, &error).await;
                Err(error)
            }
        }
    }

    /// The claim loop. Returns this run's tallies; durable checkpoint
    /// deltas are flushed before returning on every exit path.
    async fn drive(&self, job_id: JobId, job: &Job) -> Result<DriveOutcome> {
        let batch_size = self.config.batch_size.max(1);
        // Successes still needed, net of what earlier runs already banked.
        let limit = (job.unit_limit.unwrap_or(job.total_units) - job.completed_units).max(0);
        let max_iterations = (limit as u64 / batch_size as u64) + 1 + self.config.iteration_slack;

        let mut outcome = DriveOutcome::default();
        let mut cursor: Option<i64> = None;
        let mut unreported_completed = 0i64;
        let mut unreported_failed = 0i64;

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Cancellation requested, stopping claim loop");
                outcome.cancelled = true;
                break;
            }
            if outcome.completed >= limit {
                break;
            }
            if outcome.iterations >= max_iterations {
                // A safety bound, not a failure: partial progress stands.
                tracing::warn!(
                    iterations = outcome.iterations,
                    max_iterations,
                    "Iteration bound reached, finishing with partial results"
                );
                break;
            }
            outcome.iterations += 1;

            let take = batch_size.min((limit - outcome.completed).max(0) as usize);
            let units = self
                .store
                .claim_batch(job_id, self.runner_id, cursor, take)
                .await?;
            if units.is_empty() {
                break;
            }

            // Units come back in index order; the last one is the cursor
            // for the next page.
            cursor = units.last().map(|u| u.data.index);
            let last_ref = units.last().map(|u| u.data.unit_ref.clone());
            let batch_index = (outcome.iterations - 1) as i64;

            tracing::debug!(
                batch_index,
                claimed = units.len(),
                "Claimed batch"
            );

            let (batch_completed, batch_failed, batch_skipped) =
                self.process_batch(batch_index, units).await?;

            outcome.completed += batch_completed;
            outcome.failed += batch_failed;
            outcome.skipped += batch_skipped;
            unreported_completed += batch_completed;
            unreported_failed += batch_failed;

            // Fast path: cache update every batch. Advisory, never fatal.
            let mut update = ProgressUpdate::increments(batch_completed, batch_failed);
            if let Some(item) = last_ref {
                update = update.with_current_item(item);
            }
            if let Err(e) = self.tracker.update_progress(job_id, update).await {
                tracing::warn!(error = %e, "Failed to update progress cache");
            }

            // Slow path: durable counters at the checkpoint interval.
            if unreported_completed + unreported_failed >= self.config.checkpoint_every {
                self.store
                    .checkpoint_job(job_id, unreported_completed, unreported_failed)
                    .await?;
                unreported_completed = 0;
                unreported_failed = 0;
            }
        }

        if unreported_completed + unreported_failed > 0 {
            self.store
                .checkpoint_job(job_id, unreported_completed, unreported_failed)
                .await?;
        }

        Ok(outcome)
    }

    /// Process one claimed batch on a bounded `JoinSet`. One unit's failure
    /// (or panic) never aborts the others.
    async fn process_batch(
        &self,
        batch_index: i64,
        units: Vec<WorkUnit<Claimed>>,
    ) -> Result<(i64, i64, i64)> {
        let semaphore = Arc::new(Semaphore::new(self.config.unit_concurrency.max(1)));
        let mut join_set: JoinSet<UnitVerdict> = JoinSet::new();

        for unit in units {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| GantryError::Other(anyhow::anyhow!("Semaphore closed")))?;

            let store = self.store.clone();
            let tracker = self.tracker.clone();
            let ledger = self.ledger.clone();
            let processor = self.processor.clone();
            let gauge = self.units_in_flight.clone();

            gauge.fetch_add(1, Ordering::Relaxed);
            join_set.spawn(async move {
                let _permit = permit;
                let _guard = scopeguard::guard(gauge, |g| {
                    g.fetch_sub(1, Ordering::Relaxed);
                });
                process_unit(store, tracker, ledger, processor, batch_index, unit).await
            });
        }

        let (mut completed, mut failed, mut skipped) = (0i64, 0i64, 0i64);
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(UnitVerdict::Completed) => completed += 1,
                Ok(UnitVerdict::Failed) => failed += 1,
                Ok(UnitVerdict::Skipped) => skipped += 1,
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Unit task panicked");
                    failed += 1;
                }
            }
        }

        Ok((completed, failed, skipped))
    }

    /// Cancellation exit: claims are released, the job stays `InProgress`.
    async fn suspend(
        &self,
        job_id: JobId,
        outcome: DriveOutcome,
        started: Instant,
    ) -> Result<RunReport> {
        match self.store.release_claimed(job_id, self.runner_id).await {
            Ok(released) if released > 0 => {
                tracing::debug!(released, "Released leftover claims");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to release claims"),
        }

        tracing::info!(
            completed = outcome.completed,
            failed = outcome.failed,
            "Run cancelled, job left in progress for resumption"
        );

        Ok(RunReport {
            job_id,
            status: JobStatus::InProgress,
            completed: outcome.completed,
            failed: outcome.failed,
            skipped: outcome.skipped,
            iterations: outcome.iterations,
            duration: started.elapsed(),
        })
    }

    /// Normal exit: recount from unit states (authoritative), persist the
    /// final counts and stats durably, then tear down the ephemeral keys.
    async fn finalize(
        &self,
        job_id: JobId,
        outcome: DriveOutcome,
        started: Instant,
    ) -> Result<RunReport> {
        let counts = self.store.unit_state_counts(job_id).await?;
        let errors = match self.tracker.error_summary(job_id).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read error summary");
                Default::default()
            }
        };

        // Correct any cache drift with the recount so late pollers see
        // exact numbers.
        if let Err(e) = self
            .tracker
            .update_progress(
                job_id,
                ProgressUpdate::absolute(counts.completed, counts.failed),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to write final progress");
        }

        let duration = started.elapsed();
        let stats = JobStats {
            completed: counts.completed,
            failed: counts.failed,
            skipped: outcome.skipped,
            iterations: outcome.iterations,
            duration_ms: duration.as_millis() as u64,
            errors,
        };

        let job = self
            .store
            .finalize_job(
                job_id,
                JobStatus::Completed,
                counts.completed,
                counts.failed,
                stats.to_metadata(),
            )
            .await?;

        for teardown in [
            self.tracker.clear_processed(job_id).await,
            self.tracker.clear_errors(job_id).await,
            self.tracker.stop_tracking(job_id).await,
        ] {
            if let Err(e) = teardown {
                tracing::warn!(error = %e, "Failed to tear down tracking state");
            }
        }

        tracing::info!(
            completed = counts.completed,
            failed = counts.failed,
            skipped = outcome.skipped,
            iterations = outcome.iterations,
            elapsed = %humantime::format_duration(duration),
            "Job completed"
        );

        Ok(RunReport {
            job_id,
            status: job.status,
            completed: counts.completed,
            failed: counts.failed,
            skipped: outcome.skipped,
            iterations: outcome.iterations,
            duration,
        })
    }

    /// Best-effort terminal bookkeeping for an unrecoverable error.
    async fn fail_job(&self, job_id: JobId, error: &GantryError) {
        let counts = self.store.unit_state_counts(job_id).await.unwrap_or_default();
        let errors = self.tracker.error_summary(job_id).await.unwrap_or_default();
        let metadata = serde_json::json!({
            "error": error.to_string(),
            "completed": counts.completed,
            "failed": counts.failed,
            "errors": errors,
        });

        if let Err(e) = self
            .store
            .finalize_job(
                job_id,
                JobStatus::Failed,
                counts.completed,
                counts.failed,
                metadata,
            )
            .await
        {
            tracing::error!(error = %e, "Failed to mark job as failed");
        }
    }

    /// Assemble the poll-friendly status view: cache fast path, durable
    /// fallback when the cache is cold or gone.
    pub async fn status(&self, job_id: JobId) -> Result<StatusReport> {
        let job = self.store.get_job(job_id).await?;

        let snapshot = match self.tracker.get_progress(job_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Progress cache unavailable, using job row");
                None
            }
        };

        let (completed, failed, rate, current_item) = match snapshot {
            Some(s) => (s.processed, s.errors, Some(s.rate()), s.current_item),
            None => (job.completed_units, job.failed_units, None, None),
        };

        // Live errors come from the aggregator; for finished jobs the
        // summary was folded into result_metadata at finalization.
        let errors = match self.tracker.error_summary(job_id).await {
            Ok(summary) if summary.total > 0 => Some(summary),
            _ => job
                .result_metadata
                .clone()
                .and_then(|meta| serde_json::from_value::<JobStats>(meta).ok())
                .map(|stats| stats.errors)
                .filter(|summary| summary.total > 0),
        };

        let progress = if job.total_units > 0 {
            (((completed + failed) as f64) / job.total_units as f64).clamp(0.0, 1.0)
        } else if job.status.is_terminal() {
            1.0
        } else {
            0.0
        };

        Ok(StatusReport {
            job_id,
            status: job.status,
            completed,
            failed,
            total: job.total_units,
            progress,
            rate,
            current_item,
            errors,
        })
    }
}

/// Process one claimed unit end to end. Infallible by construction: every
/// failure mode becomes a `Failed` (or `Skipped`) verdict so one unit can
/// never abort its batch.
async fn process_unit<S, C, Q, P>(
    store: Arc<S>,
    tracker: Arc<C>,
    ledger: Arc<Q>,
    processor: Arc<P>,
    batch_index: i64,
    unit: WorkUnit<Claimed>,
) -> UnitVerdict
where
    S: JobStore,
    C: ProgressCache + IdempotencyIndex + ErrorAggregator,
    Q: QuotaLedger,
    P: UnitProcessor,
{
    let job_id = unit.data.job_id;
    let index = unit.data.index;
    let unit_ref = unit.data.unit_ref.clone();

    // Resume fast path: a unit already marked processed by an earlier run
    // is skipped, and its durable row is reconciled so it can't be claimed
    // again. A cache read failure degrades to at-least-once.
    match tracker.is_processed(job_id, index).await {
        Ok(true) => {
            tracing::debug!(unit_ref = %unit_ref, index, "Unit already processed, skipping");
            if let Err(e) = store.persist_unit(&unit.complete().into()).await {
                tracing::warn!(unit_ref = %unit_ref, error = %e, "Failed to reconcile skipped unit");
            }
            return UnitVerdict::Skipped;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(unit_ref = %unit_ref, error = %e, "Idempotency check failed, proceeding");
        }
    }

    // Metered units clear the ledger before any side effect. A denial is
    // an expected outcome, recorded against the unit; it never aborts the
    // batch or the job.
    if let Some(charge) = processor.charge(&unit.data) {
        let decision = ledger
            .check_and_record(
                charge.tenant_id,
                &charge.resource_kind,
                charge.units,
                &charge.label,
            )
            .await;

        match decision {
            Ok(QuotaDecision::Granted { .. }) => {}
            Ok(denied) => {
                tracing::debug!(unit_ref = %unit_ref, decision = %denied, "Quota denied");
                return fail_unit(
                    &*store,
                    &*tracker,
                    batch_index,
                    unit,
                    denied.reason(),
                    &denied.to_string(),
                )
                .await;
            }
            Err(e) => {
                // The ledger transaction rolled back in full; retrying is
                // the caller's policy, not ours (no hidden double-charges).
                tracing::warn!(unit_ref = %unit_ref, error = %e, "Quota check failed");
                return fail_unit(
                    &*store,
                    &*tracker,
                    batch_index,
                    unit,
                    "infrastructure",
                    &e.to_string(),
                )
                .await;
            }
        }
    }

    match processor.process(&unit.data).await {
        Ok(()) => {
            if let Err(e) = store.persist_unit(&unit.clone().complete().into()).await {
                tracing::warn!(unit_ref = %unit_ref, error = %e, "Failed to persist completed unit");
            }
            // Mark after the side effect: a crash in between re-processes
            // the unit on resume (at-least-once), never the other way.
            if let Err(e) = tracker.mark_processed(job_id, index).await {
                tracing::warn!(unit_ref = %unit_ref, error = %e, "Failed to mark unit processed");
            }
            UnitVerdict::Completed
        }
        Err(unit_error) => {
            fail_unit(
                &*store,
                &*tracker,
                batch_index,
                unit,
                &unit_error.kind,
                &unit_error.message,
            )
            .await
        }
    }
}

async fn fail_unit<S, C>(
    store: &S,
    tracker: &C,
    batch_index: i64,
    unit: WorkUnit<Claimed>,
    kind: &str,
    message: &str,
) -> UnitVerdict
where
    S: JobStore,
    C: ErrorAggregator,
{
    let job_id = unit.data.job_id;
    let unit_ref = unit.data.unit_ref.clone();

    if let Err(e) = tracker
        .record_error(job_id, kind, &unit_ref, batch_index, message)
        .await
    {
        tracing::warn!(unit_ref = %unit_ref, error = %e, "Failed to record unit error");
    }
    if let Err(e) = store
        .persist_unit(&unit.fail(format!("{kind}: {message}")).into())
        .await
    {
        tracing::warn!(unit_ref = %unit_ref, error = %e, "Failed to persist failed unit");
    }

    UnitVerdict::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{MockProcessor, QuotaCharge, UnitError};
    use crate::quota::{InMemoryQuotaLedger, QuotaLimits, ResourceQuota, TenantId};
    use crate::store::in_memory::InMemoryJobStore;
    use crate::tracking::in_memory::InMemoryTracker;
    use uuid::Uuid;

    type TestRunner = JobRunner<InMemoryJobStore, InMemoryTracker, InMemoryQuotaLedger, MockProcessor>;

    fn test_runner(config: RunnerConfig) -> (TestRunner, Arc<MockProcessor>, Arc<InMemoryQuotaLedger>) {
        let processor = Arc::new(MockProcessor::new());
        let ledger = Arc::new(InMemoryQuotaLedger::new());
        let runner = JobRunner::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryTracker::new()),
            ledger.clone(),
            processor.clone(),
            config,
        );
        (runner, processor, ledger)
    }

    fn sample_units(n: usize) -> Vec<NewUnit> {
        (0..n)
            .map(|i| NewUnit::new(format!("candidate-{i}"), serde_json::json!({ "i": i })))
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn runs_250_units_in_three_batches() {
        let (runner, processor, _) = test_runner(RunnerConfig {
            batch_size: 100,
            ..Default::default()
        });

        let job = runner
            .submit("bulk_approval", sample_units(250), Some(250))
            .await
            .unwrap();
        let report = runner.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.completed, 250);
        assert_eq!(report.failed, 0);
        assert_eq!(report.iterations, 3);
        assert_eq!(processor.call_count(), 250);

        let job = runner.store.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_units, 250);
    }

    #[tokio::test]
    async fn unit_failure_does_not_fail_the_job() {
        let (runner, processor, _) = test_runner(RunnerConfig::default());
        processor.fail_unit("candidate-1", UnitError::new("scoring_error", "model returned garbage"));

        let job = runner.submit("scoring", sample_units(3), None).await.unwrap();
        let report = runner.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);

        // The error summary rides along in the result metadata.
        let job = runner.store.get_job(job.id).await.unwrap();
        let stats: JobStats =
            serde_json::from_value(job.result_metadata.unwrap()).unwrap();
        assert_eq!(stats.errors.total, 1);
        assert_eq!(stats.errors.counts_by_kind["scoring_error"], 1);
        assert_eq!(stats.errors.samples[0].unit_ref, "candidate-1");
    }

    #[test_log::test(tokio::test)]
    async fn quota_denials_fail_exactly_the_overflow() {
        let (runner, processor, ledger) = test_runner(RunnerConfig::default());

        let tenant = TenantId(Uuid::new_v4());
        ledger.upsert_quota(ResourceQuota::new(
            tenant,
            "llm_requests",
            QuotaLimits {
                daily_units: Some(10),
                ..Default::default()
            },
        ));
        processor.set_charge(QuotaCharge {
            tenant_id: tenant,
            resource_kind: "llm_requests".to_string(),
            units: 1,
            label: "scorer-v2".to_string(),
        });

        let job = runner.submit("scoring", sample_units(20), None).await.unwrap();
        let report = runner.run(job.id).await.unwrap();

        // Exactly the limit succeeds; the rest fail as quota denials.
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.completed, 10);
        assert_eq!(report.failed, 10);

        let quota = ledger.quota(tenant, "llm_requests").await.unwrap().unwrap();
        assert_eq!(quota.daily_used_units, 10);
        assert_eq!(quota.revision, 10);

        let job = runner.store.get_job(job.id).await.unwrap();
        let stats: JobStats = serde_json::from_value(job.result_metadata.unwrap()).unwrap();
        assert_eq!(stats.errors.counts_by_kind["daily_limit_exceeded"], 10);
    }

    #[tokio::test]
    async fn resume_skips_already_processed_indices() {
        let (runner, processor, _) = test_runner(RunnerConfig::default());
        let job = runner.submit("scan", sample_units(5), None).await.unwrap();

        // Simulate an earlier run that processed indices 0..3 before dying.
        for index in 0..3 {
            assert!(!runner.tracker.mark_processed(job.id, index).await.unwrap());
        }

        let report = runner.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.skipped, 3);
        assert_eq!(processor.calls(), vec!["candidate-3", "candidate-4"]);
        // Skipped units are reconciled as completed in the final counts.
        assert_eq!(report.completed, 5);
    }

    #[tokio::test]
    async fn unit_limit_caps_successful_processing() {
        let (runner, processor, _) = test_runner(RunnerConfig {
            batch_size: 3,
            ..Default::default()
        });

        let job = runner.submit("scan", sample_units(10), Some(4)).await.unwrap();
        let report = runner.run(job.id).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.completed, 4);
        assert_eq!(processor.call_count(), 4);

        let counts = runner.store.unit_state_counts(job.id).await.unwrap();
        assert_eq!(counts.pending, 6);
    }

    #[tokio::test]
    async fn terminal_jobs_cannot_be_rerun() {
        let (runner, _, _) = test_runner(RunnerConfig::default());
        let job = runner.submit("scan", sample_units(1), None).await.unwrap();

        runner.run(job.id).await.unwrap();
        let err = runner.run(job.id).await.unwrap_err();
        assert!(matches!(err, GantryError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (runner, _, _) = test_runner(RunnerConfig::default());
        let err = runner.run(JobId::new()).await.unwrap_err();
        assert!(matches!(err, GantryError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn cancellation_suspends_and_a_later_run_finishes() {
        let (runner, _, _) = test_runner(RunnerConfig::default());
        let job = runner.submit("scan", sample_units(5), None).await.unwrap();

        // Cancel before the first iteration: nothing is claimed, the job
        // stays in progress.
        runner.cancellation_token().cancel();
        let report = runner.run(job.id).await.unwrap();
        assert_eq!(report.status, JobStatus::InProgress);
        assert_eq!(report.completed, 0);

        // A fresh runner over the same stores resumes and completes it.
        let resumer = JobRunner::new(
            runner.store.clone(),
            runner.tracker.clone(),
            runner.ledger.clone(),
            runner.processor.clone(),
            RunnerConfig::default(),
        );
        let report = resumer.run(job.id).await.unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.completed, 5);
    }

    #[tokio::test]
    async fn status_reads_cache_then_falls_back_to_the_row() {
        let (runner, _, _) = test_runner(RunnerConfig::default());
        let job = runner.submit("scan", sample_units(4), None).await.unwrap();

        // Before any run: durable fallback only.
        let status = runner.status(job.id).await.unwrap();
        assert_eq!(status.status, JobStatus::Pending);
        assert_eq!(status.completed, 0);
        assert!(status.rate.is_none());

        runner.run(job.id).await.unwrap();

        // After completion the cache is torn down; the durable row carries
        // the exact final counts and the error summary lives in metadata.
        let status = runner.status(job.id).await.unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.completed, 4);
        assert_eq!(status.total, 4);
        assert!((status.progress - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failed_units_are_reflected_in_status_errors() {
        let (runner, processor, _) = test_runner(RunnerConfig::default());
        processor.fail_unit("candidate-0", UnitError::new("timeout", "no response"));
        processor.fail_unit("candidate-1", UnitError::new("timeout", "no response"));

        let job = runner.submit("scan", sample_units(2), None).await.unwrap();
        let report = runner.run(job.id).await.unwrap();
        assert_eq!(report.failed, 2);

        let status = runner.status(job.id).await.unwrap();
        let errors = status.errors.expect("error summary should survive finalization");
        assert_eq!(errors.total, 2);
        assert!(errors.is_total_failure(2));
    }
}
