//! In-memory tracker implementing all three tracking contracts.
//!
//! Entries never expire (no TTL sweep); intended for tests and
//! single-process embeddings where the process lifetime bounds the data.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{GantryError, Result};
use crate::job::JobId;
use crate::tracking::{
    ErrorAggregator, ErrorSummary, IdempotencyIndex, ProgressCache, ProgressSnapshot,
    ProgressUpdate, RecordedError, DEFAULT_SAMPLE_CAP,
};

pub struct InMemoryTracker {
    progress: DashMap<JobId, Mutex<ProgressSnapshot>>,
    bitmaps: DashMap<JobId, Mutex<Vec<u64>>>,
    errors: DashMap<JobId, Mutex<ErrorSummary>>,
    sample_cap: usize,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self {
            progress: DashMap::new(),
            bitmaps: DashMap::new(),
            errors: DashMap::new(),
            sample_cap: DEFAULT_SAMPLE_CAP,
        }
    }

    pub fn with_sample_cap(mut self, cap: usize) -> Self {
        self.sample_cap = cap;
        self
    }
}

impl Default for InMemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn bit_position(index: i64) -> Result<(usize, u64)> {
    if index < 0 {
        return Err(GantryError::InvalidRequest(format!(
            "unit index must be non-negative, got {index}"
        )));
    }
    Ok(((index / 64) as usize, 1u64 << (index % 64)))
}

#[async_trait::async_trait]
impl ProgressCache for InMemoryTracker {
    async fn start_tracking(&self, job_id: JobId, current_item: Option<&str>) -> Result<()> {
        let now = Utc::now();
        self.progress.insert(
            job_id,
            Mutex::new(ProgressSnapshot {
                job_id,
                processed: 0,
                errors: 0,
                current_item: current_item.map(String::from),
                started_at: now,
                last_update_at: now,
            }),
        );
        Ok(())
    }

    async fn get_progress(&self, job_id: JobId) -> Result<Option<ProgressSnapshot>> {
        Ok(self.progress.get(&job_id).map(|entry| entry.lock().clone()))
    }

    async fn update_progress(&self, job_id: JobId, update: ProgressUpdate) -> Result<()> {
        let Some(entry) = self.progress.get(&job_id) else {
            // Tracking was never started or already stopped; advisory, so
            // the update is dropped rather than failing the caller.
            return Ok(());
        };

        let mut snapshot = entry.lock();
        if let Some(delta) = update.increment_processed {
            snapshot.processed += delta;
        }
        if let Some(delta) = update.increment_errors {
            snapshot.errors += delta;
        }
        if let Some(value) = update.absolute_processed {
            snapshot.processed = value;
        }
        if let Some(value) = update.absolute_errors {
            snapshot.errors = value;
        }
        if let Some(item) = update.current_item {
            snapshot.current_item = Some(item);
        }
        snapshot.last_update_at = Utc::now();
        Ok(())
    }

    async fn stop_tracking(&self, job_id: JobId) -> Result<()> {
        self.progress.remove(&job_id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl IdempotencyIndex for InMemoryTracker {
    async fn mark_processed(&self, job_id: JobId, index: i64) -> Result<bool> {
        let (word, mask) = bit_position(index)?;
        let entry = self
            .bitmaps
            .entry(job_id)
            .or_insert_with(|| Mutex::new(Vec::new()));

        let mut bits = entry.lock();
        if bits.len() <= word {
            bits.resize(word + 1, 0);
        }
        let was_set = bits[word] & mask != 0;
        bits[word] |= mask;
        Ok(was_set)
    }

    async fn is_processed(&self, job_id: JobId, index: i64) -> Result<bool> {
        let (word, mask) = bit_position(index)?;
        Ok(self
            .bitmaps
            .get(&job_id)
            .map(|entry| {
                let bits = entry.lock();
                bits.get(word).is_some_and(|w| w & mask != 0)
            })
            .unwrap_or(false))
    }

    async fn clear_processed(&self, job_id: JobId) -> Result<()> {
        self.bitmaps.remove(&job_id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ErrorAggregator for InMemoryTracker {
    async fn record_error(
        &self,
        scope: JobId,
        kind: &str,
        unit_ref: &str,
        batch_index: i64,
        message: &str,
    ) -> Result<()> {
        let entry = self
            .errors
            .entry(scope)
            .or_insert_with(|| Mutex::new(ErrorSummary::default()));

        let mut summary = entry.lock();
        summary.total += 1;
        *summary.counts_by_kind.entry(kind.to_string()).or_insert(0) += 1;
        if summary.samples.len() < self.sample_cap {
            summary.samples.push(RecordedError {
                kind: kind.to_string(),
                unit_ref: unit_ref.to_string(),
                batch_index,
                message: message.to_string(),
            });
        }
        Ok(())
    }

    async fn error_summary(&self, scope: JobId) -> Result<ErrorSummary> {
        Ok(self
            .errors
            .get(&scope)
            .map(|entry| entry.lock().clone())
            .unwrap_or_default())
    }

    async fn clear_errors(&self, scope: JobId) -> Result<()> {
        self.errors.remove(&scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn progress_increments_are_commutative() {
        let tracker = InMemoryTracker::new();
        let job = JobId::new();
        tracker.start_tracking(job, None).await.unwrap();

        tracker
            .update_progress(job, ProgressUpdate::increments(3, 0))
            .await
            .unwrap();
        tracker
            .update_progress(job, ProgressUpdate::increments(2, 1))
            .await
            .unwrap();

        let snapshot = tracker.get_progress(job).await.unwrap().unwrap();
        assert_eq!(snapshot.processed, 5);
        assert_eq!(snapshot.errors, 1);
    }

    #[tokio::test]
    async fn absolute_update_overwrites_drift() {
        let tracker = InMemoryTracker::new();
        let job = JobId::new();
        tracker.start_tracking(job, None).await.unwrap();

        tracker
            .update_progress(job, ProgressUpdate::increments(10, 2))
            .await
            .unwrap();
        tracker
            .update_progress(job, ProgressUpdate::absolute(7, 1))
            .await
            .unwrap();

        let snapshot = tracker.get_progress(job).await.unwrap().unwrap();
        assert_eq!(snapshot.processed, 7);
        assert_eq!(snapshot.errors, 1);
    }

    #[tokio::test]
    async fn stopped_tracking_reads_as_absent() {
        let tracker = InMemoryTracker::new();
        let job = JobId::new();
        tracker.start_tracking(job, Some("first")).await.unwrap();
        tracker.stop_tracking(job).await.unwrap();
        assert!(tracker.get_progress(job).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_processed_returns_previous_value() {
        let tracker = InMemoryTracker::new();
        let job = JobId::new();

        assert!(!tracker.mark_processed(job, 7).await.unwrap());
        assert!(tracker.mark_processed(job, 7).await.unwrap());
        assert!(tracker.is_processed(job, 7).await.unwrap());
        assert!(!tracker.is_processed(job, 8).await.unwrap());
    }

    #[tokio::test]
    async fn racing_markers_exactly_one_sees_false() {
        let tracker = Arc::new(InMemoryTracker::new());
        let job = JobId::new();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(
                async move { tracker.mark_processed(job, 0).await },
            ));
        }

        let mut first_markers = 0;
        for handle in handles {
            if !handle.await.unwrap().unwrap() {
                first_markers += 1;
            }
        }
        assert_eq!(first_markers, 1);
    }

    #[tokio::test]
    async fn clear_forgets_the_bitmap() {
        let tracker = InMemoryTracker::new();
        let job = JobId::new();
        tracker.mark_processed(job, 3).await.unwrap();
        tracker.clear_processed(job).await.unwrap();
        assert!(!tracker.is_processed(job, 3).await.unwrap());
    }

    #[tokio::test]
    async fn error_totals_stay_exact_past_the_sample_cap() {
        let tracker = InMemoryTracker::new().with_sample_cap(5);
        let job = JobId::new();

        for i in 0..12 {
            let kind = if i % 2 == 0 { "timeout" } else { "parse" };
            tracker
                .record_error(job, kind, &format!("unit-{i}"), i / 4, "boom")
                .await
                .unwrap();
        }

        let summary = tracker.error_summary(job).await.unwrap();
        assert_eq!(summary.total, 12);
        assert_eq!(summary.counts_by_kind["timeout"], 6);
        assert_eq!(summary.counts_by_kind["parse"], 6);
        assert_eq!(summary.samples.len(), 5);
        // Exact total always equals the histogram sum.
        assert_eq!(summary.total, summary.counts_by_kind.values().sum::<i64>());
        // The first samples are the ones retained.
        assert_eq!(summary.samples[0].unit_ref, "unit-0");
    }

    #[tokio::test]
    async fn summary_of_unknown_scope_is_empty() {
        let tracker = InMemoryTracker::new();
        let summary = tracker.error_summary(JobId::new()).await.unwrap();
        assert_eq!(summary.total, 0);
        assert!(summary.samples.is_empty());
    }
}
