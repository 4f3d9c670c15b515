//! Redis-backed tracker implementing all three tracking contracts.
//!
//! Progress lives in a hash at `progress:{job_id}` (atomic `HINCRBY` for
//! increments, `HSET` for absolute overwrites), the idempotency bitmap in a
//! bitstring at `processed:{job_id}` (`SETBIT` returns the previous bit, so
//! the mark and the read of its prior value are one atomic operation), and
//! errors under `errors:{job_id}:*` (exact counters plus an `RPUSH`/`LTRIM`
//! capped sample list). Every key carries a TTL so abandoned jobs clean
//! themselves up.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use deadpool_redis::{Config as RedisPoolConfig, Pool, Runtime};

use crate::error::{GantryError, Result};
use crate::job::JobId;
use crate::tracking::{
    ErrorAggregator, ErrorSummary, IdempotencyIndex, ProgressCache, ProgressSnapshot,
    ProgressUpdate, RecordedError, DEFAULT_SAMPLE_CAP,
};

/// Configuration for the Redis tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// TTL applied to every per-job key.
    pub ttl: Duration,
    /// Number of error samples retained per job.
    pub sample_cap: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            sample_cap: DEFAULT_SAMPLE_CAP,
        }
    }
}

/// Redis tracker over a deadpool connection pool.
#[derive(Clone)]
pub struct RedisTracker {
    pool: Pool,
    config: TrackerConfig,
}

impl RedisTracker {
    pub fn new(pool: Pool, config: TrackerConfig) -> Self {
        Self { pool, config }
    }

    /// Create a tracker from a Redis URL, e.g. `redis://localhost:6379`.
    pub fn from_url(url: &str, config: TrackerConfig) -> Result<Self> {
        let pool = RedisPoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| GantryError::Other(anyhow!("Failed to create redis pool: {e}")))?;
        Ok(Self::new(pool, config))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| GantryError::Other(anyhow!("Failed to get redis connection: {e}")))
    }

    fn ttl_secs(&self) -> i64 {
        self.config.ttl.as_secs() as i64
    }
}

fn progress_key(job_id: JobId) -> String {
    format!("progress:{}", job_id.0)
}

fn processed_key(job_id: JobId) -> String {
    format!("processed:{}", job_id.0)
}

fn error_total_key(job_id: JobId) -> String {
    format!("errors:{}:total", job_id.0)
}

fn error_counts_key(job_id: JobId) -> String {
    format!("errors:{}:counts", job_id.0)
}

fn error_samples_key(job_id: JobId) -> String {
    format!("errors:{}:samples", job_id.0)
}

fn parse_millis(fields: &HashMap<String, String>, field: &str) -> Option<DateTime<Utc>> {
    let millis = fields.get(field)?.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

#[async_trait::async_trait]
impl ProgressCache for RedisTracker {
    async fn start_tracking(&self, job_id: JobId, current_item: Option<&str>) -> Result<()> {
        let key = progress_key(job_id);
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(&key).ignore();
        let hset = pipe.cmd("HSET");
        hset.arg(&key)
            .arg("processed")
            .arg(0)
            .arg("errors")
            .arg(0)
            .arg("started_at")
            .arg(now_ms)
            .arg("last_update_at")
            .arg(now_ms);
        if let Some(item) = current_item {
            hset.arg("current_item").arg(item);
        }
        hset.ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(self.ttl_secs()).ignore();

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_progress(&self, job_id: JobId) -> Result<Option<ProgressSnapshot>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(progress_key(job_id))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let read_count = |field: &str| {
            fields
                .get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };
        let started_at = parse_millis(&fields, "started_at").unwrap_or_else(Utc::now);

        Ok(Some(ProgressSnapshot {
            job_id,
            processed: read_count("processed"),
            errors: read_count("errors"),
            current_item: fields.get("current_item").cloned(),
            started_at,
            last_update_at: parse_millis(&fields, "last_update_at").unwrap_or(started_at),
        }))
    }

    async fn update_progress(&self, job_id: JobId, update: ProgressUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let key = progress_key(job_id);
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(delta) = update.increment_processed {
            pipe.cmd("HINCRBY")
                .arg(&key)
                .arg("processed")
                .arg(delta)
                .ignore();
        }
        if let Some(delta) = update.increment_errors {
            pipe.cmd("HINCRBY")
                .arg(&key)
                .arg("errors")
                .arg(delta)
                .ignore();
        }
        if let Some(value) = update.absolute_processed {
            pipe.cmd("HSET")
                .arg(&key)
                .arg("processed")
                .arg(value)
                .ignore();
        }
        if let Some(value) = update.absolute_errors {
            pipe.cmd("HSET").arg(&key).arg("errors").arg(value).ignore();
        }
        if let Some(item) = &update.current_item {
            pipe.cmd("HSET")
                .arg(&key)
                .arg("current_item")
                .arg(item)
                .ignore();
        }
        pipe.cmd("HSET")
            .arg(&key)
            .arg("last_update_at")
            .arg(Utc::now().timestamp_millis())
            .ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(self.ttl_secs()).ignore();

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn stop_tracking(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL")
            .arg(progress_key(job_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl IdempotencyIndex for RedisTracker {
    async fn mark_processed(&self, job_id: JobId, index: i64) -> Result<bool> {
        if index < 0 {
            return Err(GantryError::InvalidRequest(format!(
                "unit index must be non-negative, got {index}"
            )));
        }

        let key = processed_key(job_id);
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SETBIT").arg(&key).arg(index).arg(1);
        pipe.cmd("EXPIRE").arg(&key).arg(self.ttl_secs()).ignore();

        let (previous,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(previous == 1)
    }

    async fn is_processed(&self, job_id: JobId, index: i64) -> Result<bool> {
        if index < 0 {
            return Err(GantryError::InvalidRequest(format!(
                "unit index must be non-negative, got {index}"
            )));
        }

        let mut conn = self.conn().await?;
        let bit: i64 = redis::cmd("GETBIT")
            .arg(processed_key(job_id))
            .arg(index)
            .query_async(&mut conn)
            .await?;
        Ok(bit == 1)
    }

    async fn clear_processed(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL")
            .arg(processed_key(job_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ErrorAggregator for RedisTracker {
    async fn record_error(
        &self,
        scope: JobId,
        kind: &str,
        unit_ref: &str,
        batch_index: i64,
        message: &str,
    ) -> Result<()> {
        let sample = serde_json::to_string(&RecordedError {
            kind: kind.to_string(),
            unit_ref: unit_ref.to_string(),
            batch_index,
            message: message.to_string(),
        })
        .map_err(|e| GantryError::Other(anyhow!("Failed to serialize error sample: {e}")))?;

        let total_key = error_total_key(scope);
        let counts_key = error_counts_key(scope);
        let samples_key = error_samples_key(scope);
        let ttl = self.ttl_secs();
        let mut conn = self.conn().await?;

        // Counters are never capped; only the sample list is trimmed.
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("INCR").arg(&total_key).ignore();
        pipe.cmd("HINCRBY").arg(&counts_key).arg(kind).arg(1).ignore();
        pipe.cmd("RPUSH").arg(&samples_key).arg(sample).ignore();
        pipe.cmd("LTRIM")
            .arg(&samples_key)
            .arg(0)
            .arg(self.config.sample_cap as i64 - 1)
            .ignore();
        for key in [&total_key, &counts_key, &samples_key] {
            pipe.cmd("EXPIRE").arg(key).arg(ttl).ignore();
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn error_summary(&self, scope: JobId) -> Result<ErrorSummary> {
        let mut conn = self.conn().await?;

        let total: Option<i64> = redis::cmd("GET")
            .arg(error_total_key(scope))
            .query_async(&mut conn)
            .await?;
        let counts: HashMap<String, i64> = redis::cmd("HGETALL")
            .arg(error_counts_key(scope))
            .query_async(&mut conn)
            .await?;
        let raw_samples: Vec<String> = redis::cmd("LRANGE")
            .arg(error_samples_key(scope))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let samples = raw_samples
            .iter()
            .filter_map(|raw| match serde_json::from_str(raw) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    tracing::warn!(scope = %scope, error = %e, "Discarding unparseable error sample");
                    None
                }
            })
            .collect();

        Ok(ErrorSummary {
            total: total.unwrap_or(0),
            counts_by_kind: counts.into_iter().collect(),
            samples,
        })
    }

    async fn clear_errors(&self, scope: JobId) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL")
            .arg(error_total_key(scope))
            .arg(error_counts_key(scope))
            .arg(error_samples_key(scope))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests; run with: cargo test --features redis -- --ignored
    fn create_test_tracker() -> RedisTracker {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set for integration tests");
        RedisTracker::from_url(&url, TrackerConfig::default())
            .expect("Failed to create redis tracker")
    }

    #[tokio::test]
    #[ignore]
    async fn progress_round_trip() {
        let tracker = create_test_tracker();
        let job = JobId::new();

        tracker.start_tracking(job, Some("first")).await.unwrap();
        tracker
            .update_progress(job, ProgressUpdate::increments(3, 1).with_current_item("unit-3"))
            .await
            .unwrap();
        tracker
            .update_progress(job, ProgressUpdate::increments(2, 0))
            .await
            .unwrap();

        let snapshot = tracker.get_progress(job).await.unwrap().unwrap();
        assert_eq!(snapshot.processed, 5);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.current_item.as_deref(), Some("unit-3"));

        tracker.stop_tracking(job).await.unwrap();
        assert!(tracker.get_progress(job).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn setbit_observes_previous_value() {
        let tracker = create_test_tracker();
        let job = JobId::new();

        assert!(!tracker.mark_processed(job, 1234).await.unwrap());
        assert!(tracker.mark_processed(job, 1234).await.unwrap());
        assert!(tracker.is_processed(job, 1234).await.unwrap());

        tracker.clear_processed(job).await.unwrap();
        assert!(!tracker.is_processed(job, 1234).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn error_counters_outlive_the_sample_cap() {
        let tracker = create_test_tracker();
        let job = JobId::new();

        for i in 0..8 {
            tracker
                .record_error(job, "timeout", &format!("unit-{i}"), 0, "boom")
                .await
                .unwrap();
        }

        let summary = tracker.error_summary(job).await.unwrap();
        assert_eq!(summary.total, 8);
        assert_eq!(summary.counts_by_kind["timeout"], 8);
        assert_eq!(summary.samples.len(), DEFAULT_SAMPLE_CAP);

        tracker.clear_errors(job).await.unwrap();
        assert_eq!(tracker.error_summary(job).await.unwrap().total, 0);
    }
}
