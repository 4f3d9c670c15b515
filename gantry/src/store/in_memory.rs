//! In-memory job store.
//!
//! Jobs and units live in a `RwLock`ed map; claiming mutates under the
//! write lock, which gives the same at-most-one-claimer guarantee the
//! Postgres backend gets from `FOR UPDATE SKIP LOCKED`. State is lost on
//! restart; suitable for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{GantryError, Result};
use crate::job::{Job, JobId, JobStatus, RunnerId};
use crate::store::{JobStore, NewUnit, UnitStateCounts};
use crate::unit::{AnyUnit, Claimed, Pending, UnitData, WorkUnit};

struct JobEntry {
    job: Job,
    /// Units keyed by `unit_index`; the claim cursor walks this order.
    units: BTreeMap<i64, AnyUnit>,
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        kind: &str,
        units: Vec<NewUnit>,
        unit_limit: Option<i64>,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            kind: kind.to_string(),
            status: JobStatus::Pending,
            total_units: units.len() as i64,
            completed_units: 0,
            failed_units: 0,
            unit_limit,
            result_metadata: None,
            created_at: now,
            updated_at: now,
        };

        let unit_map = units
            .into_iter()
            .enumerate()
            .map(|(index, unit)| {
                let index = index as i64;
                (
                    index,
                    AnyUnit::Pending(WorkUnit {
                        state: Pending {},
                        data: UnitData {
                            id: Uuid::new_v4(),
                            job_id: job.id,
                            index,
                            unit_ref: unit.unit_ref,
                            payload: unit.payload,
                        },
                    }),
                )
            })
            .collect();

        self.jobs.write().insert(
            job.id,
            JobEntry {
                job: job.clone(),
                units: unit_map,
            },
        );

        Ok(job)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.jobs
            .read()
            .get(&job_id)
            .map(|entry| entry.job.clone())
            .ok_or(GantryError::JobNotFound(job_id))
    }

    async fn start_job(&self, job_id: JobId) -> Result<Job> {
        let mut jobs = self.jobs.write();
        let entry = jobs.get_mut(&job_id).ok_or(GantryError::JobNotFound(job_id))?;

        if entry.job.status != JobStatus::Pending {
            return Err(GantryError::InvalidState {
                job: job_id,
                expected: JobStatus::Pending.to_string(),
                actual: entry.job.status.to_string(),
            });
        }

        entry.job.status = JobStatus::InProgress;
        entry.job.updated_at = Utc::now();
        Ok(entry.job.clone())
    }

    async fn claim_batch(
        &self,
        job_id: JobId,
        runner_id: RunnerId,
        after_index: Option<i64>,
        batch_size: usize,
    ) -> Result<Vec<WorkUnit<Claimed>>> {
        let mut jobs = self.jobs.write();
        let Some(entry) = jobs.get_mut(&job_id) else {
            return Err(GantryError::JobNotFound(job_id));
        };

        let now = Utc::now();
        let lower = match after_index {
            Some(index) => Bound::Excluded(index),
            None => Bound::Unbounded,
        };

        let claimable: Vec<i64> = entry
            .units
            .range((lower, Bound::Unbounded))
            .filter(|(_, unit)| unit.is_pending())
            .take(batch_size)
            .map(|(index, _)| *index)
            .collect();

        let mut claimed = Vec::with_capacity(claimable.len());
        for index in claimable {
            if let Some(AnyUnit::Pending(unit)) = entry.units.get(&index) {
                let claimed_unit = WorkUnit {
                    state: Claimed {
                        runner_id,
                        claimed_at: now,
                    },
                    data: unit.data.clone(),
                };
                entry
                    .units
                    .insert(index, AnyUnit::Claimed(claimed_unit.clone()));
                claimed.push(claimed_unit);
            }
        }

        Ok(claimed)
    }

    async fn persist_unit(&self, unit: &AnyUnit) -> Result<()> {
        let data = unit.data();
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(&data.job_id)
            .ok_or(GantryError::JobNotFound(data.job_id))?;

        let Some(existing) = entry.units.get_mut(&data.index) else {
            return Err(GantryError::UnitNotFound(data.id));
        };

        // Terminal unit states are never overwritten.
        if existing.is_terminal() {
            return Err(GantryError::InvalidRequest(format!(
                "unit {} is already {}",
                data.id,
                existing.state_name()
            )));
        }

        *existing = unit.clone();
        Ok(())
    }

    async fn release_claimed(&self, job_id: JobId, runner_id: RunnerId) -> Result<u64> {
        let mut jobs = self.jobs.write();
        let Some(entry) = jobs.get_mut(&job_id) else {
            return Err(GantryError::JobNotFound(job_id));
        };

        let mut released = 0;
        for unit in entry.units.values_mut() {
            if let AnyUnit::Claimed(claimed) = unit {
                if claimed.state.runner_id == runner_id {
                    *unit = AnyUnit::Pending(WorkUnit {
                        state: Pending {},
                        data: claimed.data.clone(),
                    });
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn checkpoint_job(
        &self,
        job_id: JobId,
        completed_delta: i64,
        failed_delta: i64,
    ) -> Result<()> {
        let mut jobs = self.jobs.write();
        let entry = jobs.get_mut(&job_id).ok_or(GantryError::JobNotFound(job_id))?;
        entry.job.completed_units += completed_delta;
        entry.job.failed_units += failed_delta;
        entry.job.updated_at = Utc::now();
        Ok(())
    }

    async fn finalize_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        completed_units: i64,
        failed_units: i64,
        result_metadata: serde_json::Value,
    ) -> Result<Job> {
        if !status.is_terminal() {
            return Err(GantryError::InvalidRequest(format!(
                "finalize requires a terminal status, got {status}"
            )));
        }

        let mut jobs = self.jobs.write();
        let entry = jobs.get_mut(&job_id).ok_or(GantryError::JobNotFound(job_id))?;

        if entry.job.status != JobStatus::InProgress {
            return Err(GantryError::InvalidState {
                job: job_id,
                expected: JobStatus::InProgress.to_string(),
                actual: entry.job.status.to_string(),
            });
        }

        entry.job.status = status;
        entry.job.completed_units = completed_units;
        entry.job.failed_units = failed_units;
        entry.job.result_metadata = Some(result_metadata);
        entry.job.updated_at = Utc::now();
        Ok(entry.job.clone())
    }

    async fn unit_state_counts(&self, job_id: JobId) -> Result<UnitStateCounts> {
        let jobs = self.jobs.read();
        let entry = jobs.get(&job_id).ok_or(GantryError::JobNotFound(job_id))?;

        let mut counts = UnitStateCounts::default();
        for unit in entry.units.values() {
            match unit {
                AnyUnit::Pending(_) => counts.pending += 1,
                AnyUnit::Claimed(_) => counts.claimed += 1,
                AnyUnit::Completed(_) => counts.completed += 1,
                AnyUnit::Failed(_) => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
