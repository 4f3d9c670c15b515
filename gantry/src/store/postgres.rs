//! PostgreSQL job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside an `UPDATE ... WHERE id IN
//! (SELECT ...)` so concurrent runners partition the pending units without
//! blocking each other and without ever double-claiming a row. The claim
//! statement commits immediately, keeping the lock window to a single
//! statement; claim ownership is carried by the `state`/`runner_id`
//! columns, not by held locks.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{GantryError, Result};
use crate::job::{Job, JobId, JobStatus, RunnerId};
use crate::store::{JobStore, NewUnit, UnitStateCounts};
use crate::unit::{AnyUnit, Claimed, UnitData, WorkUnit};

/// PostgreSQL storage backend for jobs and work units.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    job_kind: String,
    status: String,
    total_units: i64,
    completed_units: i64,
    failed_units: i64,
    unit_limit: Option<i64>,
    result_metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = GantryError;

    fn try_from(row: JobRow) -> Result<Job> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            GantryError::Other(anyhow::anyhow!("Unknown job status: {}", row.status))
        })?;
        Ok(Job {
            id: JobId(row.id),
            kind: row.job_kind,
            status,
            total_units: row.total_units,
            completed_units: row.completed_units,
            failed_units: row.failed_units,
            unit_limit: row.unit_limit,
            result_metadata: row.result_metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_JOB: &str = r#"
    SELECT id, job_kind, status, total_units, completed_units, failed_units,
           unit_limit, result_metadata, created_at, updated_at
    FROM jobs
"#;

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply gantry's embedded migrations.
    pub async fn migrate(pool: &PgPool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| GantryError::Other(anyhow::anyhow!("Migration failed: {e}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(
        &self,
        kind: &str,
        units: Vec<NewUnit>,
        unit_limit: Option<i64>,
    ) -> Result<Job> {
        let job_id = Uuid::new_v4();
        let total = units.len() as i64;

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (id, job_kind, status, total_units, unit_limit)
            VALUES ($1, $2, 'pending', $3, $4)
            RETURNING id, job_kind, status, total_units, completed_units, failed_units,
                      unit_limit, result_metadata, created_at, updated_at
            "#,
        )
        .bind(job_id)
        .bind(kind)
        .bind(total)
        .bind(unit_limit)
        .fetch_one(&mut *tx)
        .await?;

        for (index, unit) in units.into_iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO work_units (id, job_id, unit_index, unit_ref, payload, state)
                VALUES ($1, $2, $3, $4, $5, 'pending')
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job_id)
            .bind(index as i64)
            .bind(&unit.unit_ref)
            .bind(&unit.payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Job::try_from(row)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{SELECT_JOB} WHERE id = $1"))
            .bind(*job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from)
            .transpose()?
            .ok_or(GantryError::JobNotFound(job_id))
    }

    async fn start_job(&self, job_id: JobId) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'in_progress', updated_at = now()
            WHERE id = $1 AND status = 'pending'
            RETURNING id, job_kind, status, total_units, completed_units, failed_units,
                      unit_limit, result_metadata, created_at, updated_at
            "#,
        )
        .bind(*job_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Job::try_from(row),
            None => {
                // Either the job doesn't exist or it isn't pending.
                let job = self.get_job(job_id).await?;
                Err(GantryError::InvalidState {
                    job: job_id,
                    expected: JobStatus::Pending.to_string(),
                    actual: job.status.to_string(),
                })
            }
        }
    }

    async fn claim_batch(
        &self,
        job_id: JobId,
        runner_id: RunnerId,
        after_index: Option<i64>,
        batch_size: usize,
    ) -> Result<Vec<WorkUnit<Claimed>>> {
        #[derive(FromRow)]
        struct ClaimedRow {
            id: Uuid,
            unit_index: i64,
            unit_ref: String,
            payload: serde_json::Value,
        }

        let now = Utc::now();

        // Claim atomically: pending rows past the cursor, in index order,
        // skipping rows locked by a concurrent claimer.
        let rows = sqlx::query_as::<_, ClaimedRow>(
            r#"
            UPDATE work_units
            SET state = 'claimed', runner_id = $1, claimed_at = $2
            WHERE id IN (
                SELECT id
                FROM work_units
                WHERE job_id = $3
                    AND state = 'pending'
                    AND ($4::BIGINT IS NULL OR unit_index > $4)
                ORDER BY unit_index ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, unit_index, unit_ref, payload
            "#,
        )
        .bind(*runner_id)
        .bind(now)
        .bind(*job_id)
        .bind(after_index)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WorkUnit {
                state: Claimed {
                    runner_id,
                    claimed_at: now,
                },
                data: UnitData {
                    id: row.id,
                    job_id,
                    index: row.unit_index,
                    unit_ref: row.unit_ref,
                    payload: row.payload,
                },
            })
            .collect())
    }

    async fn persist_unit(&self, unit: &AnyUnit) -> Result<()> {
        let rows_affected = match unit {
            AnyUnit::Pending(u) => {
                sqlx::query(
                    r#"
                    UPDATE work_units
                    SET state = 'pending', runner_id = NULL, claimed_at = NULL,
                        completed_at = NULL, error = NULL
                    WHERE id = $1 AND state NOT IN ('completed', 'failed')
                    "#,
                )
                .bind(u.data.id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            AnyUnit::Claimed(u) => {
                sqlx::query(
                    r#"
                    UPDATE work_units
                    SET state = 'claimed', runner_id = $2, claimed_at = $3
                    WHERE id = $1 AND state NOT IN ('completed', 'failed')
                    "#,
                )
                .bind(u.data.id)
                .bind(*u.state.runner_id)
                .bind(u.state.claimed_at)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            AnyUnit::Completed(u) => {
                sqlx::query(
                    r#"
                    UPDATE work_units
                    SET state = 'completed', claimed_at = $2, completed_at = $3, error = NULL
                    WHERE id = $1 AND state NOT IN ('completed', 'failed')
                    "#,
                )
                .bind(u.data.id)
                .bind(u.state.claimed_at)
                .bind(u.state.completed_at)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            AnyUnit::Failed(u) => {
                sqlx::query(
                    r#"
                    UPDATE work_units
                    SET state = 'failed', completed_at = $2, error = $3
                    WHERE id = $1 AND state NOT IN ('completed', 'failed')
                    "#,
                )
                .bind(u.data.id)
                .bind(u.state.failed_at)
                .bind(&u.state.error)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };

        if rows_affected == 0 {
            return Err(GantryError::UnitNotFound(unit.id()));
        }
        Ok(())
    }

    async fn release_claimed(&self, job_id: JobId, runner_id: RunnerId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE work_units
            SET state = 'pending', runner_id = NULL, claimed_at = NULL
            WHERE job_id = $1 AND runner_id = $2 AND state = 'claimed'
            "#,
        )
        .bind(*job_id)
        .bind(*runner_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn checkpoint_job(
        &self,
        job_id: JobId,
        completed_delta: i64,
        failed_delta: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET completed_units = completed_units + $2,
                failed_units = failed_units + $3,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(*job_id)
        .bind(completed_delta)
        .bind(failed_delta)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GantryError::JobNotFound(job_id));
        }
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

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = $2, completed_units = $3, failed_units = $4,
                result_metadata = $5, updated_at = now()
            WHERE id = $1 AND status = 'in_progress'
            RETURNING id, job_kind, status, total_units, completed_units, failed_units,
                      unit_limit, result_metadata, created_at, updated_at
            "#,
        )
        .bind(*job_id)
        .bind(status.as_str())
        .bind(completed_units)
        .bind(failed_units)
        .bind(&result_metadata)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Job::try_from(row),
            None => {
                let job = self.get_job(job_id).await?;
                Err(GantryError::InvalidState {
                    job: job_id,
                    expected: JobStatus::InProgress.to_string(),
                    actual: job.status.to_string(),
                })
            }
        }
    }

    async fn unit_state_counts(&self, job_id: JobId) -> Result<UnitStateCounts> {
        #[derive(FromRow)]
        struct CountRow {
            state: String,
            count: i64,
        }

        // Guard against counting units of a job that doesn't exist.
        self.get_job(job_id).await?;

        let rows = sqlx::query_as::<_, CountRow>(
            r#"
            SELECT state, COUNT(*) AS count
            FROM work_units
            WHERE job_id = $1
            GROUP BY state
            "#,
        )
        .bind(*job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = UnitStateCounts::default();
        for row in rows {
            match row.state.as_str() {
                "pending" => counts.pending = row.count,
                "claimed" => counts.claimed = row.count,
                "completed" => counts.completed = row.count,
                "failed" => counts.failed = row.count,
                other => {
                    return Err(GantryError::Other(anyhow::anyhow!(
                        "Unknown unit state: {other}"
                    )))
                }
            }
        }
        Ok(counts)
    }
}
