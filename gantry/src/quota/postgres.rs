//! PostgreSQL quota ledger.
//!
//! Check-and-record takes an exclusive row lock (`SELECT ... FOR UPDATE`)
//! on the quota row, so all competing transactions for one
//! `(tenant_id, resource_kind)` key serialize regardless of which process
//! or connection they come from. Period rollover, limit evaluation, the
//! counter update, the revision bump and the usage-record append all happen
//! inside that one transaction; any failure before commit rolls the whole
//! thing back.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::Result;
use crate::quota::{
    ensure_units_non_negative, QuotaDecision, QuotaLedger, QuotaLimits, ResourceQuota, TenantId,
    UsageRecord,
};

/// PostgreSQL-backed quota ledger.
#[derive(Clone)]
pub struct PostgresQuotaLedger {
    pool: PgPool,
}

// Database row shape; converted to the public ResourceQuota.
#[derive(Debug, FromRow)]
struct QuotaRow {
    tenant_id: Uuid,
    resource_kind: String,
    enabled: bool,
    daily_limit_requests: Option<i64>,
    monthly_limit_requests: Option<i64>,
    daily_limit_units: Option<i64>,
    monthly_limit_units: Option<i64>,
    daily_used_requests: i64,
    monthly_used_requests: i64,
    daily_used_units: i64,
    monthly_used_units: i64,
    daily_period_start: DateTime<Utc>,
    monthly_period_start: DateTime<Utc>,
    revision: i64,
}

impl From<QuotaRow> for ResourceQuota {
    fn from(row: QuotaRow) -> Self {
        ResourceQuota {
            tenant_id: TenantId(row.tenant_id),
            resource_kind: row.resource_kind,
            enabled: row.enabled,
            limits: QuotaLimits {
                daily_requests: row.daily_limit_requests,
                monthly_requests: row.monthly_limit_requests,
                daily_units: row.daily_limit_units,
                monthly_units: row.monthly_limit_units,
            },
            daily_used_requests: row.daily_used_requests,
            monthly_used_requests: row.monthly_used_requests,
            daily_used_units: row.daily_used_units,
            monthly_used_units: row.monthly_used_units,
            daily_period_start: row.daily_period_start,
            monthly_period_start: row.monthly_period_start,
            revision: row.revision,
        }
    }
}

const SELECT_QUOTA: &str = r#"
    SELECT tenant_id, resource_kind, enabled,
           daily_limit_requests, monthly_limit_requests,
           daily_limit_units, monthly_limit_units,
           daily_used_requests, monthly_used_requests,
           daily_used_units, monthly_used_units,
           daily_period_start, monthly_period_start, revision
    FROM resource_quotas
    WHERE tenant_id = $1 AND resource_kind = $2
"#;

impl PostgresQuotaLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Provision a quota row for a tenant, or update its limits/enabled
    /// flag in place. Counters and revision are preserved on update.
    pub async fn upsert_quota(&self, quota: &ResourceQuota) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_quotas (
                tenant_id, resource_kind, enabled,
                daily_limit_requests, monthly_limit_requests,
                daily_limit_units, monthly_limit_units,
                daily_period_start, monthly_period_start
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, resource_kind) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                daily_limit_requests = EXCLUDED.daily_limit_requests,
                monthly_limit_requests = EXCLUDED.monthly_limit_requests,
                daily_limit_units = EXCLUDED.daily_limit_units,
                monthly_limit_units = EXCLUDED.monthly_limit_units,
                updated_at = now()
            "#,
        )
        .bind(*quota.tenant_id)
        .bind(&quota.resource_kind)
        .bind(quota.enabled)
        .bind(quota.limits.daily_requests)
        .bind(quota.limits.monthly_requests)
        .bind(quota.limits.daily_units)
        .bind(quota.limits.monthly_units)
        .bind(quota.daily_period_start)
        .bind(quota.monthly_period_start)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read the usage audit trail for a key since a point in time.
    pub async fn usage_since(
        &self,
        tenant_id: TenantId,
        resource_kind: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        #[derive(FromRow)]
        struct UsageRow {
            tenant_id: Uuid,
            resource_kind: String,
            units_used: i64,
            label: String,
            success: bool,
            error_message: Option<String>,
            occurred_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT tenant_id, resource_kind, units_used, label, success,
                   error_message, occurred_at
            FROM usage_records
            WHERE tenant_id = $1 AND resource_kind = $2 AND occurred_at >= $3
            ORDER BY occurred_at ASC, id ASC
            "#,
        )
        .bind(*tenant_id)
        .bind(resource_kind)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| UsageRecord {
                tenant_id: TenantId(r.tenant_id),
                resource_kind: r.resource_kind,
                units_used: r.units_used,
                label: r.label,
                success: r.success,
                error_message: r.error_message,
                occurred_at: r.occurred_at,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl QuotaLedger for PostgresQuotaLedger {
    #[tracing::instrument(skip(self), fields(tenant = %tenant_id, kind = resource_kind))]
    async fn check_and_record(
        &self,
        tenant_id: TenantId,
        resource_kind: &str,
        units: i64,
        label: &str,
    ) -> Result<QuotaDecision> {
        ensure_units_non_negative(units)?;

        let mut tx = self.pool.begin().await?;

        // Exclusive row lock: competing transactions for this key queue here.
        let row = sqlx::query_as::<_, QuotaRow>(&format!("{SELECT_QUOTA} FOR UPDATE"))
            .bind(*tenant_id)
            .bind(resource_kind)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            // No quota row: the resource was never enabled for this tenant.
            return Ok(QuotaDecision::Disabled);
        };

        let mut quota = ResourceQuota::from(row);
        quota.roll_periods(Utc::now());

        let decision = quota.check(units);
        if !decision.is_granted() {
            // Dropping the transaction rolls back, discarding any rollover;
            // it will be re-applied under the lock on the next call.
            tracing::debug!(decision = %decision, "usage denied");
            return Ok(decision);
        }

        quota.apply(units);

        sqlx::query(
            r#"
            UPDATE resource_quotas SET
                daily_used_requests = $3,
                monthly_used_requests = $4,
                daily_used_units = $5,
                monthly_used_units = $6,
                daily_period_start = $7,
                monthly_period_start = $8,
                revision = $9,
                updated_at = now()
            WHERE tenant_id = $1 AND resource_kind = $2
            "#,
        )
        .bind(*tenant_id)
        .bind(resource_kind)
        .bind(quota.daily_used_requests)
        .bind(quota.monthly_used_requests)
        .bind(quota.daily_used_units)
        .bind(quota.monthly_used_units)
        .bind(quota.daily_period_start)
        .bind(quota.monthly_period_start)
        .bind(quota.revision)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO usage_records (tenant_id, resource_kind, units_used, label, success)
            VALUES ($1, $2, $3, $4, TRUE)
            "#,
        )
        .bind(*tenant_id)
        .bind(resource_kind)
        .bind(units)
        .bind(label)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(decision)
    }

    async fn record_failure(
        &self,
        tenant_id: TenantId,
        resource_kind: &str,
        units: i64,
        label: &str,
        error: &str,
    ) -> Result<()> {
        ensure_units_non_negative(units)?;

        sqlx::query(
            r#"
            INSERT INTO usage_records (tenant_id, resource_kind, units_used, label, success, error_message)
            VALUES ($1, $2, $3, $4, FALSE, $5)
            "#,
        )
        .bind(*tenant_id)
        .bind(resource_kind)
        .bind(units)
        .bind(label)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn quota(
        &self,
        tenant_id: TenantId,
        resource_kind: &str,
    ) -> Result<Option<ResourceQuota>> {
        let row = sqlx::query_as::<_, QuotaRow>(SELECT_QUOTA)
            .bind(*tenant_id)
            .bind(resource_kind)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ResourceQuota::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Integration tests; run with: cargo test --features postgres -- --ignored
    async fn create_test_pool() -> PgPool {
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
        let pool = PgPool::connect(&database_url)
            .await
            .expect("Failed to connect to test database");
        crate::store::postgres::PostgresJobStore::migrate(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    #[tokio::test]
    #[ignore]
    async fn concurrent_callers_never_exceed_the_limit() {
        let pool = create_test_pool().await;
        let ledger = Arc::new(PostgresQuotaLedger::new(pool));
        let tenant = TenantId(Uuid::new_v4());

        ledger
            .upsert_quota(&ResourceQuota::new(
                tenant,
                "llm_requests",
                QuotaLimits {
                    daily_units: Some(10),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .check_and_record(tenant, "llm_requests", 1, "m")
                    .await
                    .unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_granted() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);

        let quota = ledger.quota(tenant, "llm_requests").await.unwrap().unwrap();
        assert_eq!(quota.daily_used_units, 10);
        assert_eq!(quota.revision, 10);

        let records = ledger
            .usage_since(tenant, "llm_requests", quota.daily_period_start)
            .await
            .unwrap();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.success));
    }

    #[tokio::test]
    #[ignore]
    async fn denial_leaves_counters_untouched() {
        let pool = create_test_pool().await;
        let ledger = PostgresQuotaLedger::new(pool);
        let tenant = TenantId(Uuid::new_v4());

        ledger
            .upsert_quota(&ResourceQuota::new(
                tenant,
                "llm_requests",
                QuotaLimits {
                    daily_requests: Some(1),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(ledger
            .check_and_record(tenant, "llm_requests", 0, "m")
            .await
            .unwrap()
            .is_granted());
        assert!(!ledger
            .check_and_record(tenant, "llm_requests", 0, "m")
            .await
            .unwrap()
            .is_granted());

        let quota = ledger.quota(tenant, "llm_requests").await.unwrap().unwrap();
        assert_eq!(quota.daily_used_requests, 1);
        assert_eq!(quota.revision, 1);
    }
}
