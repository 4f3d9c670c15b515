//! In-memory quota ledger.
//!
//! The per-key `Mutex` plays the role of the database row lock: all
//! competing callers for one `(tenant, resource_kind)` key serialize on it,
//! callers for different keys do not contend. Suitable for tests and
//! single-process embeddings; counters are lost on restart.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::quota::{
    ensure_units_non_negative, QuotaDecision, QuotaLedger, ResourceQuota, TenantId, UsageRecord,
};

#[derive(Default)]
pub struct InMemoryQuotaLedger {
    quotas: DashMap<(TenantId, String), Mutex<ResourceQuota>>,
    records: Mutex<Vec<UsageRecord>>,
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision (or replace) a quota row.
    pub fn upsert_quota(&self, quota: ResourceQuota) {
        self.quotas.insert(
            (quota.tenant_id, quota.resource_kind.clone()),
            Mutex::new(quota),
        );
    }

    /// Snapshot of the append-only usage audit trail.
    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }
}

#[async_trait::async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn check_and_record(
        &self,
        tenant_id: TenantId,
        resource_kind: &str,
        units: i64,
        label: &str,
    ) -> Result<QuotaDecision> {
        ensure_units_non_negative(units)?;

        let key = (tenant_id, resource_kind.to_string());
        let Some(entry) = self.quotas.get(&key) else {
            return Ok(QuotaDecision::Disabled);
        };

        // Serializes all competing callers for this key, like the row lock.
        let mut quota = entry.lock();
        quota.roll_periods(Utc::now());

        let decision = quota.check(units);
        if decision.is_granted() {
            quota.apply(units);
            self.records.lock().push(UsageRecord {
                tenant_id,
                resource_kind: resource_kind.to_string(),
                units_used: units,
                label: label.to_string(),
                success: true,
                error_message: None,
                occurred_at: Utc::now(),
            });
        }

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
        self.records.lock().push(UsageRecord {
            tenant_id,
            resource_kind: resource_kind.to_string(),
            units_used: units,
            label: label.to_string(),
            success: false,
            error_message: Some(error.to_string()),
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    async fn quota(
        &self,
        tenant_id: TenantId,
        resource_kind: &str,
    ) -> Result<Option<ResourceQuota>> {
        let key = (tenant_id, resource_kind.to_string());
        Ok(self.quotas.get(&key).map(|entry| entry.lock().clone()))
    }
}
