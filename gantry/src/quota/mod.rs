//! Per-(tenant, resource) usage quotas with strict check-and-record.
//!
//! The ledger is the sole authority on metered usage. Every path that
//! consumes a metered resource calls [`QuotaLedger::check_and_record`]
//! before doing the work; the backend serializes competing callers for the
//! same `(tenant, resource_kind)` key so the combined counters can never be
//! pushed past their limits, no matter how many processes are involved.
//!
//! Expected rejections (limit exceeded, resource disabled) are returned as
//! [`QuotaDecision`] variants, not errors, so callers branch on the outcome
//! kind. Only infrastructure failures use the error channel, and those roll
//! the whole transaction back so no partial counter update is ever visible.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GantryError, Result};

pub mod in_memory;

pub use in_memory::InMemoryQuotaLedger;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Unique identifier for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl From<Uuid> for TenantId {
    fn from(uuid: Uuid) -> Self {
        TenantId(uuid)
    }
}

impl std::ops::Deref for TenantId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Which accounting period a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Daily,
    Monthly,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Daily => "daily",
            LimitScope::Monthly => "monthly",
        }
    }
}

/// Which counter a limit applies to: call count or consumed units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitDimension {
    Requests,
    Units,
}

impl LimitDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitDimension::Requests => "requests",
            LimitDimension::Units => "units",
        }
    }
}

/// Outcome of a [`QuotaLedger::check_and_record`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum QuotaDecision {
    /// Usage accepted and recorded. `revision` is the quota row's revision
    /// after the grant, for external cache invalidation.
    Granted { revision: i64 },

    /// Accepting the usage would cross a limit. Nothing was recorded.
    LimitExceeded {
        scope: LimitScope,
        dimension: LimitDimension,
        limit: i64,
        used: i64,
        requested: i64,
    },

    /// The resource is not enabled for this tenant (or no quota row exists).
    Disabled,
}

impl QuotaDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, QuotaDecision::Granted { .. })
    }

    /// Short machine-readable reason, used as an error kind in aggregation.
    pub fn reason(&self) -> &'static str {
        match self {
            QuotaDecision::Granted { .. } => "granted",
            QuotaDecision::LimitExceeded {
                scope: LimitScope::Daily,
                ..
            } => "daily_limit_exceeded",
            QuotaDecision::LimitExceeded {
                scope: LimitScope::Monthly,
                ..
            } => "monthly_limit_exceeded",
            QuotaDecision::Disabled => "resource_disabled",
        }
    }
}

impl std::fmt::Display for QuotaDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaDecision::Granted { revision } => write!(f, "granted (revision {revision})"),
            QuotaDecision::LimitExceeded {
                scope,
                dimension,
                limit,
                used,
                requested,
            } => write!(
                f,
                "{} {} limit exceeded: {} used + {} requested > {}",
                scope.as_str(),
                dimension.as_str(),
                used,
                requested,
                limit
            ),
            QuotaDecision::Disabled => f.write_str("resource disabled"),
        }
    }
}

/// Limit configuration for one `(tenant, resource_kind)` quota.
///
/// `None` means the dimension is unmetered; its usage counter still
/// accumulates for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub daily_requests: Option<i64>,
    pub monthly_requests: Option<i64>,
    pub daily_units: Option<i64>,
    pub monthly_units: Option<i64>,
}

/// One quota row: limits, period counters and the change-tracking revision.
///
/// `revision` is an externally observable change counter (for cache
/// invalidation by other subsystems); the concurrency guarantee comes from
/// the backend's per-key lock, never from revision comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub tenant_id: TenantId,
    pub resource_kind: String,
    pub enabled: bool,
    pub limits: QuotaLimits,
    pub daily_used_requests: i64,
    pub monthly_used_requests: i64,
    pub daily_used_units: i64,
    pub monthly_used_units: i64,
    pub daily_period_start: DateTime<Utc>,
    pub monthly_period_start: DateTime<Utc>,
    pub revision: i64,
}

impl ResourceQuota {
    /// A fresh, enabled quota with zeroed counters and periods anchored at
    /// the current day/month boundaries.
    pub fn new(tenant_id: TenantId, resource_kind: impl Into<String>, limits: QuotaLimits) -> Self {
        let now = Utc::now();
        ResourceQuota {
            tenant_id,
            resource_kind: resource_kind.into(),
            enabled: true,
            limits,
            daily_used_requests: 0,
            monthly_used_requests: 0,
            daily_used_units: 0,
            monthly_used_units: 0,
            daily_period_start: start_of_day(now),
            monthly_period_start: start_of_month(now),
            revision: 0,
        }
    }

    /// Roll expired accounting periods forward, zeroing the corresponding
    /// counters. Returns whether anything changed. Backends call this while
    /// holding the row lock, before evaluating limits.
    pub fn roll_periods(&mut self, now: DateTime<Utc>) -> bool {
        let mut rolled = false;

        if now >= self.daily_period_start + Duration::days(1) {
            self.daily_used_requests = 0;
            self.daily_used_units = 0;
            self.daily_period_start = start_of_day(now);
            rolled = true;
        }

        if start_of_month(now) > self.monthly_period_start {
            self.monthly_used_requests = 0;
            self.monthly_used_units = 0;
            self.monthly_period_start = start_of_month(now);
            rolled = true;
        }

        rolled
    }

    /// Evaluate a prospective usage of `units` against the current counters.
    /// Pure: does not mutate. Checks run in a fixed order (daily before
    /// monthly, requests before units) so the reported reason is stable.
    pub fn check(&self, units: i64) -> QuotaDecision {
        if !self.enabled {
            return QuotaDecision::Disabled;
        }

        let checks = [
            (
                LimitScope::Daily,
                LimitDimension::Requests,
                self.limits.daily_requests,
                self.daily_used_requests,
                1,
            ),
            (
                LimitScope::Monthly,
                LimitDimension::Requests,
                self.limits.monthly_requests,
                self.monthly_used_requests,
                1,
            ),
            (
                LimitScope::Daily,
                LimitDimension::Units,
                self.limits.daily_units,
                self.daily_used_units,
                units,
            ),
            (
                LimitScope::Monthly,
                LimitDimension::Units,
                self.limits.monthly_units,
                self.monthly_used_units,
                units,
            ),
        ];

        for (scope, dimension, limit, used, requested) in checks {
            if let Some(limit) = limit {
                if used + requested > limit {
                    return QuotaDecision::LimitExceeded {
                        scope,
                        dimension,
                        limit,
                        used,
                        requested,
                    };
                }
            }
        }

        QuotaDecision::Granted {
            revision: self.revision + 1,
        }
    }

    /// Apply a granted usage: bump counters and the revision. Only call
    /// after [`check`](Self::check) returned `Granted`.
    pub fn apply(&mut self, units: i64) {
        self.daily_used_requests += 1;
        self.monthly_used_requests += 1;
        self.daily_used_units += units;
        self.monthly_used_units += units;
        self.revision += 1;
    }
}

/// One accepted (or explicitly logged failed) usage event. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: TenantId,
    pub resource_kind: String,
    pub units_used: i64,
    /// Free-form label for the usage, e.g. a model name.
    pub label: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// The quota ledger contract.
#[async_trait::async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Atomically check a prospective usage against the tenant's limits
    /// and, if accepted, record it.
    ///
    /// For N concurrent callers against one key with a combined limit of L,
    /// exactly L are granted: the backend serializes competing writers for
    /// that key. Callers for different keys proceed fully in parallel.
    ///
    /// # Errors
    /// Infrastructure failures only; the transaction is rolled back in full
    /// and the call may be retried by the caller's own policy.
    async fn check_and_record(
        &self,
        tenant_id: TenantId,
        resource_kind: &str,
        units: i64,
        label: &str,
    ) -> Result<QuotaDecision>;

    /// Append a failed-usage audit record without touching any counters.
    async fn record_failure(
        &self,
        tenant_id: TenantId,
        resource_kind: &str,
        units: i64,
        label: &str,
        error: &str,
    ) -> Result<()>;

    /// Read back the current quota row, if the resource is provisioned.
    async fn quota(&self, tenant_id: TenantId, resource_kind: &str)
        -> Result<Option<ResourceQuota>>;
}

pub(crate) fn ensure_units_non_negative(units: i64) -> Result<()> {
    if units < 0 {
        return Err(GantryError::InvalidRequest(format!(
            "units must be non-negative, got {units}"
        )));
    }
    Ok(())
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn quota_with(limits: QuotaLimits) -> ResourceQuota {
        ResourceQuota::new(TenantId(Uuid::new_v4()), "llm_requests", limits)
    }

    #[test]
    fn grant_increments_revision_by_one() {
        let mut quota = quota_with(QuotaLimits {
            daily_requests: Some(10),
            ..Default::default()
        });

        let decision = quota.check(3);
        assert_eq!(decision, QuotaDecision::Granted { revision: 1 });
        quota.apply(3);
        assert_eq!(quota.revision, 1);
        assert_eq!(quota.daily_used_requests, 1);
        assert_eq!(quota.daily_used_units, 3);
    }

    #[test]
    fn denied_check_does_not_mutate() {
        let mut quota = quota_with(QuotaLimits {
            daily_units: Some(5),
            ..Default::default()
        });
        quota.apply(4);
        let before = quota.clone();

        let decision = quota.check(2);
        assert_eq!(
            decision,
            QuotaDecision::LimitExceeded {
                scope: LimitScope::Daily,
                dimension: LimitDimension::Units,
                limit: 5,
                used: 4,
                requested: 2,
            }
        );
        assert_eq!(quota, before);
    }

    #[test]
    fn disabled_resource_is_rejected_before_limits() {
        let mut quota = quota_with(QuotaLimits::default());
        quota.enabled = false;
        assert_eq!(quota.check(1), QuotaDecision::Disabled);
    }

    #[test]
    fn unmetered_dimensions_never_deny() {
        let quota = quota_with(QuotaLimits::default());
        assert!(quota.check(i64::MAX / 2).is_granted());
    }

    #[rstest]
    #[case::request_at_boundary(Some(1), None, 1, 0, true)]
    #[case::request_over_boundary(Some(1), None, 1, 1, false)]
    #[case::units_exactly_fill(None, Some(100), 100, 0, true)]
    #[case::units_one_past(None, Some(100), 101, 0, false)]
    fn limit_boundaries(
        #[case] daily_requests: Option<i64>,
        #[case] daily_units: Option<i64>,
        #[case] units: i64,
        #[case] prior_requests: i64,
        #[case] granted: bool,
    ) {
        let mut quota = quota_with(QuotaLimits {
            daily_requests,
            daily_units,
            ..Default::default()
        });
        quota.daily_used_requests = prior_requests;
        assert_eq!(quota.check(units).is_granted(), granted);
    }

    #[test]
    fn daily_rollover_resets_daily_counters_only() {
        let mut quota = quota_with(QuotaLimits {
            daily_units: Some(10),
            monthly_units: Some(100),
            ..Default::default()
        });
        quota.apply(10);
        assert!(!quota.check(1).is_granted());

        let tomorrow = quota.daily_period_start + Duration::days(1) + Duration::hours(1);
        assert!(quota.roll_periods(tomorrow));
        assert_eq!(quota.daily_used_units, 0);
        assert_eq!(quota.daily_used_requests, 0);
        // Monthly counters survive a daily rollover within the same month.
        if start_of_month(tomorrow) == quota.monthly_period_start {
            assert_eq!(quota.monthly_used_units, 10);
        }
        assert!(quota.check(1).is_granted());
    }

    #[test]
    fn monthly_rollover_resets_monthly_counters() {
        let mut quota = quota_with(QuotaLimits {
            monthly_requests: Some(1),
            ..Default::default()
        });
        quota.apply(1);
        assert!(!quota.check(1).is_granted());

        let next_month = quota.monthly_period_start + Duration::days(40);
        assert!(quota.roll_periods(next_month));
        assert_eq!(quota.monthly_used_requests, 0);
        assert!(quota.check(1).is_granted());
    }

    #[test]
    fn rollover_is_idempotent_within_a_period() {
        let mut quota = quota_with(QuotaLimits::default());
        let now = quota.daily_period_start + Duration::hours(5);
        assert!(!quota.roll_periods(now));
    }
}
