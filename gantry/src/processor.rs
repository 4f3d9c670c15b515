//! The work-unit processing seam.
//!
//! The runner knows nothing about what a unit *does*: approving a record,
//! scanning content, calling a model. Implementations declare any metered
//! consumption up front via [`UnitProcessor::charge`] (checked through the
//! quota ledger before side effects run) and perform the side effect in
//! [`UnitProcessor::process`].

use async_trait::async_trait;

use crate::quota::TenantId;
use crate::unit::UnitData;

/// Metered consumption a unit will incur, checked against the quota ledger
/// before the side effect runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCharge {
    pub tenant_id: TenantId,
    pub resource_kind: String,
    pub units: i64,
    /// Free-form label recorded with the usage, e.g. a model name.
    pub label: String,
}

/// A per-unit processing failure. Terminal for the unit, never for the
/// batch: the runner records it and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitError {
    /// Short machine-readable failure class, used as the histogram key in
    /// error aggregation (e.g. `"timeout"`, `"parse_error"`).
    pub kind: String,
    pub message: String,
}

impl UnitError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        UnitError {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for UnitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for UnitError {}

/// Trait for processing individual work units.
#[async_trait]
pub trait UnitProcessor: Send + Sync {
    /// Metered resources this unit will consume, if any. Returning `None`
    /// bypasses the quota ledger for this unit.
    fn charge(&self, unit: &UnitData) -> Option<QuotaCharge>;

    /// Perform the unit's side effect. Must be idempotent (or the caller
    /// must tolerate rare duplicates): a run resumed after losing its
    /// idempotency bitmap may process a unit a second time.
    async fn process(&self, unit: &UnitData) -> std::result::Result<(), UnitError>;
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock processor for testing.
///
/// Units succeed by default; failures are scripted per `unit_ref`, and a
/// fixed charge can be attached to every unit. All processed refs are
/// recorded for assertions.
#[derive(Clone, Default)]
pub struct MockProcessor {
    failures: Arc<Mutex<HashMap<String, UnitError>>>,
    charge: Arc<Mutex<Option<QuotaCharge>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a failure for the unit with the given ref.
    pub fn fail_unit(&self, unit_ref: &str, error: UnitError) {
        self.failures.lock().insert(unit_ref.to_string(), error);
    }

    /// Attach a fixed quota charge to every unit.
    pub fn set_charge(&self, charge: QuotaCharge) {
        *self.charge.lock() = Some(charge);
    }

    /// Refs of all units processed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl UnitProcessor for MockProcessor {
    fn charge(&self, _unit: &UnitData) -> Option<QuotaCharge> {
        self.charge.lock().clone()
    }

    async fn process(&self, unit: &UnitData) -> std::result::Result<(), UnitError> {
        self.calls.lock().push(unit.unit_ref.clone());

        match self.failures.lock().get(&unit.unit_ref) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use uuid::Uuid;

    fn unit(unit_ref: &str) -> UnitData {
        UnitData {
            id: Uuid::new_v4(),
            job_id: JobId::new(),
            index: 0,
            unit_ref: unit_ref.to_string(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn succeeds_by_default_and_records_calls() {
        let mock = MockProcessor::new();
        assert!(mock.process(&unit("a")).await.is_ok());
        assert!(mock.process(&unit("b")).await.is_ok());
        assert_eq!(mock.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn scripted_failures_are_returned() {
        let mock = MockProcessor::new();
        mock.fail_unit("bad", UnitError::new("timeout", "no response"));

        let err = mock.process(&unit("bad")).await.unwrap_err();
        assert_eq!(err.kind, "timeout");
        assert!(mock.process(&unit("good")).await.is_ok());
        assert_eq!(mock.call_count(), 2);
    }
}
