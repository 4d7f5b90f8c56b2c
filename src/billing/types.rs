use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::keys;
use crate::store::CounterValue;

/// One priced generation call, as kept in a tenant's event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub model: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Snapshot of a counter hash, typed for reporting: cost fields are floats,
/// everything else is an integer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantUsage {
    fields: BTreeMap<String, CounterValue>,
}

impl TenantUsage {
    pub fn from_counters(raw: HashMap<String, CounterValue>) -> Self {
        let fields = raw
            .into_iter()
            .map(|(field, value)| {
                let typed = if keys::is_cost_field(&field) {
                    CounterValue::Float(value.as_f64())
                } else {
                    CounterValue::Int(value.as_u64().min(i64::MAX as u64) as i64)
                };
                (field, typed)
            })
            .collect();
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<CounterValue> {
        self.fields.get(field).copied()
    }

    pub fn total_calls(&self) -> u64 {
        self.int(keys::TOTAL_CALLS)
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.int(keys::TOTAL_INPUT_TOKENS)
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.int(keys::TOTAL_OUTPUT_TOKENS)
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.get(keys::TOTAL_COST_USD)
            .map(CounterValue::as_f64)
            .unwrap_or(0.0)
    }

    /// No recorded usage (or the store could not be read).
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &BTreeMap<String, CounterValue> {
        &self.fields
    }

    fn int(&self, field: &str) -> u64 {
        self.get(field).map(CounterValue::as_u64).unwrap_or(0)
    }
}

/// A tenant's subscription row in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: i64,
    pub location_id: String,
    pub usage_allowance: u64,
    /// Highest call count reconciled from the fast path this period.
    pub usage_current: u64,
    /// Price per call beyond the allowance.
    pub overage_rate: f64,
    /// Overage quantity already turned into usage records this period.
    pub overage_billed: u64,
    pub current_period_start: String,
    pub current_period_end: String,
    pub updated_at: String,
}

/// An overage charge written during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverageRecord {
    pub id: String,
    pub subscription_id: i64,
    pub quantity: u64,
    pub amount: f64,
    /// Total overage for the period once this record is counted.
    pub cumulative_quantity: u64,
    pub billing_period_start: String,
    pub billing_period_end: String,
    pub created_at: String,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub subscription: Subscription,
    /// Call count read from the fast path.
    pub observed_calls: u64,
    /// Calls folded into `usage_current` by this pass.
    pub new_calls: u64,
    /// Record inserted by this pass, if any.
    pub overage: Option<OverageRecord>,
}

/// Result of a successful `try_log_usage`.
#[derive(Debug, Clone)]
pub struct UsageReceipt {
    pub event: UsageEvent,
    /// Tenant call count read back after the increment.
    pub total_calls: u64,
    pub sync_scheduled: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
