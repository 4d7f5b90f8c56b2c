//! Subscribes metrics logging and usage billing to `POST_GENERATION`.
//!
//! Once installed, any producer that fires `PostGeneration` with the usage
//! fields below in [`HookContext::metadata`] is logged and billed without
//! knowing either subscriber exists.
//!
//! | key              | type   | required            |
//! |------------------|--------|---------------------|
//! | `provider`       | string | yes                 |
//! | `model`          | string | yes                 |
//! | `tenant_id`      | string | for billing         |
//! | `input_tokens`   | int    | no (0)              |
//! | `output_tokens`  | int    | no (0)              |
//! | `task_type`      | string | no (`"generation"`) |
//! | `accuracy_score` | float  | no                  |
//! | `is_failover`    | bool   | no (false)          |

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::billing::UsageBillingService;
use crate::error::HookError;
use crate::hooks::{HookCallback, HookContext, HookEvent, HookManager};
use crate::metrics::{MetricsEntry, MetricsLogger};

pub const METRICS_HOOK: &str = "metrics_logger";
pub const BILLING_HOOK: &str = "usage_billing";

const DEFAULT_TASK_TYPE: &str = "generation";

/// Usage fields of a `PostGeneration` event.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationUsage {
    pub tenant_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub task_type: String,
    pub accuracy_score: Option<f64>,
    pub is_failover: bool,
}

impl GenerationUsage {
    pub fn from_context(context: &HookContext) -> Result<Self, HookError> {
        let meta = &context.metadata;
        Ok(Self {
            tenant_id: string(meta, "tenant_id"),
            provider: string(meta, "provider").ok_or(HookError::MissingField("provider"))?,
            model: string(meta, "model").ok_or(HookError::MissingField("model"))?,
            input_tokens: tokens(meta, "input_tokens"),
            output_tokens: tokens(meta, "output_tokens"),
            task_type: string(meta, "task_type").unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string()),
            accuracy_score: meta.get("accuracy_score").and_then(Value::as_f64),
            is_failover: meta
                .get("is_failover")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    pub fn metrics_entry(&self) -> MetricsEntry {
        MetricsEntry {
            provider: self.provider.clone(),
            model: self.model.clone(),
            input_tokens: Some(self.input_tokens),
            output_tokens: Some(self.output_tokens),
            task_type: self.task_type.clone(),
            accuracy_score: self.accuracy_score,
            tenant_id: self.tenant_id.clone(),
            is_failover: self.is_failover,
        }
    }
}

fn string(meta: &Map<String, Value>, key: &str) -> Option<String> {
    meta.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Token counts may arrive as integers, floats or numeric strings.
/// Anything else, including negatives, counts as zero.
fn tokens(meta: &Map<String, Value>, key: &str) -> u64 {
    match meta.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|v| v.is_finite() && *v > 0.0).map(|v| v as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Register the metrics (blocking file append) and billing (async)
/// subscribers on `PostGeneration`.
pub fn install_billing_hooks(
    hooks: &HookManager,
    metrics: Arc<MetricsLogger>,
    billing: UsageBillingService,
) {
    hooks.register(
        HookEvent::PostGeneration,
        HookCallback::blocking(METRICS_HOOK, move |ctx| {
            let usage = GenerationUsage::from_context(ctx)?;
            metrics.try_log_metrics(&usage.metrics_entry())?;
            Ok(())
        }),
    );

    hooks.register(
        HookEvent::PostGeneration,
        HookCallback::asynchronous(BILLING_HOOK, move |ctx: Arc<HookContext>| {
            let billing = billing.clone();
            async move {
                let usage = GenerationUsage::from_context(&ctx)?;
                let tenant_id = usage
                    .tenant_id
                    .as_deref()
                    .ok_or(HookError::MissingField("tenant_id"))?;

                let mut metadata = ctx.metadata.clone();
                metadata.insert("agent_name".into(), Value::from(ctx.agent_name.clone()));

                billing
                    .try_log_usage(
                        tenant_id,
                        &usage.model,
                        &usage.provider,
                        usage.input_tokens,
                        usage.output_tokens,
                        metadata,
                    )
                    .await?;
                Ok::<(), HookError>(())
            }
        }),
    );

    tracing::info!(
        event = %HookEvent::PostGeneration,
        hooks = hooks.count(HookEvent::PostGeneration),
        "Billing and metrics hooks installed"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
