//! Fast-path key layout.
//!
//! ```text
//! usage:{tenant}                      aggregate counters (hash)
//! usage:{tenant}:models:{model}       per-model counters (hash)
//! usage:{tenant}:daily:{YYYY-MM-DD}   per-day counters (hash, expires)
//! usage:{tenant}:events               recent usage events (ring, newest first)
//! usage:{tenant}:synced               calls already folded into the subscription
//! ```
//!
//! Tenant ids and model names are escaped (`%` to `%25`, `:` to `%3A`), so
//! no id can reach into another tenant's keys.

use std::borrow::Cow;

use chrono::NaiveDate;

pub const TOTAL_INPUT_TOKENS: &str = "total_input_tokens";
pub const TOTAL_OUTPUT_TOKENS: &str = "total_output_tokens";
pub const TOTAL_CALLS: &str = "total_calls";
pub const TOTAL_COST_USD: &str = "total_cost_usd";

fn escape(component: &str) -> Cow<'_, str> {
    if component.contains([':', '%']) {
        Cow::Owned(component.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(component)
    }
}

pub fn tenant(tenant_id: &str) -> String {
    format!("usage:{}", escape(tenant_id))
}

pub fn model(tenant_id: &str, model: &str) -> String {
    format!("usage:{}:models:{}", escape(tenant_id), escape(model))
}

pub fn daily(tenant_id: &str, date: NaiveDate) -> String {
    format!("usage:{}:daily:{}", escape(tenant_id), date.format("%Y-%m-%d"))
}

pub fn events(tenant_id: &str) -> String {
    format!("usage:{}:events", escape(tenant_id))
}

pub fn synced(tenant_id: &str) -> String {
    format!("usage:{}:synced", escape(tenant_id))
}

/// Whether a counter field holds a currency amount.
pub fn is_cost_field(field: &str) -> bool {
    field.contains("cost")
}
