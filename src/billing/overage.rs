//! Per-period overage state.
//!
//! A subscription tracks how much overage it has already billed this period
//! (`overage_billed`). Each reconciliation compares that against the current
//! overage and bills only the difference, so repeated syncs inside one period
//! neither skip nor double-count.

/// Where a subscription stands relative to its allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverageState {
    /// Usage is at or below the allowance.
    WithinAllowance,
    /// Usage exceeds what has been billed so far.
    Unbilled {
        /// Calls to bill in this pass.
        quantity: u64,
        /// Total overage for the period including this pass.
        cumulative: u64,
    },
    /// Every overage call is already covered by a usage record.
    Billed,
}

impl OverageState {
    pub fn evaluate(usage_current: u64, usage_allowance: u64, overage_billed: u64) -> Self {
        if usage_current <= usage_allowance {
            return Self::WithinAllowance;
        }
        let cumulative = usage_current - usage_allowance;
        if cumulative <= overage_billed {
            Self::Billed
        } else {
            Self::Unbilled {
                quantity: cumulative - overage_billed,
                cumulative,
            }
        }
    }
}

/// Charge for `quantity` calls at `rate`, never negative or NaN.
pub fn overage_amount(quantity: u64, rate: f64) -> f64 {
    let amount = quantity as f64 * rate;
    if amount.is_finite() && amount > 0.0 {
        amount
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
