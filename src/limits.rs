//! Plan identifiers and adaptive token limit estimation

use log::debug;

use crate::models::SessionBlock;

/// Percentile of historical block totals used as the adaptive budget.
pub const LIMIT_PERCENTILE: f64 = 90.0;

/// Completed blocks required before the percentile is trusted.
pub const MIN_BLOCKS_FOR_ESTIMATE: usize = 5;

/// Subscription plan controlling the fallback token limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Pro,
    Max5,
    Max20,
    /// Adaptive plan: limit is estimated from usage history.
    Custom,
}

impl Plan {
    /// Parse a plan identifier, case-insensitively. Unknown names fall
    /// back to `Custom` so the limit degrades to history-based estimation.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "pro" => Plan::Pro,
            "max5" => Plan::Max5,
            "max20" => Plan::Max20,
            _ => Plan::Custom,
        }
    }

    /// Fixed token limit used when history is too thin for a percentile.
    pub fn default_token_limit(self) -> u64 {
        match self {
            Plan::Pro => 19_000,
            Plan::Max5 => 88_000,
            Plan::Max20 => 220_000,
            Plan::Custom => 44_000,
        }
    }
}

/// Estimate the session token budget.
///
/// An explicit override wins unconditionally. Otherwise the 90th
/// percentile of completed (non-active, non-gap) block totals is used,
/// falling back to the plan default when fewer than
/// [`MIN_BLOCKS_FOR_ESTIMATE`] completed blocks exist. Never fails;
/// the result is always at least 1.
pub fn estimate_token_limit(
    plan: Plan,
    blocks: &[SessionBlock],
    override_limit: Option<u64>,
) -> u64 {
    if let Some(limit) = override_limit {
        return limit.max(1);
    }

    let totals: Vec<f64> = blocks
        .iter()
        .filter(|b| !b.is_active && !b.is_gap)
        .map(|b| b.total_tokens() as f64)
        .collect();

    if totals.len() < MIN_BLOCKS_FOR_ESTIMATE {
        debug!(
            "only {} completed blocks, using default limit for {:?}",
            totals.len(),
            plan
        );
        return plan.default_token_limit();
    }

    let estimate = percentile(&totals, LIMIT_PERCENTILE).round() as u64;
    estimate.max(1)
}

/// Linear-interpolated percentile over unsorted values.
///
/// index = p/100 * (n - 1), interpolating between the surrounding
/// order statistics.
fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let last = sorted.len() - 1;
    let rank = p / 100.0 * last as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }

    let weight = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * weight
}
