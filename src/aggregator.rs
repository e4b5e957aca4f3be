//! Calendar-period aggregation of usage entries

use std::collections::BTreeMap;

use chrono_tz::Tz;
use serde::Serialize;

use crate::models::{SessionBlock, UsageEntry};

/// Calendar period for report aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Daily,
    Monthly,
}

/// One aggregate row: all usage within a single day or month.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeriodUsage {
    /// `"2024-01-15"` for daily rows, `"2024-01"` for monthly rows.
    pub period: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
    /// Distinct non-empty model names, in first-seen order.
    pub models_used: Vec<String>,
    pub entries_count: u64,
}

impl PeriodUsage {
    fn add_entry(&mut self, entry: &UsageEntry) {
        self.input_tokens += entry.input_tokens;
        self.output_tokens += entry.output_tokens;
        self.cache_creation_tokens += entry.cache_creation_tokens;
        self.cache_read_tokens += entry.cache_read_tokens;
        self.cost_usd += entry.cost_usd;
        self.entries_count += 1;
        if !entry.model.is_empty() && !self.models_used.contains(&entry.model) {
            self.models_used.push(entry.model.clone());
        }
    }
}

/// Grand totals across a set of aggregate rows.
///
/// `entries_count == 0` marks the explicit "no data" case; all numeric
/// fields are zero then.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Totals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub entries_count: u64,
}

impl Totals {
    pub fn is_empty(&self) -> bool {
        self.entries_count == 0
    }
}

/// Aggregate entries by calendar day in the display timezone.
///
/// Rows come back most recent first.
pub fn aggregate_daily(entries: &[UsageEntry], tz: Tz) -> Vec<PeriodUsage> {
    aggregate_by_period(entries, |e| {
        e.timestamp.with_timezone(&tz).format("%Y-%m-%d").to_string()
    })
}

/// Aggregate entries by calendar month in the display timezone.
///
/// Rows come back most recent first.
pub fn aggregate_monthly(entries: &[UsageEntry], tz: Tz) -> Vec<PeriodUsage> {
    aggregate_by_period(entries, |e| {
        e.timestamp.with_timezone(&tz).format("%Y-%m").to_string()
    })
}

/// Aggregate all entries held by non-gap blocks.
pub fn aggregate_blocks(blocks: &[SessionBlock], period: Period, tz: Tz) -> Vec<PeriodUsage> {
    let entries: Vec<UsageEntry> = blocks
        .iter()
        .filter(|b| !b.is_gap)
        .flat_map(|b| b.entries.iter().cloned())
        .collect();

    match period {
        Period::Daily => aggregate_daily(&entries, tz),
        Period::Monthly => aggregate_monthly(&entries, tz),
    }
}

/// Sum aggregate rows into grand totals.
///
/// Every row contributes exactly once; an empty slice yields the zeroed
/// totals record rather than an error.
pub fn calculate_totals(rows: &[PeriodUsage]) -> Totals {
    let mut totals = Totals::default();
    for row in rows {
        totals.input_tokens += row.input_tokens;
        totals.output_tokens += row.output_tokens;
        totals.cache_creation_tokens += row.cache_creation_tokens;
        totals.cache_read_tokens += row.cache_read_tokens;
        totals.cost_usd += row.cost_usd;
        totals.entries_count += row.entries_count;
    }
    totals.total_tokens = totals.input_tokens
        + totals.output_tokens
        + totals.cache_creation_tokens
        + totals.cache_read_tokens;
    totals
}

fn aggregate_by_period(
    entries: &[UsageEntry],
    key_fn: impl Fn(&UsageEntry) -> String,
) -> Vec<PeriodUsage> {
    // BTreeMap keeps keys sorted; reversing gives most-recent-first.
    let mut map: BTreeMap<String, PeriodUsage> = BTreeMap::new();

    for entry in entries {
        let key = key_fn(entry);
        map.entry(key.clone())
            .or_insert_with(|| PeriodUsage {
                period: key,
                ..PeriodUsage::default()
            })
            .add_entry(entry);
    }

    map.into_values().rev().collect()
}
