//! One-shot daily and monthly usage reports

use chrono::Utc;
use serde::Serialize;

use crate::aggregator::{self, Period, PeriodUsage, Totals};
use crate::cache::EntryCache;
use crate::config::MonitorConfig;
use crate::reader::{self, ReaderError};

/// Aggregate rows plus grand totals for one report request.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub rows: Vec<PeriodUsage>,
    pub totals: Totals,
}

/// Builds historical reports, optionally reusing parsed files across
/// calls when the config enables caching.
#[derive(Debug, Default)]
pub struct ReportGenerator {
    cache: EntryCache,
}

impl ReportGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the data directory and aggregate it into `period` rows.
    ///
    /// Unlike the monitoring loop, source errors are surfaced to the
    /// caller so a missing data directory can be reported directly.
    pub fn generate(
        &mut self,
        config: &MonitorConfig,
        period: Period,
    ) -> Result<UsageReport, ReaderError> {
        let cutoff = reader::read_cutoff(config, Utc::now());
        let entries = if config.use_cache {
            self.cache.read_entries(&config.data_dir, cutoff)?
        } else {
            reader::read_entries(&config.data_dir, cutoff)?
        };

        let rows = match period {
            Period::Daily => aggregator::aggregate_daily(&entries, config.timezone),
            Period::Monthly => aggregator::aggregate_monthly(&entries, config.timezone),
        };
        let totals = aggregator::calculate_totals(&rows);

        Ok(UsageReport { rows, totals })
    }
}
