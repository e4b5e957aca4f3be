//! Session block construction
//!
//! Entries are partitioned into 5-hour session blocks the same way the
//! upstream billing window works: a block opens at the first entry's
//! hour boundary and a new one starts once an entry falls past the
//! block's window or more than a full window after the previous entry.
//! The sequence is rebuilt from scratch on every refresh, so the result
//! depends only on the entry set and the supplied wall-clock time.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use crate::models::{SessionBlock, TokenCounts, UsageEntry};

/// Default session window, in hours.
pub const DEFAULT_SESSION_WINDOW_HOURS: i64 = 5;

/// Builds session blocks from a usage entry sequence.
#[derive(Debug, Clone)]
pub struct SessionBlockBuilder {
    window: Duration,
}

impl Default for SessionBlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBlockBuilder {
    pub fn new() -> Self {
        Self::with_window_hours(DEFAULT_SESSION_WINDOW_HOURS)
    }

    pub fn with_window_hours(hours: i64) -> Self {
        Self {
            window: Duration::hours(hours),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Partition `entries` into blocks, synthesizing gap blocks for
    /// silent intervals longer than the window and marking the final
    /// block active when `now` is still inside its window.
    ///
    /// The input does not need to be sorted. Pure: no I/O, no clock
    /// access, deterministic for a given (entries, now) pair.
    pub fn build(&self, mut entries: Vec<UsageEntry>, now: DateTime<Utc>) -> Vec<SessionBlock> {
        if entries.is_empty() {
            return Vec::new();
        }
        entries.sort_by_key(|e| e.timestamp);

        let mut blocks: Vec<SessionBlock> = Vec::new();
        let mut current: Option<OpenBlock> = None;

        for entry in entries {
            let fits = current
                .as_ref()
                .is_some_and(|open| open.accepts(&entry, self.window));

            if fits {
                if let Some(open) = current.as_mut() {
                    open.push(entry);
                }
                continue;
            }

            if let Some(open) = current.take() {
                let closed = open.close(self.window);
                let next_start = floor_to_hour(entry.timestamp);
                let silent = entry.timestamp - closed_last_activity(&closed);
                let gap_start = closed.start_time + self.window;
                blocks.push(closed);
                if silent > self.window && gap_start < next_start {
                    blocks.push(gap_block(gap_start, next_start));
                }
            }
            current = Some(OpenBlock::start(entry));
        }

        if let Some(open) = current {
            blocks.push(open.finish(now, self.window));
        }

        blocks
    }
}

/// A block still accumulating entries during the build pass.
#[derive(Debug)]
struct OpenBlock {
    start_time: DateTime<Utc>,
    entries: Vec<UsageEntry>,
    token_counts: TokenCounts,
    cost_usd: f64,
    models: Vec<String>,
    last_activity: DateTime<Utc>,
}

impl OpenBlock {
    fn start(entry: UsageEntry) -> Self {
        let mut open = Self {
            start_time: floor_to_hour(entry.timestamp),
            entries: Vec::new(),
            token_counts: TokenCounts::default(),
            cost_usd: 0.0,
            models: Vec::new(),
            last_activity: entry.timestamp,
        };
        open.push(entry);
        open
    }

    /// An entry belongs to this block unless it falls past the nominal
    /// window end or more than a window after the previous entry.
    fn accepts(&self, entry: &UsageEntry, window: Duration) -> bool {
        entry.timestamp < self.start_time + window
            && entry.timestamp - self.last_activity <= window
    }

    fn push(&mut self, entry: UsageEntry) {
        self.token_counts.add_entry(&entry);
        self.cost_usd += entry.cost_usd;
        self.last_activity = entry.timestamp;
        if !entry.model.is_empty() && !self.models.contains(&entry.model) {
            self.models.push(entry.model.clone());
        }
        self.entries.push(entry);
    }

    fn close(self, window: Duration) -> SessionBlock {
        let end = self.start_time + window;
        self.into_block(Some(end), false)
    }

    fn finish(self, now: DateTime<Utc>, window: Duration) -> SessionBlock {
        let window_end = self.start_time + window;
        let is_active = now >= self.start_time && now < window_end;
        let end_time = if is_active { None } else { Some(window_end) };
        self.into_block(end_time, is_active)
    }

    fn into_block(self, end_time: Option<DateTime<Utc>>, is_active: bool) -> SessionBlock {
        SessionBlock {
            id: self.start_time.to_rfc3339(),
            start_time: self.start_time,
            end_time,
            actual_end_time: Some(self.last_activity),
            entries: self.entries,
            token_counts: self.token_counts,
            cost_usd: self.cost_usd,
            models: self.models,
            is_active,
            is_gap: false,
        }
    }
}

/// Consumption rate over the trailing hour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BurnRate {
    pub tokens_per_minute: f64,
    pub cost_per_hour: f64,
}

/// Burn rate over the hour ending at `now`.
///
/// Each block contributes its totals proportionally to how much of its
/// activity span overlaps that hour; an active block's span runs up to
/// `now`. Gap blocks never contribute.
pub fn hourly_burn_rate(blocks: &[SessionBlock], now: DateTime<Utc>) -> BurnRate {
    let hour_ago = now - Duration::hours(1);
    let mut tokens = 0.0;
    let mut cost = 0.0;

    for block in blocks.iter().filter(|b| !b.is_gap) {
        let activity_end = if block.is_active {
            now
        } else {
            match block.actual_end_time {
                Some(end) => end,
                None => continue,
            }
        };
        if activity_end < hour_ago {
            continue;
        }

        let overlap_start = block.start_time.max(hour_ago);
        let overlap_end = activity_end.min(now);
        if overlap_end <= overlap_start {
            continue;
        }

        let span_minutes = (activity_end - block.start_time).num_seconds() as f64 / 60.0;
        let overlap_minutes = (overlap_end - overlap_start).num_seconds() as f64 / 60.0;
        if span_minutes > 0.0 {
            let proportion = overlap_minutes / span_minutes;
            tokens += block.total_tokens() as f64 * proportion;
            cost += block.cost_usd * proportion;
        }
    }

    BurnRate {
        tokens_per_minute: tokens / 60.0,
        cost_per_hour: cost,
    }
}

/// Minutes until the current session window resets.
///
/// Without an active block a full window is available immediately.
pub fn minutes_to_reset(blocks: &[SessionBlock], now: DateTime<Utc>, window: Duration) -> i64 {
    let window_minutes = window.num_minutes();
    match blocks.iter().find(|b| b.is_active) {
        Some(active) => {
            let elapsed = (now - active.start_time).num_minutes();
            if elapsed < 0 {
                return window_minutes;
            }
            window_minutes - elapsed.rem_euclid(window_minutes)
        }
        None => window_minutes,
    }
}

fn gap_block(start: DateTime<Utc>, end: DateTime<Utc>) -> SessionBlock {
    SessionBlock {
        id: format!("gap-{}", start.to_rfc3339()),
        start_time: start,
        end_time: Some(end),
        actual_end_time: None,
        entries: Vec::new(),
        token_counts: TokenCounts::default(),
        cost_usd: 0.0,
        models: Vec::new(),
        is_active: false,
        is_gap: true,
    }
}

fn closed_last_activity(block: &SessionBlock) -> DateTime<Utc> {
    block.actual_end_time.unwrap_or(block.start_time)
}

fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}
