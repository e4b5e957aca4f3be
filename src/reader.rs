//! JSONL usage record reading and normalization

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use glob::glob;
use log::{debug, warn};

use crate::config::{MonitorConfig, QUICK_START_HOURS_BACK};
use crate::models::{RawEvent, RawUsage, UsageEntry};
use crate::pricing;

/// Error type for reader operations
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("glob pattern error: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("data directory not found: {0}")]
    DirNotFound(String),
    #[error("no usage files under {0}")]
    NoUsageFiles(String),
}

impl ReaderError {
    /// True for errors meaning the data source itself is absent, as
    /// opposed to a transient read failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReaderError::DirNotFound(_) | ReaderError::NoUsageFiles(_))
    }
}

/// Find all usage JSONL files under the data directory, recursively.
///
/// Paths come back sorted so repeated reads visit files in a stable
/// order (dedup keeps the last occurrence of a record).
pub fn discover_usage_files(data_dir: &Path) -> Result<Vec<PathBuf>, ReaderError> {
    if !data_dir.is_dir() {
        return Err(ReaderError::DirNotFound(
            data_dir.to_string_lossy().to_string(),
        ));
    }

    let pattern = data_dir.join("**").join("*.jsonl");
    let mut files: Vec<PathBuf> = glob(pattern.to_string_lossy().as_ref())?
        .filter_map(Result::ok)
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(ReaderError::NoUsageFiles(
            data_dir.to_string_lossy().to_string(),
        ));
    }

    Ok(files)
}

/// Cutoff instant implied by the config's look-back settings, if any.
pub fn read_cutoff(config: &MonitorConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let hours = match (config.hours_back, config.quick_start) {
        (Some(h), _) => h,
        (None, true) => QUICK_START_HOURS_BACK,
        (None, false) => return None,
    };
    Some(now - Duration::hours(i64::from(hours)))
}

/// Read, normalize, deduplicate and sort all usage entries.
///
/// Individual malformed records are skipped with a log line; a file
/// that cannot be opened is skipped with a warning. Only a missing
/// directory or a directory without any usage files is an error.
pub fn read_entries(
    data_dir: &Path,
    cutoff: Option<DateTime<Utc>>,
) -> Result<Vec<UsageEntry>, ReaderError> {
    let files = discover_usage_files(data_dir)?;

    let mut entries: Vec<UsageEntry> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for file in &files {
        match parse_jsonl_file(file, cutoff) {
            Ok(parsed) => {
                for entry in parsed {
                    dedup_insert(&mut entries, &mut seen, entry);
                }
            }
            Err(e) => warn!("skipping unreadable usage file {:?}: {}", file, e),
        }
    }

    entries.sort_by_key(|e| e.timestamp);
    Ok(entries)
}

/// Insert an entry, replacing any earlier record with the same
/// `message_id:request_id`. Entries missing either id are never
/// deduplicated.
pub(crate) fn dedup_insert(
    entries: &mut Vec<UsageEntry>,
    seen: &mut HashMap<String, usize>,
    entry: UsageEntry,
) {
    if entry.message_id.is_empty() || entry.request_id.is_empty() {
        entries.push(entry);
        return;
    }

    let key = format!("{}:{}", entry.message_id, entry.request_id);
    match seen.get(&key) {
        Some(&idx) => entries[idx] = entry,
        None => {
            seen.insert(key, entries.len());
            entries.push(entry);
        }
    }
}

/// Parse one JSONL file into normalized entries.
pub fn parse_jsonl_file(
    path: &Path,
    cutoff: Option<DateTime<Utc>>,
) -> Result<Vec<UsageEntry>, std::io::Error> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = match line_result {
            Ok(l) => l,
            Err(e) => {
                debug!("failed to read line {} in {:?}: {}", line_num, path, e);
                continue;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<RawEvent>(line) {
            Ok(event) => event,
            Err(e) => {
                debug!("malformed record at line {} in {:?}: {}", line_num, path, e);
                continue;
            }
        };

        let Some(entry) = normalize_event(&event) else {
            debug!("record without usable usage at line {} in {:?}", line_num, path);
            continue;
        };

        if let Some(cutoff) = cutoff {
            if entry.timestamp < cutoff {
                continue;
            }
        }

        entries.push(entry);
    }

    Ok(entries)
}

/// Turn a raw event into a normalized entry.
///
/// Returns `None` for records with no parseable timestamp or no token
/// usage at all. Negative token and cost values are clamped to zero.
fn normalize_event(event: &RawEvent) -> Option<UsageEntry> {
    let timestamp = parse_timestamp(event.timestamp.as_deref()?)?;
    let usage = extract_usage(event)?;

    let input_tokens = clamp_tokens(usage.input_tokens);
    let output_tokens = clamp_tokens(usage.output_tokens);
    let cache_creation_tokens = clamp_tokens(usage.cache_creation_tokens);
    let cache_read_tokens = clamp_tokens(usage.cache_read_tokens);

    let model = event
        .message
        .as_ref()
        .and_then(|m| m.model.clone())
        .unwrap_or_default();

    let cost_usd = match event.cost {
        Some(cost) => cost.max(0.0),
        None => pricing::calculate_cost(
            &model,
            input_tokens,
            output_tokens,
            cache_creation_tokens,
            cache_read_tokens,
        ),
    };

    let message_id = event
        .message
        .as_ref()
        .and_then(|m| m.id.clone())
        .or_else(|| event.message_id.clone())
        .unwrap_or_default();
    let request_id = event.request_id.clone().unwrap_or_default();

    Some(UsageEntry {
        timestamp,
        input_tokens,
        output_tokens,
        cache_creation_tokens,
        cache_read_tokens,
        cost_usd,
        model,
        message_id,
        request_id,
    })
}

fn clamp_tokens(raw: Option<i64>) -> u64 {
    raw.unwrap_or(0).max(0) as u64
}

/// Pick the token source for an event.
///
/// Assistant events prefer the message-level usage; everything else
/// prefers the event-level usage.
fn extract_usage(event: &RawEvent) -> Option<&RawUsage> {
    let message_usage = event.message.as_ref().and_then(|m| m.usage.as_ref());
    let sources = if event.event_type.as_deref() == Some("assistant") {
        [message_usage, event.usage.as_ref()]
    } else {
        [event.usage.as_ref(), message_usage]
    };

    sources.into_iter().flatten().find(|u| u.has_tokens())
}

/// Parse an ISO-8601 timestamp, tolerating records without an offset.
fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|ndt| ndt.and_utc())
        })
        .or_else(|| {
            NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|ndt| ndt.and_utc())
        })
}
