//! Data models for Claude Code usage monitoring

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw usage record from a single JSONL line
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub message: Option<RawMessage>,
    pub timestamp: Option<String>,
    #[serde(alias = "costUSD", alias = "cost_usd")]
    pub cost: Option<f64>,
    pub usage: Option<RawUsage>,
    pub message_id: Option<String>,
    #[serde(alias = "requestId")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub id: Option<String>,
    pub model: Option<String>,
    pub usage: Option<RawUsage>,
}

/// Token counts as they appear on disk. Values are signed so that a
/// corrupt negative count deserializes instead of failing the record;
/// the reader clamps them to zero.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawUsage {
    #[serde(default, alias = "inputTokens", alias = "prompt_tokens")]
    pub input_tokens: Option<i64>,
    #[serde(default, alias = "outputTokens", alias = "completion_tokens")]
    pub output_tokens: Option<i64>,
    #[serde(
        default,
        alias = "cache_creation_input_tokens",
        alias = "cacheCreationInputTokens"
    )]
    pub cache_creation_tokens: Option<i64>,
    #[serde(
        default,
        alias = "cache_read_input_tokens",
        alias = "cacheReadInputTokens"
    )]
    pub cache_read_tokens: Option<i64>,
}

impl RawUsage {
    /// True if the record carries any input/output tokens worth counting.
    pub fn has_tokens(&self) -> bool {
        self.input_tokens.unwrap_or(0) > 0 || self.output_tokens.unwrap_or(0) > 0
    }
}

/// Normalized usage entry for one logged request.
///
/// Immutable once produced by the reader; negative token and cost values
/// have already been clamped to zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageEntry {
    pub timestamp: DateTime<Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
    pub model: String,
    pub message_id: String,
    pub request_id: String,
}

impl UsageEntry {
    /// Sum of all four token categories.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_tokens
            + self.cache_read_tokens
    }
}

/// Running token totals across a group of entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenCounts {
    pub fn add_entry(&mut self, entry: &UsageEntry) {
        self.input_tokens += entry.input_tokens;
        self.output_tokens += entry.output_tokens;
        self.cache_creation_tokens += entry.cache_creation_tokens;
        self.cache_read_tokens += entry.cache_read_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

/// One session block: a contiguous, time-bounded group of entries.
///
/// Blocks are rebuilt from scratch on every refresh; they are never
/// mutated after the builder returns them.
#[derive(Debug, Clone, Serialize)]
pub struct SessionBlock {
    /// RFC 3339 rendering of the start time, used as the block identity.
    pub id: String,
    pub start_time: DateTime<Utc>,
    /// Nominal end (start + session window). `None` while the block is
    /// still active.
    pub end_time: Option<DateTime<Utc>>,
    /// Timestamp of the last entry in the block. `None` for gap blocks.
    pub actual_end_time: Option<DateTime<Utc>>,
    pub entries: Vec<UsageEntry>,
    pub token_counts: TokenCounts,
    pub cost_usd: f64,
    /// Distinct model names in first-seen order.
    pub models: Vec<String>,
    pub is_active: bool,
    pub is_gap: bool,
}

impl SessionBlock {
    /// Sum of the four token categories across all entries in the block.
    pub fn total_tokens(&self) -> u64 {
        self.token_counts.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(input: u64, output: u64) -> UsageEntry {
        UsageEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            input_tokens: input,
            output_tokens: output,
            cache_creation_tokens: 7,
            cache_read_tokens: 3,
            cost_usd: 0.01,
            model: "claude-3-5-sonnet".to_string(),
            message_id: "msg_1".to_string(),
            request_id: "req_1".to_string(),
        }
    }

    #[test]
    fn test_entry_total_tokens_sums_all_categories() {
        assert_eq!(entry(100, 50).total_tokens(), 160);
    }

    #[test]
    fn test_token_counts_accumulate() {
        let mut counts = TokenCounts::default();
        counts.add_entry(&entry(100, 50));
        counts.add_entry(&entry(10, 5));

        assert_eq!(counts.input_tokens, 110);
        assert_eq!(counts.output_tokens, 55);
        assert_eq!(counts.cache_creation_tokens, 14);
        assert_eq!(counts.cache_read_tokens, 6);
        assert_eq!(counts.total(), 185);
    }

    #[test]
    fn test_raw_usage_aliases() {
        let raw: RawUsage = serde_json::from_str(
            r#"{"inputTokens": 5, "outputTokens": 2, "cacheReadInputTokens": 9}"#,
        )
        .unwrap();
        assert_eq!(raw.input_tokens, Some(5));
        assert_eq!(raw.output_tokens, Some(2));
        assert_eq!(raw.cache_read_tokens, Some(9));
        assert!(raw.has_tokens());
    }
}
