//! Monitor configuration and data directory discovery

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;

use crate::limits::Plan;

/// Default refresh cadence for the monitoring loop.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;

/// Look-back window applied by quick-start reads when none is configured.
pub const QUICK_START_HOURS_BACK: u32 = 24;

/// Configuration values consumed by the monitoring core.
///
/// Plain data only; how these values are obtained (CLI flags, config
/// files) is the caller's concern.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Directory containing the usage JSONL files.
    pub data_dir: PathBuf,
    /// How often the background loop republishes a fresh snapshot.
    pub refresh_interval: Duration,
    pub plan: Plan,
    /// Explicit token limit; bypasses the estimator entirely.
    pub token_limit_override: Option<u64>,
    /// Timezone used for daily/monthly period keys.
    pub timezone: Tz,
    /// Bounded look-back for historical reads, in hours.
    pub hours_back: Option<u32>,
    /// Reuse unchanged file contents for one-shot report reads.
    /// Live monitoring ticks always read fresh.
    pub use_cache: bool,
    /// Apply a short look-back cutoff to reduce first-read latency.
    pub quick_start: bool,
}

impl MonitorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            plan: Plan::Custom,
            token_limit_override: None,
            timezone: chrono_tz::UTC,
            hours_back: None,
            use_cache: false,
            quick_start: false,
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_token_limit_override(mut self, limit: Option<u64>) -> Self {
        self.token_limit_override = limit;
        self
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = tz;
        self
    }

    pub fn with_hours_back(mut self, hours: Option<u32>) -> Self {
        self.hours_back = hours;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_quick_start(mut self, quick_start: bool) -> Self {
        self.quick_start = quick_start;
        self
    }
}

/// Locate the Claude usage data directory.
///
/// Priority: explicit custom path, `CLAUDE_CONFIG_DIR`, then the
/// standard locations `~/.claude/projects` and `~/.config/claude/projects`.
/// Returns `None` when nothing exists.
pub fn discover_data_dir(custom_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = custom_path {
        return Some(path.to_path_buf());
    }

    if let Ok(env_path) = env::var("CLAUDE_CONFIG_DIR") {
        return Some(PathBuf::from(env_path).join("projects"));
    }

    let home = dirs::home_dir()?;
    for candidate in [
        home.join(".claude").join("projects"),
        home.join(".config").join("claude").join("projects"),
    ] {
        if candidate.is_dir() {
            return Some(candidate);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::new("/tmp/usage");
        assert_eq!(config.refresh_interval, Duration::from_secs(10));
        assert_eq!(config.plan, Plan::Custom);
        assert_eq!(config.timezone, chrono_tz::UTC);
        assert!(!config.use_cache);
        assert!(config.token_limit_override.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let config = MonitorConfig::new("/tmp/usage")
            .with_plan(Plan::Max5)
            .with_refresh_interval(Duration::from_secs(1))
            .with_timezone(chrono_tz::America::New_York)
            .with_hours_back(Some(48))
            .with_cache(true);

        assert_eq!(config.plan, Plan::Max5);
        assert_eq!(config.refresh_interval, Duration::from_secs(1));
        assert_eq!(config.timezone, chrono_tz::America::New_York);
        assert_eq!(config.hours_back, Some(48));
        assert!(config.use_cache);
    }

    #[test]
    fn test_discover_prefers_custom_path() {
        let dir = discover_data_dir(Some(Path::new("/somewhere/else")));
        assert_eq!(dir, Some(PathBuf::from("/somewhere/else")));
    }
}
