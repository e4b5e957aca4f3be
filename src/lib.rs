//! Claude Code usage monitoring core
//!
//! Reads the JSONL usage logs written by Claude Code, groups them into
//! five-hour session blocks, estimates session token limits, and
//! aggregates usage into daily and monthly reports. The
//! [`MonitoringOrchestrator`] runs the whole pipeline on a background
//! refresh loop and publishes snapshots to registered callbacks.

pub mod aggregator;
pub mod blocks;
pub mod cache;
pub mod config;
pub mod limits;
pub mod models;
pub mod monitor;
pub mod pricing;
pub mod reader;
pub mod report;

pub use aggregator::{Period, PeriodUsage, Totals};
pub use blocks::{hourly_burn_rate, minutes_to_reset, BurnRate, SessionBlockBuilder};
pub use cache::EntryCache;
pub use config::{discover_data_dir, MonitorConfig};
pub use limits::Plan;
pub use models::{SessionBlock, TokenCounts, UsageEntry};
pub use monitor::{MonitorSnapshot, MonitoringOrchestrator, SessionTransition};
pub use reader::ReaderError;
pub use report::{ReportGenerator, UsageReport};
