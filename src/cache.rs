//! File-level entry cache for one-shot report reads
//!
//! Trades strict freshness for reduced I/O: a file whose mtime and size
//! are unchanged since the last read is served from memory. The live
//! monitoring loop never goes through this cache, so session
//! transitions are always observed on fresh data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use log::debug;

use crate::models::UsageEntry;
use crate::reader::{self, ReaderError};

#[derive(Debug, Clone)]
struct CachedFile {
    mtime: SystemTime,
    size: u64,
    entries: Vec<UsageEntry>,
}

/// Cache of parsed entries keyed by file path.
#[derive(Debug, Default)]
pub struct EntryCache {
    files: HashMap<PathBuf, CachedFile>,
}

impl EntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all cached contents.
    pub fn clear(&mut self) {
        self.files.clear();
    }

    /// Number of files currently held.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Read all entries under `data_dir`, reusing cached files whose
    /// mtime and size are unchanged. Deduplication and sorting match
    /// [`reader::read_entries`]. Files that vanished since the last
    /// call are evicted.
    pub fn read_entries(
        &mut self,
        data_dir: &Path,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<UsageEntry>, ReaderError> {
        let files = reader::discover_usage_files(data_dir)?;

        let mut entries: Vec<UsageEntry> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();

        for file in &files {
            let parsed = match self.file_entries(file, cutoff) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("skipping unreadable usage file {:?}: {}", file, e);
                    continue;
                }
            };
            for entry in parsed {
                reader::dedup_insert(&mut entries, &mut seen, entry);
            }
        }

        // Evict cache entries for files no longer on disk.
        let current: std::collections::HashSet<&PathBuf> = files.iter().collect();
        self.files.retain(|path, _| current.contains(path));

        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    fn file_entries(
        &mut self,
        file: &Path,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<UsageEntry>, std::io::Error> {
        let meta = std::fs::metadata(file)?;
        let mtime = meta.modified()?;
        let size = meta.len();

        let hit = self
            .files
            .get(file)
            .filter(|c| c.mtime == mtime && c.size == size);

        let entries = match hit {
            Some(cached) => {
                debug!("cache hit for {:?}", file);
                cached.entries.clone()
            }
            None => {
                // The cache stores unfiltered entries so a later call
                // with a different cutoff still hits.
                let parsed = reader::parse_jsonl_file(file, None)?;
                self.files.insert(
                    file.to_path_buf(),
                    CachedFile {
                        mtime,
                        size,
                        entries: parsed.clone(),
                    },
                );
                parsed
            }
        };

        Ok(match cutoff {
            Some(cutoff) => entries.into_iter().filter(|e| e.timestamp >= cutoff).collect(),
            None => entries,
        })
    }
}
