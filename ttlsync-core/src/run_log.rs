//! Run history
//!
//! Every non-dry sync run appends one JSON entry to a per-environment
//! directory. Entries can be listed, filtered by time and pruned.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Summary of one sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_id: String,
    pub environment: String,
    /// Unix timestamp (seconds)
    pub started_at: i64,
    pub duration_ms: u64,
    /// Datasets that took part in the plan
    pub datasets: usize,
    pub skipped: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub failed: usize,
    pub success: bool,
    /// Fatal error that aborted the run
    pub error: Option<String>,
}

impl RunLogEntry {
    pub fn new(environment: &str, started_at: i64) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            environment: environment.to_string(),
            started_at,
            duration_ms: 0,
            datasets: 0,
            skipped: 0,
            inserted: 0,
            replaced: 0,
            failed: 0,
            success: false,
            error: None,
        }
    }
}

/// Directory of run entries
pub struct RunLog {
    log_dir: PathBuf,
}

impl RunLog {
    /// Log for one environment under `working_dir`.
    pub fn new(working_dir: &Path, environment: &str) -> Self {
        Self {
            log_dir: working_dir.join(format!("{}-runs", environment)),
        }
    }

    pub fn append(&self, entry: &RunLogEntry) -> Result<()> {
        fs::create_dir_all(&self.log_dir)?;
        let filename = format!("{}_{}.json", entry.started_at, entry.run_id);
        let data = serde_json::to_string_pretty(entry)?;
        fs::write(self.log_dir.join(filename), data)?;
        Ok(())
    }

    /// Entries started within `[from, to]`, oldest first.
    pub fn query(&self, from: i64, to: i64) -> Result<Vec<RunLogEntry>> {
        let mut entries: Vec<RunLogEntry> = self
            .read_entries()?
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|e| e.started_at >= from && e.started_at <= to)
            .collect();
        entries.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(entries)
    }

    pub fn all(&self) -> Result<Vec<RunLogEntry>> {
        self.query(i64::MIN, i64::MAX)
    }

    pub fn latest(&self) -> Result<Option<RunLogEntry>> {
        Ok(self.all()?.into_iter().last())
    }

    /// Remove entries started before `timestamp`. Returns how many were removed.
    pub fn cleanup_before(&self, timestamp: i64) -> Result<u64> {
        let mut removed = 0u64;
        for (path, entry) in self.read_entries()? {
            if entry.started_at < timestamp {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Unreadable files are skipped.
    fn read_entries(&self) -> Result<Vec<(PathBuf, RunLogEntry)>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.log_dir)? {
            let path = dir_entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(data) = fs::read_to_string(&path) {
                    match serde_json::from_str::<RunLogEntry>(&data) {
                        Ok(entry) => entries.push((path, entry)),
                        Err(e) => tracing::warn!("Skipping run log {}: {}", path.display(), e),
                    }
                }
            }
        }
        Ok(entries)
    }
}
