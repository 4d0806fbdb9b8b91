//! Resume journal
//!
//! Lists the datasets a sync run has fully completed, so an interrupted run
//! can be restarted with those datasets skipped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalFile {
    completed: BTreeSet<String>,
    updated_at: i64,
}

#[derive(Debug)]
pub struct ResumeJournal {
    path: PathBuf,
    pub completed: BTreeSet<String>,
}

impl ResumeJournal {
    /// An empty journal that will be written to `path`.
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            completed: BTreeSet::new(),
        }
    }

    /// Load the journal at `path`; a missing file is an empty journal.
    pub fn load(path: &Path) -> Result<Self> {
        let mut journal = Self::new(path);
        if path.exists() {
            let data = fs::read_to_string(path)?;
            let file: JournalFile = serde_json::from_str(&data)?;
            journal.completed = file.completed;
        }
        Ok(journal)
    }

    pub fn is_completed(&self, dataset_id: &str) -> bool {
        self.completed.contains(dataset_id)
    }

    /// Record a finished dataset and persist immediately.
    pub fn mark_completed(&mut self, dataset_id: &str) -> Result<()> {
        if self.completed.insert(dataset_id.to_string()) {
            self.save()?;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = JournalFile {
            completed: self.completed.clone(),
            updated_at: chrono::Utc::now().timestamp(),
        };
        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(&file)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Start over: forget every completed dataset.
    pub fn reset(&mut self) -> Result<()> {
        self.completed.clear();
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing() {
        let tmp = TempDir::new().unwrap();
        let journal = ResumeJournal::load(&tmp.path().join("prod-resume.json")).unwrap();
        assert!(journal.completed.is_empty());
    }

    #[test]
    fn test_mark_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prod-resume.json");

        let mut journal = ResumeJournal::new(&path);
        journal.mark_completed("D1").unwrap();
        journal.mark_completed("D2").unwrap();
        journal.mark_completed("D1").unwrap();

        let loaded = ResumeJournal::load(&path).unwrap();
        assert_eq!(loaded.completed.len(), 2);
        assert!(loaded.is_completed("D1"));
        assert!(!loaded.is_completed("D3"));
    }

    #[test]
    fn test_reset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dev-resume.json");
        let mut journal = ResumeJournal::new(&path);
        journal.mark_completed("D1").unwrap();
        journal.reset().unwrap();
        assert!(ResumeJournal::load(&path).unwrap().completed.is_empty());
    }
}
