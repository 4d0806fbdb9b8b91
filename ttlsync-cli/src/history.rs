//! Human-readable output for run history, sync reports and stored state.

use anyhow::Result;
use std::io::Write;
use ttlsync_core::{ModelOutcome, RunLog, RunLogEntry, StateEntry, SyncReport};

pub fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// One-line summary of a run.
pub fn format_entry(entry: &RunLogEntry) -> String {
    let status = if entry.success { "OK" } else { "FAILED" };
    format!(
        "[{}] {} | {} datasets | {} skipped, {} inserted, {} replaced, {} failed | {}ms | {}{}",
        format_timestamp(entry.started_at),
        entry.environment,
        entry.datasets,
        entry.skipped,
        entry.inserted,
        entry.replaced,
        entry.failed,
        entry.duration_ms,
        status,
        entry
            .error
            .as_ref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default(),
    )
}

pub fn print_history(log: &RunLog, writer: &mut dyn Write) -> Result<()> {
    let entries = log.all()?;
    if entries.is_empty() {
        writeln!(writer, "No sync runs recorded.")?;
        return Ok(());
    }

    writeln!(writer, "Sync History ({} runs):", entries.len())?;
    writeln!(writer, "{}", "-".repeat(80))?;
    for entry in &entries {
        writeln!(writer, "  {}", format_entry(entry))?;
    }
    writeln!(writer, "{}", "-".repeat(80))?;

    let successes = entries.iter().filter(|e| e.success).count();
    let inserted: usize = entries.iter().map(|e| e.inserted).sum();
    let replaced: usize = entries.iter().map(|e| e.replaced).sum();
    let total_ms: u64 = entries.iter().map(|e| e.duration_ms).sum();
    writeln!(
        writer,
        "Summary: {} runs ({} successful), {} groups inserted, {} replaced, {}ms total",
        entries.len(),
        successes,
        inserted,
        replaced,
        total_ms,
    )?;
    Ok(())
}

pub fn print_report(report: &SyncReport, writer: &mut dyn Write) -> Result<()> {
    let changed: Vec<_> = report
        .models
        .iter()
        .filter(|m| m.outcome != ModelOutcome::Skipped)
        .collect();

    if changed.is_empty() {
        writeln!(writer, "Already up to date ({} groups unchanged).", report.skipped())?;
        return Ok(());
    }

    writeln!(writer, "{}", "-".repeat(80))?;
    for m in &changed {
        writeln!(writer, "  {:<40} {:<12} {}", m.dataset_id, m.model, m.outcome)?;
    }
    writeln!(writer, "{}", "-".repeat(80))?;
    writeln!(
        writer,
        "Summary: {} datasets, {} skipped, {} inserted, {} replaced, {} relinked, {} cleared, {} planned, {} failed",
        report.dataset_count(),
        report.skipped(),
        report.inserted(),
        report.replaced(),
        report.relinked(),
        report.cleared(),
        report.planned(),
        report.failed(),
    )?;
    Ok(())
}

pub fn print_status(entries: &[StateEntry], writer: &mut dyn Write) -> Result<()> {
    if entries.is_empty() {
        writeln!(writer, "No synced groups recorded.")?;
        return Ok(());
    }

    writeln!(writer, "{:<40} {:<12} {:<14} {}", "DATASET", "MODEL", "FINGERPRINT", "UPDATED")?;
    for entry in entries {
        let fingerprint = if entry.fingerprint.is_empty() {
            "(cleared)".to_string()
        } else {
            entry.fingerprint.short()
        };
        writeln!(
            writer,
            "{:<40} {:<12} {:<14} {}",
            entry.dataset_id,
            entry.model,
            fingerprint,
            format_timestamp(entry.updated_at)
        )?;
    }
    let mut datasets: Vec<&str> = entries.iter().map(|e| e.dataset_id.as_str()).collect();
    datasets.dedup();
    writeln!(writer, "{} groups in {} datasets", entries.len(), datasets.len())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use ttlsync_core::{Fingerprint, ModelReport, Record};

    fn output(f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_format_entry() {
        let mut entry = RunLogEntry::new("dev", 0);
        entry.datasets = 2;
        entry.inserted = 3;
        entry.error = Some("store unavailable".to_string());
        let line = format_entry(&entry);
        assert!(line.starts_with("[1970-01-01 00:00:00 UTC] dev | 2 datasets"));
        assert!(line.ends_with("FAILED (store unavailable)"));
    }

    #[test]
    fn test_print_history() {
        let tmp = TempDir::new().unwrap();
        let log = RunLog::new(tmp.path(), "prod");
        assert!(output(|w| print_history(&log, w)).contains("No sync runs"));

        for (ts, success) in [(100, true), (200, false)] {
            let mut entry = RunLogEntry::new("prod", ts);
            entry.success = success;
            entry.inserted = 1;
            log.append(&entry).unwrap();
        }
        let text = output(|w| print_history(&log, w));
        assert!(text.contains("Sync History (2 runs)"));
        assert!(text.contains("Summary: 2 runs (1 successful), 2 groups inserted"));
    }

    #[test]
    fn test_print_report() {
        let mut report = SyncReport::default();
        report.models.push(ModelReport {
            dataset_id: "N:dataset:1".to_string(),
            model: "subject".to_string(),
            outcome: ModelOutcome::Skipped,
        });
        assert!(output(|w| print_report(&report, w)).contains("Already up to date (1 groups"));

        report.models.push(ModelReport {
            dataset_id: "N:dataset:1".to_string(),
            model: "sample".to_string(),
            outcome: ModelOutcome::Inserted { records: 4 },
        });
        report.models.push(ModelReport {
            dataset_id: "N:dataset:1".to_string(),
            model: "term".to_string(),
            outcome: ModelOutcome::Relinked { links: 2 },
        });
        let text = output(|w| print_report(&report, w));
        assert!(text.contains("inserted 4"));
        assert!(text.contains("relinked 2"));
        assert!(text.contains("Summary: 1 datasets, 1 skipped, 1 inserted, 0 replaced, 1 relinked"));
    }

    #[test]
    fn test_print_status() {
        let entries = vec![
            StateEntry {
                dataset_id: "N:dataset:1".to_string(),
                model: "sample".to_string(),
                fingerprint: Fingerprint::of_records(&[Record::new("s1")]),
                updated_at: 0,
            },
            StateEntry {
                dataset_id: "N:dataset:1".to_string(),
                model: "subject".to_string(),
                fingerprint: Fingerprint::empty(),
                updated_at: 0,
            },
        ];
        let text = output(|w| print_status(&entries, w));
        assert!(text.contains("(cleared)"));
        assert!(text.contains("2 groups in 1 datasets"));
    }
}
