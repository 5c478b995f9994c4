//! Plain-text tables for the CLI.

use crate::pipeline::RunSummary;
use cryptoetl_core::load::{BackupSnapshot, LoadResult};
use std::fmt::Write;

const ERROR_WIDTH: usize = 60;

/// One line per key: status, counts, backup reference, and error.
pub fn results_table(results: &[LoadResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:<12} {:>9} {:>9} {:>8}  {}",
        "Key", "Status", "Inserted", "Skipped", "Drifted", "Detail"
    );
    for r in results {
        let detail = match (&r.error, &r.backup_reference) {
            (Some(error), _) => truncate(error, ERROR_WIDTH),
            (None, Some(backup)) => format!("backup {}", backup.display()),
            (None, None) => String::new(),
        };
        let _ = writeln!(
            out,
            "{:<12} {:<12} {:>9} {:>9} {:>8}  {}",
            r.key.to_string(),
            r.status.as_str(),
            r.rows_inserted,
            r.rows_skipped_as_duplicate,
            r.rows_drifted,
            detail
        );
    }
    out
}

pub fn summary_table(summary: &RunSummary) -> String {
    let mut out = results_table(&summary.results);
    let mode = if summary.dry_run { "dry run" } else { "commit" };
    let _ = writeln!(
        out,
        "\n{} key(s), {} failed, {} row(s) inserted ({mode})",
        summary.results.len(),
        summary.failed(),
        summary.rows_inserted()
    );
    out
}

pub fn snapshots_table(snapshots: &[BackupSnapshot]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<28} {:>8}  {}", "Taken at", "Rows", "Path");
    for s in snapshots {
        let _ = writeln!(
            out,
            "{:<28} {:>8}  {}",
            s.taken_at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            s.row_count,
            s.path.display()
        );
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
