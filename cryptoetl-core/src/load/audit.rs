//! Audit sink: structured events emitted at each step of a load.
//!
//! Sinks are fire-and-forget. A sink that cannot persist an event logs the
//! failure and carries on; the load never fails because of its audit trail.

use super::backup::BackupSnapshot;
use super::plan::Drift;
use super::result::LoadResult;
use super::state::Transition;
use super::validate::ValidationFinding;
use crate::domain::SeriesKey;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoadEvent {
    Transition {
        key: SeriesKey,
        source: String,
        #[serde(flatten)]
        transition: Transition,
    },
    Finding {
        key: SeriesKey,
        source: String,
        finding: ValidationFinding,
    },
    Backup {
        key: SeriesKey,
        snapshot: BackupSnapshot,
    },
    Drift {
        key: SeriesKey,
        drift: Drift,
    },
    Completed {
        result: LoadResult,
    },
}

impl LoadEvent {
    pub fn key(&self) -> SeriesKey {
        match self {
            LoadEvent::Transition { key, .. }
            | LoadEvent::Finding { key, .. }
            | LoadEvent::Backup { key, .. }
            | LoadEvent::Drift { key, .. } => *key,
            LoadEvent::Completed { result } => result.key,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &LoadEvent);
}

/// Emits every event as a `tracing` event under the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: &LoadEvent) {
        match event {
            LoadEvent::Transition {
                key, transition, ..
            } => tracing::info!(
                target: "audit",
                key = %key,
                from = %transition.from,
                to = %transition.to,
                detail = %transition.detail,
                "transition"
            ),
            LoadEvent::Finding { key, finding, .. } => {
                if finding.is_fatal() {
                    tracing::error!(target: "audit", key = %key, finding = %finding, "validation finding");
                } else {
                    tracing::warn!(target: "audit", key = %key, finding = %finding, "validation finding");
                }
            }
            LoadEvent::Backup { key, snapshot } => tracing::info!(
                target: "audit",
                key = %key,
                path = %snapshot.path.display(),
                rows = snapshot.row_count,
                "backup taken"
            ),
            LoadEvent::Drift { key, drift } => tracing::warn!(
                target: "audit",
                key = %key,
                row = %drift.key,
                "stored row differs from batch; skipped"
            ),
            LoadEvent::Completed { result } => tracing::info!(
                target: "audit",
                key = %result.key,
                status = %result.status,
                inserted = result.rows_inserted,
                skipped = result.rows_skipped_as_duplicate,
                drifted = result.rows_drifted,
                "load finished"
            ),
        }
    }
}

/// Appends one JSON object per event to a file.
#[derive(Debug)]
pub struct JsonlAudit {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlAudit {
    /// The file is opened lazily on the first event.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &LoadEvent) -> io::Result<()> {
        let json = serde_json::to_string(event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut slot = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            *slot = Some(file);
        }
        match slot.as_mut() {
            Some(file) => {
                writeln!(file, "{json}")?;
                file.flush()
            }
            None => Ok(()),
        }
    }
}

impl AuditSink for JsonlAudit {
    fn record(&self, event: &LoadEvent) {
        if let Err(e) = self.append(event) {
            tracing::warn!(path = %self.path.display(), error = %e, "audit write failed");
        }
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutAudit {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAudit {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for FanoutAudit {
    fn record(&self, event: &LoadEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Keeps events in memory. Used by tests to assert on the audit trail.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<LoadEvent>>,
}

impl RecordingAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LoadEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, event: &LoadEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Asset, IntervalKind};
    use crate::load::result::LoadStatus;
    use crate::load::state::LoadState;
    use chrono::Utc;

    fn key() -> SeriesKey {
        SeriesKey::new(Asset::Eth, IntervalKind::Daily)
    }

    fn transition_event() -> LoadEvent {
        LoadEvent::Transition {
            key: key(),
            source: "ETH_DAILY.csv".into(),
            transition: Transition {
                from: LoadState::Received,
                to: LoadState::Validated,
                at: Utc::now(),
                detail: "0 findings".into(),
            },
        }
    }

    #[test]
    fn jsonl_appends_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");
        let audit = JsonlAudit::new(&path);

        audit.record(&transition_event());
        audit.record(&LoadEvent::Completed {
            result: LoadResult::rejected_before_load(key(), "ETH_DAILY.csv", "boom"),
        });

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "transition");
        assert_eq!(lines[0]["to"], "VALIDATED");
        assert_eq!(lines[1]["event"], "completed");
        assert_eq!(lines[1]["result"]["status"], "REJECTED");
    }

    #[test]
    fn unwritable_jsonl_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for append.
        let audit = JsonlAudit::new(dir.path());
        audit.record(&transition_event());
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(RecordingAudit::new());
        let b = Arc::new(RecordingAudit::new());
        let sinks: Vec<Arc<dyn AuditSink>> = vec![a.clone(), b.clone(), Arc::new(TracingAudit)];
        let fanout = FanoutAudit::new(sinks);
        fanout.record(&transition_event());
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
        assert_eq!(a.events()[0].key(), key());
    }

    #[test]
    fn completed_event_carries_status() {
        let audit = RecordingAudit::new();
        audit.record(&LoadEvent::Completed {
            result: LoadResult::rejected_before_load(key(), "x", "no file"),
        });
        match &audit.events()[0] {
            LoadEvent::Completed { result } => assert_eq!(result.status, LoadStatus::Rejected),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
