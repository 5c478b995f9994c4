//! Outcome of one load.

use super::backup::BackupSnapshot;
use super::state::{LoadState, Transition};
use super::validate::ValidationFinding;
use crate::domain::SeriesKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStatus {
    Committed,
    Rejected,
    RolledBack,
    Previewed,
}

impl LoadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadStatus::Committed => "COMMITTED",
            LoadStatus::Rejected => "REJECTED",
            LoadStatus::RolledBack => "ROLLED_BACK",
            LoadStatus::Previewed => "PREVIEWED",
        }
    }

    /// COMMITTED and PREVIEWED count as success for exit codes.
    pub fn is_success(self) -> bool {
        matches!(self, LoadStatus::Committed | LoadStatus::Previewed)
    }

    pub(crate) fn from_terminal(state: LoadState) -> Option<Self> {
        match state {
            LoadState::Committed => Some(LoadStatus::Committed),
            LoadState::Rejected => Some(LoadStatus::Rejected),
            LoadState::RolledBack => Some(LoadStatus::RolledBack),
            LoadState::Previewed => Some(LoadStatus::Previewed),
            _ => None,
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    pub key: SeriesKey,
    pub source: String,
    pub status: LoadStatus,
    pub rows_inserted: usize,
    pub rows_skipped_as_duplicate: usize,
    /// Subset of the skipped rows whose stored values differ from the batch.
    pub rows_drifted: usize,
    pub validation_findings: Vec<ValidationFinding>,
    pub backup_reference: Option<PathBuf>,
    pub error: Option<String>,
    pub transitions: Vec<Transition>,
}

impl LoadResult {
    /// A key that never reached the loader (extraction or batch-file failure).
    pub fn rejected_before_load(
        key: SeriesKey,
        source: impl Into<String>,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            key,
            source: source.into(),
            status: LoadStatus::Rejected,
            rows_inserted: 0,
            rows_skipped_as_duplicate: 0,
            rows_drifted: 0,
            validation_findings: Vec::new(),
            backup_reference: None,
            error: Some(error.to_string()),
            transitions: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub(crate) fn with_backup(mut self, snapshot: Option<&BackupSnapshot>) -> Self {
        self.backup_reference = snapshot.map(|s| s.path.clone());
        self
    }
}
