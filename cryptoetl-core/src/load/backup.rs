//! Backup manager: restorable snapshots of one series' stored rows.
//!
//! Layout: `{backup_dir}/{ASSET}_{INTERVAL}_{YYYYMMDDTHHMMSS.ffffffZ}.csv`
//! with a `.meta.json` sidecar holding the [`BackupSnapshot`]. Both files are
//! written atomically and never overwritten. Retention is left to an external
//! policy; nothing here deletes snapshots.

use super::store::{StoreError, TargetStore};
use crate::data::batch_file::sidecar_path;
use crate::domain::batch::{decode_records, digest, encode_records};
use crate::domain::{BatchRecord, CanonicalRow, SeriesKey};
use crate::fsio;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SIDECAR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("could not read target state: {0}")]
    Store(#[from] StoreError),

    #[error("backup I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("backup encoding failed: {0}")]
    Encode(String),

    #[error("snapshot sidecar missing: {0}")]
    MissingSidecar(PathBuf),

    #[error("snapshot sidecar {path} is unreadable: {reason}")]
    InvalidSidecar { path: PathBuf, reason: String },

    #[error("snapshot {path} failed integrity check (expected {expected}, got {actual})")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("snapshot {path} is unusable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Immutable, timestamped capture of one series' rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub key: SeriesKey,
    pub taken_at: DateTime<Utc>,
    pub path: PathBuf,
    pub row_count: usize,
    pub data_hash: String,
}

fn write_sidecar(snapshot: &BackupSnapshot) -> Result<(), BackupError> {
    let meta_path = sidecar_path(&snapshot.path);
    let json =
        serde_json::to_vec_pretty(snapshot).map_err(|e| BackupError::Encode(e.to_string()))?;
    fsio::write_new_atomic(&meta_path, &json).map_err(|source| BackupError::Io {
        path: meta_path,
        source,
    })
}

/// `BTC_DAILY_20200420T000000.123456Z.csv`
pub fn snapshot_file_name(key: SeriesKey, taken_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}.csv",
        key.file_stem(),
        taken_at.format("%Y%m%dT%H%M%S%.6fZ")
    )
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capture the rows currently stored for `key`.
    pub fn snapshot(
        &self,
        store: &dyn TargetStore,
        key: SeriesKey,
    ) -> Result<BackupSnapshot, BackupError> {
        let rows = store.read_rows(key)?;
        self.write_snapshot(key, &rows, Utc::now())
    }

    fn write_snapshot(
        &self,
        key: SeriesKey,
        rows: &[CanonicalRow],
        mut taken_at: DateTime<Utc>,
    ) -> Result<BackupSnapshot, BackupError> {
        let records: Vec<BatchRecord> = rows.iter().map(BatchRecord::from).collect();
        let bytes = encode_records(&records).map_err(|e| BackupError::Encode(e.to_string()))?;
        let data_hash = digest(&bytes);

        fs::create_dir_all(&self.dir).map_err(|source| BackupError::Io {
            path: self.dir.clone(),
            source,
        })?;

        // Two snapshots of one key inside the same microsecond get adjacent names.
        let path = loop {
            let candidate = self.dir.join(snapshot_file_name(key, taken_at));
            match fsio::write_new_atomic(&candidate, &bytes) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    taken_at += Duration::microseconds(1);
                }
                Err(source) => {
                    return Err(BackupError::Io {
                        path: candidate,
                        source,
                    })
                }
            }
        };

        let snapshot = BackupSnapshot {
            key,
            taken_at,
            path,
            row_count: rows.len(),
            data_hash,
        };

        if let Err(e) = write_sidecar(&snapshot) {
            // A CSV without its sidecar can never be opened or listed.
            if let Err(rm) = fs::remove_file(&snapshot.path) {
                tracing::warn!(
                    path = %snapshot.path.display(),
                    error = %rm,
                    "could not remove snapshot after sidecar failure"
                );
            }
            return Err(e);
        }

        tracing::info!(
            key = %key,
            path = %snapshot.path.display(),
            rows = snapshot.row_count,
            "snapshot written"
        );
        Ok(snapshot)
    }

    /// Load a snapshot by the path of its CSV file.
    pub fn open(&self, path: &Path) -> Result<BackupSnapshot, BackupError> {
        let meta_path = sidecar_path(path);
        let json = match fs::read(&meta_path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::MissingSidecar(meta_path))
            }
            Err(source) => {
                return Err(BackupError::Io {
                    path: meta_path,
                    source,
                })
            }
        };
        let mut snapshot: BackupSnapshot =
            serde_json::from_slice(&json).map_err(|e| BackupError::InvalidSidecar {
                path: meta_path,
                reason: e.to_string(),
            })?;
        // The directory may have moved since the sidecar was written.
        snapshot.path = path.to_path_buf();
        Ok(snapshot)
    }

    /// Snapshots for `key`, newest first. Unreadable sidecars are skipped.
    pub fn list(&self, key: SeriesKey) -> Result<Vec<BackupSnapshot>, BackupError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BackupError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let prefix = format!("{}_", key.file_stem());
        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| BackupError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(SIDECAR_SUFFIX) else {
                continue;
            };
            if !stem.starts_with(&prefix) {
                continue;
            }
            let csv_path = self.dir.join(format!("{stem}.csv"));
            match self.open(&csv_path) {
                Ok(snapshot) if snapshot.key == key => snapshots.push(snapshot),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %csv_path.display(), error = %e, "skipping snapshot"),
            }
        }

        snapshots.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Ok(snapshots)
    }

    /// Read a snapshot's rows after checking the file against its sidecar.
    pub fn read_rows(&self, snapshot: &BackupSnapshot) -> Result<Vec<CanonicalRow>, BackupError> {
        let on_disk = self.open(&snapshot.path)?;
        if on_disk.data_hash != snapshot.data_hash || on_disk.key != snapshot.key {
            return Err(BackupError::Corrupt {
                path: snapshot.path.clone(),
                reason: "sidecar does not describe this snapshot".into(),
            });
        }

        let bytes = fs::read(&snapshot.path).map_err(|source| BackupError::Io {
            path: snapshot.path.clone(),
            source,
        })?;
        let actual = digest(&bytes);
        if actual != on_disk.data_hash {
            return Err(BackupError::HashMismatch {
                path: snapshot.path.clone(),
                expected: on_disk.data_hash,
                actual,
            });
        }

        let corrupt = |reason: String| BackupError::Corrupt {
            path: snapshot.path.clone(),
            reason,
        };
        let records = decode_records(&bytes).map_err(|e| corrupt(e.to_string()))?;
        if records.len() != on_disk.row_count {
            return Err(corrupt(format!(
                "sidecar declares {} rows, file holds {}",
                on_disk.row_count,
                records.len()
            )));
        }
        records
            .iter()
            .map(|r| r.to_row().map_err(|e| corrupt(e.to_string())))
            .collect()
    }

    /// Make the snapshot's rows the complete stored set for its key.
    /// Returns the number of rows restored.
    pub fn restore(
        &self,
        store: &dyn TargetStore,
        snapshot: &BackupSnapshot,
    ) -> Result<usize, BackupError> {
        let rows = self.read_rows(snapshot)?;
        store.replace_rows(snapshot.key, &rows)?;
        tracing::info!(
            key = %snapshot.key,
            path = %snapshot.path.display(),
            rows = rows.len(),
            "snapshot restored"
        );
        Ok(rows.len())
    }
}
