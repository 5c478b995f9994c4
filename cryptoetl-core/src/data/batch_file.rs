//! Staged batch files: the hand-off between transformer and loader.
//!
//! Layout: `{staging_dir}/{ASSET}_{INTERVAL}_{start}_{end}.csv` plus a
//! `{same}.meta.json` sidecar holding [`BatchMeta`]. Both are written
//! atomically, CSV first, so a sidecar always describes a complete file.

use crate::domain::batch::{decode_records, digest, encode_records};
use crate::domain::{BatchMeta, BatchRecord, CanonicalRow, ExtractionWindow, LoadBatch, SeriesKey};
use crate::fsio;
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchFileError {
    #[error("batch file I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("batch file {path} is not valid CSV: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("batch sidecar missing: {0}")]
    MissingSidecar(PathBuf),

    #[error("batch sidecar {path} is unreadable: {reason}")]
    InvalidSidecar { path: PathBuf, reason: String },

    #[error("batch file {path} hash mismatch (sidecar {expected}, file {actual})")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

/// A batch that has been written to the staging directory.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    pub path: PathBuf,
    pub meta: BatchMeta,
}

/// `BTC_DAILY_20200420T000000Z_20200422T000000Z.csv`
pub fn batch_file_name(key: SeriesKey, window: ExtractionWindow) -> String {
    format!(
        "{}_{}_{}.csv",
        key.file_stem(),
        window.start().format("%Y%m%dT%H%M%SZ"),
        window.end().format("%Y%m%dT%H%M%SZ")
    )
}

/// Sidecar path for a batch or snapshot CSV: `x.csv` → `x.meta.json`.
pub fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("meta.json")
}

/// Write rows and their metadata sidecar into `dir`.
pub fn write_batch(
    dir: &Path,
    key: SeriesKey,
    window: ExtractionWindow,
    rows: &[CanonicalRow],
) -> Result<StagedBatch, BatchFileError> {
    let path = dir.join(batch_file_name(key, window));
    let records: Vec<BatchRecord> = rows.iter().map(BatchRecord::from).collect();
    let bytes = encode_records(&records).map_err(|source| BatchFileError::Csv {
        path: path.clone(),
        source,
    })?;

    let meta = BatchMeta {
        asset: key.asset,
        interval: key.interval,
        window,
        row_count: records.len(),
        data_hash: digest(&bytes),
        created_at: Utc::now(),
    };

    fsio::write_atomic(&path, &bytes).map_err(|source| BatchFileError::Io {
        path: path.clone(),
        source,
    })?;

    let meta_path = sidecar_path(&path);
    let meta_json =
        serde_json::to_vec_pretty(&meta).map_err(|e| BatchFileError::InvalidSidecar {
            path: meta_path.clone(),
            reason: e.to_string(),
        })?;
    fsio::write_atomic(&meta_path, &meta_json).map_err(|source| BatchFileError::Io {
        path: meta_path.clone(),
        source,
    })?;

    tracing::info!(path = %path.display(), rows = meta.row_count, "staged batch");
    Ok(StagedBatch { path, meta })
}

/// Read a staged batch. The file's bytes must hash to the sidecar's
/// `data_hash`; cell contents are left for the validator.
pub fn read_batch(path: &Path) -> Result<LoadBatch, BatchFileError> {
    let bytes = fs::read(path).map_err(|source| BatchFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let meta_path = sidecar_path(path);
    let meta_json = match fs::read(&meta_path) {
        Ok(json) => json,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BatchFileError::MissingSidecar(meta_path))
        }
        Err(source) => {
            return Err(BatchFileError::Io {
                path: meta_path,
                source,
            })
        }
    };
    let meta: BatchMeta =
        serde_json::from_slice(&meta_json).map_err(|e| BatchFileError::InvalidSidecar {
            path: meta_path.clone(),
            reason: e.to_string(),
        })?;

    let actual = digest(&bytes);
    if actual != meta.data_hash {
        return Err(BatchFileError::HashMismatch {
            path: path.to_path_buf(),
            expected: meta.data_hash,
            actual,
        });
    }

    let records = decode_records(&bytes).map_err(|source| BatchFileError::Csv {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(LoadBatch {
        records,
        meta,
        source: path.display().to_string(),
    })
}

/// Staged batch files for `key`, newest window end first.
pub fn list_batches(dir: &Path, key: SeriesKey) -> Result<Vec<PathBuf>, BatchFileError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(BatchFileError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let prefix = format!("{}_", key.file_stem());
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BatchFileError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".csv") {
            paths.push(entry.path());
        }
    }
    // File names embed start and end; lexical order is chronological.
    paths.sort_by(|a, b| {
        let end = |p: &PathBuf| {
            p.file_stem()
                .map(|s| s.to_string_lossy().rsplit('_').next().unwrap_or_default().to_string())
                .unwrap_or_default()
        };
        end(b).cmp(&end(a)).then_with(|| b.cmp(a))
    });
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Asset, IntervalKind};
    use chrono::{DateTime, TimeZone};

    fn ts(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 4, d, 0, 0, 0).unwrap()
    }

    fn key() -> SeriesKey {
        SeriesKey::new(Asset::Btc, IntervalKind::Daily)
    }

    fn rows() -> Vec<CanonicalRow> {
        (20..=22)
            .map(|d| CanonicalRow {
                asset_symbol: Asset::Btc,
                interval_kind: IntervalKind::Daily,
                timestamp: ts(d),
                open: "7120.5".parse().unwrap(),
                high: "7200".parse().unwrap(),
                low: "6800.1".parse().unwrap(),
                close: "6875.22".parse().unwrap(),
                volume_quote: "1250000000".parse().unwrap(),
            })
            .collect()
    }

    #[test]
    fn file_name_embeds_key_and_window() {
        let w = ExtractionWindow::new(ts(20), ts(22)).unwrap();
        assert_eq!(
            batch_file_name(key(), w),
            "BTC_DAILY_20200420T000000Z_20200422T000000Z.csv"
        );
    }

    #[test]
    fn write_then_read_preserves_rows_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let w = ExtractionWindow::new(ts(20), ts(22)).unwrap();
        let staged = write_batch(dir.path(), key(), w, &rows()).unwrap();
        assert!(sidecar_path(&staged.path).exists());

        let batch = read_batch(&staged.path).unwrap();
        assert_eq!(batch.meta, staged.meta);
        assert_eq!(batch.meta.row_count, 3);
        let typed: Vec<CanonicalRow> = batch.records.iter().map(|r| r.to_row().unwrap()).collect();
        assert_eq!(typed, rows());
    }

    #[test]
    fn missing_sidecar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let w = ExtractionWindow::new(ts(20), ts(22)).unwrap();
        let staged = write_batch(dir.path(), key(), w, &rows()).unwrap();
        fs::remove_file(sidecar_path(&staged.path)).unwrap();
        assert!(matches!(
            read_batch(&staged.path),
            Err(BatchFileError::MissingSidecar(_))
        ));
    }

    #[test]
    fn garbage_sidecar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let w = ExtractionWindow::new(ts(20), ts(22)).unwrap();
        let staged = write_batch(dir.path(), key(), w, &rows()).unwrap();
        fs::write(sidecar_path(&staged.path), b"{not json").unwrap();
        assert!(matches!(
            read_batch(&staged.path),
            Err(BatchFileError::InvalidSidecar { .. })
        ));
    }

    #[test]
    fn edited_file_fails_hash_check() {
        let dir = tempfile::tempdir().unwrap();
        let w = ExtractionWindow::new(ts(20), ts(22)).unwrap();
        let staged = write_batch(dir.path(), key(), w, &rows()).unwrap();
        let mut text = fs::read_to_string(&staged.path).unwrap();
        text = text.replace("6875.22", "6875.23");
        fs::write(&staged.path, text).unwrap();
        assert!(matches!(
            read_batch(&staged.path),
            Err(BatchFileError::HashMismatch { .. })
        ));
    }

    #[test]
    fn lists_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let older = ExtractionWindow::new(ts(20), ts(21)).unwrap();
        let newer = ExtractionWindow::new(ts(20), ts(22)).unwrap();
        write_batch(dir.path(), key(), older, &rows()[..2]).unwrap();
        write_batch(dir.path(), key(), newer, &rows()).unwrap();
        let other = SeriesKey::new(Asset::Eth, IntervalKind::Daily);
        write_batch(dir.path(), other, newer, &[]).unwrap();

        let listed = list_batches(dir.path(), key()).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].to_string_lossy().ends_with("20200422T000000Z.csv"));
    }
}
