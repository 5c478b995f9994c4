//! PostgresStore against a live database.
//!
//! Skipped unless `CRYPTOETL_DB_RUN_TESTS=1` and `CRYPTOETL_DB_URL` are set.
//! Each test uses its own table so runs do not interfere.

use chrono::{TimeZone, Utc};
use cryptoetl_core::domain::{Asset, CanonicalRow, ExtractionWindow, IntervalKind, LoadBatch, SeriesKey};
use cryptoetl_core::load::{
    BackupManager, KeyLocks, LoadStatus, Loader, PostgresStore, StoreError, TargetStore,
    TracingAudit,
};
use rust_decimal::Decimal;
use std::sync::Arc;

fn db_url() -> Option<String> {
    if std::env::var("CRYPTOETL_DB_RUN_TESTS").ok().as_deref() != Some("1") {
        return None;
    }
    std::env::var("CRYPTOETL_DB_URL").ok()
}

fn store(table: &str) -> Option<PostgresStore> {
    let url = db_url()?;
    let store = PostgresStore::with_table(&url, 2, table).unwrap();
    store.ensure_schema().unwrap();
    store.replace_rows(key(), &[]).unwrap();
    Some(store)
}

fn key() -> SeriesKey {
    SeriesKey::new(Asset::Eth, IntervalKind::Hourly)
}

fn row(h: u32) -> CanonicalRow {
    CanonicalRow {
        asset_symbol: Asset::Eth,
        interval_kind: IntervalKind::Hourly,
        timestamp: Utc.with_ymd_and_hms(2020, 4, 20, h, 0, 0).unwrap(),
        open: Decimal::new(17250, 2),
        high: Decimal::new(17500, 2),
        low: Decimal::new(17000, 2),
        close: Decimal::new(17310, 2),
        volume_quote: Decimal::new(98_765_4321, 4),
    }
}

#[test]
fn insert_new_is_all_or_nothing() {
    let Some(store) = store("cryptoetl_test_atomic") else {
        return;
    };
    assert_eq!(store.insert_new(key(), &[row(0), row(1)]).unwrap(), 2);

    let err = store.insert_new(key(), &[row(2), row(1), row(3)]).unwrap_err();
    assert!(matches!(err, StoreError::Conflict(k) if k == row(1).key()));

    let stored = store.read_rows(key()).unwrap();
    assert_eq!(stored, vec![row(0), row(1)]);
}

#[test]
fn numeric_values_round_trip_exactly() {
    let Some(store) = store("cryptoetl_test_numeric") else {
        return;
    };
    let mut precise = row(5);
    precise.close = "173.123456789012".parse().unwrap();
    store.insert_new(key(), &[precise.clone()]).unwrap();
    assert_eq!(store.read_rows(key()).unwrap(), vec![precise]);
}

#[test]
fn loader_commits_and_rerun_skips() {
    let Some(store) = store("cryptoetl_test_loader") else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let loader = Loader::new(
        Arc::new(store),
        BackupManager::new(dir.path()),
        Arc::new(TracingAudit),
        KeyLocks::new(),
    );
    let window = ExtractionWindow::new(row(0).timestamp, row(3).timestamp).unwrap();
    let rows = [row(0), row(1), row(2), row(3)];
    let batch = || LoadBatch::from_rows(key(), window, &rows, "pg-test").unwrap();

    let first = loader.load(batch());
    assert_eq!(first.status, LoadStatus::Committed);
    assert_eq!(first.rows_inserted, 4);

    let second = loader.load(batch());
    assert_eq!(second.status, LoadStatus::Committed);
    assert_eq!(second.rows_inserted, 0);
    assert_eq!(second.rows_skipped_as_duplicate, 4);
}
