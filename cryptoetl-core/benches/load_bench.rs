//! Criterion benchmarks for the load path.
//!
//! Benchmarks:
//! 1. Batch validation
//! 2. Dry-run classification against a populated series
//! 3. Full load into the in-memory store (validate, snapshot, commit)

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cryptoetl_core::domain::{Asset, CanonicalRow, ExtractionWindow, IntervalKind, LoadBatch, SeriesKey};
use cryptoetl_core::load::{
    check, classify, validate, BackupManager, KeyLocks, Loader, MemoryStore, RecordingAudit,
};
use rust_decimal::Decimal;
use std::sync::Arc;

// ── Helpers ──────────────────────────────────────────────────────────

fn key() -> SeriesKey {
    SeriesKey::new(Asset::Btc, IntervalKind::Hourly)
}

fn make_rows(n: usize) -> Vec<CanonicalRow> {
    let start = Utc.with_ymd_and_hms(2020, 3, 24, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            let close = Decimal::from(6500 + (i % 500) as i64);
            CanonicalRow {
                asset_symbol: Asset::Btc,
                interval_kind: IntervalKind::Hourly,
                timestamp: start + Duration::hours(i as i64),
                open: close - Decimal::ONE,
                high: close + Decimal::TEN,
                low: close - Decimal::TEN,
                close,
                volume_quote: Decimal::new(1_234_567, 1),
            }
        })
        .collect()
}

fn make_batch(rows: &[CanonicalRow]) -> LoadBatch {
    let first = rows.first().map(|r| r.timestamp).unwrap_or_else(Utc::now);
    let last = rows.last().map(|r| r.timestamp).unwrap_or(first);
    let window = ExtractionWindow::new(first, last).unwrap();
    LoadBatch::from_rows(key(), window, rows, "bench").unwrap()
}

// ── Benchmarks ───────────────────────────────────────────────────────

fn bench_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate");
    for n in [100usize, 2_000, 20_000] {
        let batch = make_batch(&make_rows(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &batch, |b, batch| {
            b.iter(|| validate(black_box(batch)))
        });
    }
    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    for n in [2_000usize, 20_000] {
        let rows = make_rows(n);
        let existing = &rows[..n / 2];
        let eligible = check(make_batch(&rows)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &eligible, |b, eligible| {
            b.iter(|| classify(black_box(eligible), black_box(existing)))
        });
    }
    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let rows = make_rows(2_000);
    c.bench_function("load_2000_rows_memory", |b| {
        b.iter(|| {
            let loader = Loader::new(
                Arc::new(MemoryStore::new()),
                BackupManager::new(dir.path()),
                Arc::new(RecordingAudit::new()),
                KeyLocks::new(),
            );
            loader.load(black_box(make_batch(&rows)))
        })
    });
}

criterion_group!(benches, bench_validate, bench_classify, bench_load);
criterion_main!(benches);
