//! Load batches: the untyped records read from an intermediate file plus the
//! metadata that travels with them.
//!
//! Records stay untyped (`Option<String>` cells) until the validator turns
//! them into [`CanonicalRow`]s. That keeps "the file had garbage in it" a
//! validation finding rather than a read error.

use super::row::CanonicalRow;
use super::series::{Asset, IntervalKind, SeriesKey};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Column order of every batch and snapshot file.
pub const BATCH_COLUMNS: [&str; 8] = [
    "asset_symbol",
    "interval_kind",
    "timestamp",
    "open",
    "high",
    "low",
    "close",
    "volume_quote",
];

// ── Extraction window ───────────────────────────────────────────────

/// Inclusive `[start, end]` UTC bounds of one extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid extraction window: start {start} is after end {end}")]
pub struct InvalidWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ExtractionWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, InvalidWindow> {
        if start > end {
            return Err(InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Floor both bounds to the interval's granularity.
    pub fn truncated(&self, interval: IntervalKind) -> Self {
        Self {
            start: interval.truncate(self.start),
            end: interval.truncate(self.end),
        }
    }

    /// Earliest bucket boundary at or after `start`.
    pub fn first_bucket(&self, interval: IntervalKind) -> DateTime<Utc> {
        let floored = interval.truncate(self.start);
        if floored < self.start {
            floored + interval.granularity()
        } else {
            floored
        }
    }

    /// Latest bucket boundary at or before `end`.
    pub fn last_bucket(&self, interval: IntervalKind) -> DateTime<Utc> {
        interval.truncate(self.end)
    }

    /// Number of bucket boundaries inside the window (inclusive).
    pub fn expected_rows(&self, interval: IntervalKind) -> i64 {
        let (first, last) = (self.first_bucket(interval), self.last_bucket(interval));
        if last < first {
            0
        } else {
            interval.steps_between(first, last) + 1
        }
    }
}

impl fmt::Display for ExtractionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

// ── Records ─────────────────────────────────────────────────────────

/// One row of an intermediate file, every cell optional and unparsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub asset_symbol: Option<String>,
    pub interval_kind: Option<String>,
    pub timestamp: Option<String>,
    pub open: Option<String>,
    pub high: Option<String>,
    pub low: Option<String>,
    pub close: Option<String>,
    pub volume_quote: Option<String>,
}

impl BatchRecord {
    /// Cells paired with their column names, in file order.
    pub fn cells(&self) -> [(&'static str, Option<&str>); 8] {
        [
            ("asset_symbol", self.asset_symbol.as_deref()),
            ("interval_kind", self.interval_kind.as_deref()),
            ("timestamp", self.timestamp.as_deref()),
            ("open", self.open.as_deref()),
            ("high", self.high.as_deref()),
            ("low", self.low.as_deref()),
            ("close", self.close.as_deref()),
            ("volume_quote", self.volume_quote.as_deref()),
        ]
    }

    /// Strict conversion: the first missing or unparsable cell is an error.
    pub fn to_row(&self) -> Result<CanonicalRow, FieldError> {
        let asset = required(self.asset_symbol.as_deref(), "asset_symbol")?;
        let interval = required(self.interval_kind.as_deref(), "interval_kind")?;
        let timestamp = required(self.timestamp.as_deref(), "timestamp")?;

        Ok(CanonicalRow {
            asset_symbol: Asset::from_str(asset)
                .map_err(|e| FieldError::unparsable("asset_symbol", e.to_string()))?,
            interval_kind: IntervalKind::from_str(interval)
                .map_err(|e| FieldError::unparsable("interval_kind", e.to_string()))?,
            timestamp: parse_timestamp(timestamp)
                .map_err(|reason| FieldError::unparsable("timestamp", reason))?,
            open: decimal_cell(self.open.as_deref(), "open")?,
            high: decimal_cell(self.high.as_deref(), "high")?,
            low: decimal_cell(self.low.as_deref(), "low")?,
            close: decimal_cell(self.close.as_deref(), "close")?,
            volume_quote: decimal_cell(self.volume_quote.as_deref(), "volume_quote")?,
        })
    }
}

impl From<&CanonicalRow> for BatchRecord {
    fn from(row: &CanonicalRow) -> Self {
        Self {
            asset_symbol: Some(row.asset_symbol.to_string()),
            interval_kind: Some(row.interval_kind.to_string()),
            timestamp: Some(format_timestamp(row.timestamp)),
            open: Some(row.open.to_string()),
            high: Some(row.high.to_string()),
            low: Some(row.low.to_string()),
            close: Some(row.close.to_string()),
            volume_quote: Some(row.volume_quote.to_string()),
        }
    }
}

/// A single cell that could not be turned into its typed value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("missing required field '{column}'")]
    Missing { column: &'static str },

    #[error("field '{column}' is not parsable: {reason}")]
    Unparsable { column: &'static str, reason: String },
}

impl FieldError {
    fn unparsable(column: &'static str, reason: impl Into<String>) -> Self {
        Self::Unparsable {
            column,
            reason: reason.into(),
        }
    }
}

fn required<'a>(cell: Option<&'a str>, column: &'static str) -> Result<&'a str, FieldError> {
    match cell.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(FieldError::Missing { column }),
    }
}

fn decimal_cell(cell: Option<&str>, column: &'static str) -> Result<Decimal, FieldError> {
    let raw = required(cell, column)?;
    parse_decimal(raw).map_err(|reason| FieldError::unparsable(column, reason))
}

/// Parse an RFC 3339 timestamp, a naive `YYYY-MM-DD[ HH:MM:SS]` (read as UTC),
/// or integer epoch seconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| format!("epoch seconds out of range: {secs}"));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(format!("unrecognized timestamp '{raw}'"))
}

/// Parse a plain or scientific-notation decimal.
pub fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| format!("'{raw}': {e}"))
}

/// Timestamps are written as RFC 3339 with a `Z` suffix and whole seconds.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── Encoding and hashing ────────────────────────────────────────────

/// Encode records as CSV bytes with a header line, even when empty.
pub fn encode_records(records: &[BatchRecord]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(BATCH_COLUMNS)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// Decode CSV bytes written by [`encode_records`]. Short rows are tolerated;
/// their missing cells come back as `None`.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<BatchRecord>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    reader.deserialize().collect()
}

/// BLAKE3 hex digest of a file's bytes.
pub fn digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

// ── Batch metadata and the batch itself ─────────────────────────────

/// Metadata sidecar for a staged batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMeta {
    pub asset: Asset,
    pub interval: IntervalKind,
    pub window: ExtractionWindow,
    pub row_count: usize,
    /// BLAKE3 of the encoded row file.
    pub data_hash: String,
    pub created_at: DateTime<Utc>,
}

impl BatchMeta {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.asset, self.interval)
    }
}

/// The unit of work handed to the loader. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBatch {
    pub records: Vec<BatchRecord>,
    pub meta: BatchMeta,
    /// Where the batch came from, usually the staged file path.
    pub source: String,
}

impl LoadBatch {
    /// Build a batch from typed rows, hashing their encoded form.
    pub fn from_rows(
        key: SeriesKey,
        window: ExtractionWindow,
        rows: &[CanonicalRow],
        source: impl Into<String>,
    ) -> Result<Self, csv::Error> {
        let records: Vec<BatchRecord> = rows.iter().map(BatchRecord::from).collect();
        Self::from_records(key, window, records, source)
    }

    /// Build a batch from raw records; `row_count` and `data_hash` are derived.
    pub fn from_records(
        key: SeriesKey,
        window: ExtractionWindow,
        records: Vec<BatchRecord>,
        source: impl Into<String>,
    ) -> Result<Self, csv::Error> {
        let bytes = encode_records(&records)?;
        Ok(Self {
            meta: BatchMeta {
                asset: key.asset,
                interval: key.interval,
                window,
                row_count: records.len(),
                data_hash: digest(&bytes),
                created_at: Utc::now(),
            },
            records,
            source: source.into(),
        })
    }

    pub fn key(&self) -> SeriesKey {
        self.meta.key()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 4, d, 0, 0, 0).unwrap()
    }

    fn row(d: u32) -> CanonicalRow {
        CanonicalRow {
            asset_symbol: Asset::Btc,
            interval_kind: IntervalKind::Daily,
            timestamp: ts(d),
            open: "7120.5".parse().unwrap(),
            high: "7200".parse().unwrap(),
            low: "6800.1".parse().unwrap(),
            close: "6875.22".parse().unwrap(),
            volume_quote: "1250000000".parse().unwrap(),
        }
    }

    #[test]
    fn window_rejects_inverted_bounds() {
        assert!(ExtractionWindow::new(ts(22), ts(20)).is_err());
        let w = ExtractionWindow::new(ts(20), ts(22)).unwrap();
        assert!(w.contains(ts(20)));
        assert!(w.contains(ts(22)));
        assert!(!w.contains(ts(23)));
        assert_eq!(w.expected_rows(IntervalKind::Daily), 3);
        assert_eq!(w.expected_rows(IntervalKind::Hourly), 49);
    }

    #[test]
    fn expected_rows_skips_partial_buckets() {
        let start = ts(20) + chrono::Duration::minutes(30);
        let w = ExtractionWindow::new(start, ts(22)).unwrap();
        assert_eq!(w.first_bucket(IntervalKind::Daily), ts(21));
        assert_eq!(w.expected_rows(IntervalKind::Daily), 2);
        assert_eq!(w.expected_rows(IntervalKind::Hourly), 48);

        let inside = ExtractionWindow::new(start, start + chrono::Duration::minutes(10)).unwrap();
        assert_eq!(inside.expected_rows(IntervalKind::Hourly), 0);
    }

    #[test]
    fn record_converts_back_to_row() {
        let original = row(20);
        let record = BatchRecord::from(&original);
        assert_eq!(record.timestamp.as_deref(), Some("2020-04-20T00:00:00Z"));
        assert_eq!(record.to_row().unwrap(), original);
    }

    #[test]
    fn missing_and_bad_cells_name_their_column() {
        let mut record = BatchRecord::from(&row(20));
        record.close = Some("  ".into());
        assert_eq!(
            record.to_row().unwrap_err(),
            FieldError::Missing { column: "close" }
        );

        record.close = Some("abc".into());
        assert!(matches!(
            record.to_row().unwrap_err(),
            FieldError::Unparsable { column: "close", .. }
        ));
    }

    #[test]
    fn timestamp_formats() {
        assert_eq!(parse_timestamp("2020-04-20T00:00:00Z").unwrap(), ts(20));
        assert_eq!(parse_timestamp("2020-04-20T02:00:00+02:00").unwrap(), ts(20));
        assert_eq!(parse_timestamp("1587340800").unwrap(), ts(20));
        assert_eq!(parse_timestamp("2020-04-20").unwrap(), ts(20));
        assert_eq!(parse_timestamp("2020-04-20 00:00:00").unwrap(), ts(20));
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn decimals_accept_scientific_notation() {
        assert_eq!(parse_decimal("1.5e3").unwrap(), Decimal::new(1500, 0));
        assert!(parse_decimal("1,5").is_err());
    }

    #[test]
    fn empty_batch_still_encodes_a_header() {
        let bytes = encode_records(&[]).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap().trim_end(),
            BATCH_COLUMNS.join(",")
        );
    }

    #[test]
    fn short_rows_decode_with_missing_cells() {
        let csv = format!("{}\nBTC,DAILY,2020-04-20T00:00:00Z,1\n", BATCH_COLUMNS.join(","));
        let records = decode_records(csv.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].open.as_deref(), Some("1"));
        assert_eq!(records[0].high, None);
        assert_eq!(records[0].volume_quote, None);
    }

    #[test]
    fn batch_hash_tracks_content() {
        let key = SeriesKey::new(Asset::Btc, IntervalKind::Daily);
        let w = ExtractionWindow::new(ts(20), ts(22)).unwrap();
        let a = LoadBatch::from_rows(key, w, &[row(20), row(21)], "a").unwrap();
        let b = LoadBatch::from_rows(key, w, &[row(20), row(21)], "b").unwrap();
        let c = LoadBatch::from_rows(key, w, &[row(20)], "c").unwrap();
        assert_eq!(a.meta.data_hash, b.meta.data_hash);
        assert_ne!(a.meta.data_hash, c.meta.data_hash);
        assert_eq!(a.meta.row_count, 2);
    }
}
