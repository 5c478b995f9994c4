//! Batch validation.
//!
//! `validate` inspects a LoadBatch and returns every finding, never stopping at
//! the first. `check` consumes the batch and, when no finding is fatal, yields
//! an [`EligibleBatch`] of typed rows, the only input the classifier and the
//! commit accept.
//!
//! Passes, in order:
//! 1. Completeness: every cell present and parsable; asset, interval, and
//!    window agree with the batch metadata
//! 2. Key uniqueness within the batch
//! 3. Value domain: prices > 0, volume >= 0, timestamp on a bucket boundary
//!    (fatal); OHLC range consistency (warning)
//! 4. Temporal continuity: strictly increasing (fatal), gaps between rows and
//!    at either edge of the window (warning)

use crate::domain::batch::{parse_decimal, parse_timestamp};
use crate::domain::{
    Asset, BatchMeta, BatchRecord, CanonicalRow, ExtractionWindow, IntervalKind, LoadBatch, NaturalKey,
    SeriesKey,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Fatal,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    RowCountMismatch,
    MissingField,
    Unparsable,
    AssetMismatch,
    IntervalMismatch,
    OutsideWindow,
    DuplicateKey,
    NonPositivePrice,
    NegativeVolume,
    Misaligned,
    OhlcInconsistent,
    OutOfOrder,
    Gap,
}

impl FindingKind {
    pub fn severity(self) -> Severity {
        match self {
            FindingKind::OhlcInconsistent | FindingKind::Gap => Severity::Warning,
            _ => Severity::Fatal,
        }
    }
}

/// One problem found in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub severity: Severity,
    pub kind: FindingKind,
    /// Zero-based record index, for row-level findings.
    pub row: Option<usize>,
    /// The row's natural key, when it could be determined.
    pub key: Option<NaturalKey>,
    pub message: String,
}

impl ValidationFinding {
    fn new(kind: FindingKind, row: Option<usize>, key: Option<NaturalKey>, message: String) -> Self {
        Self {
            severity: kind.severity(),
            kind,
            row,
            key,
            message,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

impl fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Fatal => "FATAL",
            Severity::Warning => "WARNING",
        };
        write!(f, "[{severity}]")?;
        if let Some(row) = self.row {
            write!(f, " row {row}")?;
        }
        if let Some(key) = &self.key {
            write!(f, " ({key})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// The batch had at least one fatal finding.
#[derive(Debug, Clone, Error)]
#[error("batch rejected: {fatal_count} fatal finding(s), first: {first}")]
pub struct ValidationError {
    pub fatal_count: usize,
    pub first: String,
    pub findings: Vec<ValidationFinding>,
}

/// A batch with zero fatal findings, as typed rows in file order.
#[derive(Debug, Clone)]
pub struct EligibleBatch {
    key: SeriesKey,
    window: ExtractionWindow,
    rows: Vec<CanonicalRow>,
    warnings: Vec<ValidationFinding>,
    data_hash: String,
    source: String,
}

impl EligibleBatch {
    pub fn key(&self) -> SeriesKey {
        self.key
    }

    pub fn window(&self) -> ExtractionWindow {
        self.window
    }

    pub fn rows(&self) -> &[CanonicalRow] {
        &self.rows
    }

    pub fn warnings(&self) -> &[ValidationFinding] {
        &self.warnings
    }

    pub fn data_hash(&self) -> &str {
        &self.data_hash
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Inspect a batch without consuming it.
pub fn validate(batch: &LoadBatch) -> Vec<ValidationFinding> {
    inspect(batch).0
}

/// Consume a batch, producing typed rows if nothing fatal was found.
pub fn check(batch: LoadBatch) -> Result<EligibleBatch, ValidationError> {
    let (findings, typed) = inspect(&batch);

    let fatal: Vec<&ValidationFinding> = findings.iter().filter(|f| f.is_fatal()).collect();
    if let Some(first) = fatal.first() {
        return Err(ValidationError {
            fatal_count: fatal.len(),
            first: first.to_string(),
            findings,
        });
    }

    Ok(EligibleBatch {
        key: batch.key(),
        window: batch.meta.window,
        rows: typed.into_iter().map(|(_, row)| row).collect(),
        warnings: findings,
        data_hash: batch.meta.data_hash,
        source: batch.source,
    })
}

/// Every finding, plus the rows that parsed (with their record index).
fn inspect(batch: &LoadBatch) -> (Vec<ValidationFinding>, Vec<(usize, CanonicalRow)>) {
    let meta = &batch.meta;
    let mut findings = Vec::new();

    if meta.row_count != batch.records.len() {
        findings.push(ValidationFinding::new(
            FindingKind::RowCountMismatch,
            None,
            None,
            format!(
                "metadata declares {} rows, file holds {}",
                meta.row_count,
                batch.records.len()
            ),
        ));
    }

    // 1. completeness
    let mut typed = Vec::with_capacity(batch.records.len());
    for (idx, record) in batch.records.iter().enumerate() {
        if let Some(row) = complete_row(idx, record, meta, &mut findings) {
            typed.push((idx, row));
        }
    }

    // 2. key uniqueness
    let mut first_seen: HashMap<NaturalKey, usize> = HashMap::with_capacity(typed.len());
    for (idx, row) in &typed {
        let key = row.key();
        if let Some(first) = first_seen.get(&key) {
            findings.push(ValidationFinding::new(
                FindingKind::DuplicateKey,
                Some(*idx),
                Some(key),
                format!("duplicate natural key, first seen at row {first}"),
            ));
        } else {
            first_seen.insert(key, *idx);
        }
    }

    // 3. value domain
    for (idx, row) in &typed {
        value_domain(*idx, row, &mut findings);
    }

    // 4. temporal continuity
    continuity(meta.interval, &typed, &mut findings);
    window_edges(meta, batch.records.is_empty(), &typed, &mut findings);

    (findings, typed)
}

fn complete_row(
    idx: usize,
    record: &BatchRecord,
    meta: &BatchMeta,
    findings: &mut Vec<ValidationFinding>,
) -> Option<CanonicalRow> {
    let mut row_findings = Vec::new();
    let mut cell = |column: &'static str, raw: Option<&str>| -> Option<String> {
        match raw.map(str::trim) {
            Some(v) if !v.is_empty() => Some(v.to_string()),
            _ => {
                row_findings.push((FindingKind::MissingField, format!("missing required field '{column}'")));
                None
            }
        }
    };

    let cells = record.cells();
    let raw: Vec<Option<String>> = cells.iter().map(|(col, v)| cell(*col, *v)).collect();

    let mut parse = |column: &'static str, value: &Option<String>| -> Option<Decimal> {
        let v = value.as_deref()?;
        match parse_decimal(v) {
            Ok(d) => Some(d),
            Err(reason) => {
                row_findings.push((
                    FindingKind::Unparsable,
                    format!("field '{column}' is not parsable: {reason}"),
                ));
                None
            }
        }
    };
    let open = parse("open", &raw[3]);
    let high = parse("high", &raw[4]);
    let low = parse("low", &raw[5]);
    let close = parse("close", &raw[6]);
    let volume_quote = parse("volume_quote", &raw[7]);

    let asset = raw[0].as_deref().and_then(|v| match Asset::from_str(v) {
        Ok(a) => Some(a),
        Err(e) => {
            row_findings.push((FindingKind::Unparsable, format!("field 'asset_symbol' is not parsable: {e}")));
            None
        }
    });
    let interval = raw[1].as_deref().and_then(|v| match IntervalKind::from_str(v) {
        Ok(i) => Some(i),
        Err(e) => {
            row_findings.push((FindingKind::Unparsable, format!("field 'interval_kind' is not parsable: {e}")));
            None
        }
    });
    let timestamp = raw[2].as_deref().and_then(|v| match parse_timestamp(v) {
        Ok(t) => Some(t),
        Err(reason) => {
            row_findings.push((FindingKind::Unparsable, format!("field 'timestamp' is not parsable: {reason}")));
            None
        }
    });

    let key = match (asset, interval, timestamp) {
        (Some(asset), Some(interval), Some(timestamp)) => Some(NaturalKey {
            asset,
            interval,
            timestamp,
        }),
        _ => None,
    };

    if let Some(k) = &key {
        if k.asset != meta.asset {
            row_findings.push((
                FindingKind::AssetMismatch,
                format!("asset {} does not match batch asset {}", k.asset, meta.asset),
            ));
        }
        if k.interval != meta.interval {
            row_findings.push((
                FindingKind::IntervalMismatch,
                format!("interval {} does not match batch interval {}", k.interval, meta.interval),
            ));
        }
        if !meta.window.contains(k.timestamp) {
            row_findings.push((
                FindingKind::OutsideWindow,
                format!("timestamp outside extraction window {}", meta.window),
            ));
        }
    }

    let complete = row_findings.is_empty();
    findings.extend(
        row_findings
            .into_iter()
            .map(|(kind, message)| ValidationFinding::new(kind, Some(idx), key, message)),
    );

    match (key, open, high, low, close, volume_quote) {
        (Some(k), Some(open), Some(high), Some(low), Some(close), Some(volume_quote)) if complete => {
            Some(CanonicalRow {
                asset_symbol: k.asset,
                interval_kind: k.interval,
                timestamp: k.timestamp,
                open,
                high,
                low,
                close,
                volume_quote,
            })
        }
        _ => None,
    }
}

fn value_domain(idx: usize, row: &CanonicalRow, findings: &mut Vec<ValidationFinding>) {
    let key = Some(row.key());

    let non_positive: Vec<&str> = [
        ("open", row.open),
        ("high", row.high),
        ("low", row.low),
        ("close", row.close),
    ]
    .into_iter()
    .filter(|(_, v)| *v <= Decimal::ZERO)
    .map(|(name, _)| name)
    .collect();
    if !non_positive.is_empty() {
        findings.push(ValidationFinding::new(
            FindingKind::NonPositivePrice,
            Some(idx),
            key,
            format!("price must be positive: {}", non_positive.join(", ")),
        ));
    }

    if row.volume_quote < Decimal::ZERO {
        findings.push(ValidationFinding::new(
            FindingKind::NegativeVolume,
            Some(idx),
            key,
            format!("volume_quote must be non-negative, got {}", row.volume_quote),
        ));
    }

    if !row.interval_kind.is_aligned(row.timestamp) {
        findings.push(ValidationFinding::new(
            FindingKind::Misaligned,
            Some(idx),
            key,
            format!("timestamp is not aligned to {} granularity", row.interval_kind),
        ));
    }

    if !row.ohlc_consistent() {
        findings.push(ValidationFinding::new(
            FindingKind::OhlcInconsistent,
            Some(idx),
            key,
            format!(
                "OHLC out of range: open {} high {} low {} close {}",
                row.open, row.high, row.low, row.close
            ),
        ));
    }
}

fn continuity(
    interval: IntervalKind,
    typed: &[(usize, CanonicalRow)],
    findings: &mut Vec<ValidationFinding>,
) {
    let step = interval.seconds();
    for pair in typed.windows(2) {
        let (_, prev) = &pair[0];
        let (idx, row) = &pair[1];
        let delta = (row.timestamp - prev.timestamp).num_seconds();

        if delta < 0 {
            findings.push(ValidationFinding::new(
                FindingKind::OutOfOrder,
                Some(*idx),
                Some(row.key()),
                format!(
                    "timestamp goes backwards from {}",
                    prev.timestamp.format("%Y-%m-%dT%H:%M:%SZ")
                ),
            ));
        } else if delta > step {
            let missing = delta / step - if delta % step == 0 { 1 } else { 0 };
            findings.push(ValidationFinding::new(
                FindingKind::Gap,
                Some(*idx),
                Some(row.key()),
                format!(
                    "{missing} missing {} bucket(s) after {}",
                    interval,
                    prev.timestamp.format("%Y-%m-%dT%H:%M:%SZ")
                ),
            ));
        }
    }
}

/// Buckets missing between the window bounds and the first or last row.
fn window_edges(
    meta: &BatchMeta,
    no_records: bool,
    typed: &[(usize, CanonicalRow)],
    findings: &mut Vec<ValidationFinding>,
) {
    let interval = meta.interval;
    let expected = meta.window.expected_rows(interval);
    if expected == 0 {
        return;
    }
    if no_records {
        findings.push(ValidationFinding::new(
            FindingKind::Gap,
            None,
            None,
            format!(
                "batch is empty; window {} expects {expected} {interval} bucket(s)",
                meta.window
            ),
        ));
        return;
    }

    let in_window = || typed.iter().filter(|(_, r)| meta.window.contains(r.timestamp));
    let (Some((first_idx, first)), Some((last_idx, last))) = (
        in_window().min_by_key(|(_, r)| r.timestamp),
        in_window().max_by_key(|(_, r)| r.timestamp),
    ) else {
        return;
    };

    let leading = interval.steps_between(meta.window.first_bucket(interval), first.timestamp);
    if leading > 0 {
        findings.push(ValidationFinding::new(
            FindingKind::Gap,
            Some(*first_idx),
            Some(first.key()),
            format!(
                "{leading} missing {interval} bucket(s) at window start, before {}",
                first.timestamp.format("%Y-%m-%dT%H:%M:%SZ")
            ),
        ));
    }

    let trailing = interval.steps_between(last.timestamp, meta.window.last_bucket(interval));
    if trailing > 0 {
        findings.push(ValidationFinding::new(
            FindingKind::Gap,
            Some(*last_idx),
            Some(last.key()),
            format!(
                "{trailing} missing {interval} bucket(s) at window end, after {}",
                last.timestamp.format("%Y-%m-%dT%H:%M:%SZ")
            ),
        ));
    }
}
