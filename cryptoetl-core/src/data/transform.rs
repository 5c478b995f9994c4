//! Normalization: raw provider records → canonical rows.
//!
//! Pipeline:
//! 1. Truncate timestamps to the interval's granularity
//! 2. Drop placeholder records (any price zero or negative, emitted before listing)
//! 3. Drop records that cannot be represented as decimals (NaN, infinite)
//! 4. Drop records outside the extraction window
//! 5. Stable sort ascending, de-duplicate on timestamp keeping the first
//!
//! Gaps are never filled; the validator reports them.

use super::provider::RawRecord;
use crate::domain::{CanonicalRow, ExtractionWindow, SeriesKey};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

/// Counts of records removed during normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub zero_price: usize,
    pub non_finite: usize,
    pub outside_window: usize,
    pub duplicate: usize,
}

impl DropCounts {
    pub fn total(&self) -> usize {
        self.zero_price + self.non_finite + self.outside_window + self.duplicate
    }
}

/// Result of normalization.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub rows: Vec<CanonicalRow>,
    pub dropped: DropCounts,
}

/// Normalize raw records for one series and window.
pub fn transform(key: SeriesKey, window: ExtractionWindow, raw: &[RawRecord]) -> TransformOutput {
    let window = window.truncated(key.interval);
    let mut dropped = DropCounts::default();
    let mut rows = Vec::with_capacity(raw.len());

    for record in raw {
        let prices = [record.open, record.high, record.low, record.close];
        if prices.iter().any(|p| *p <= 0.0) {
            dropped.zero_price += 1;
            continue;
        }

        let timestamp = key.interval.truncate(record.timestamp);
        if !window.contains(timestamp) {
            dropped.outside_window += 1;
            continue;
        }

        let values = (
            to_decimal(record.open),
            to_decimal(record.high),
            to_decimal(record.low),
            to_decimal(record.close),
            to_decimal(record.volume_quote),
        );
        let (Some(open), Some(high), Some(low), Some(close), Some(volume_quote)) = values else {
            dropped.non_finite += 1;
            continue;
        };

        rows.push(CanonicalRow {
            asset_symbol: key.asset,
            interval_kind: key.interval,
            timestamp,
            open,
            high,
            low,
            close,
            volume_quote,
        });
    }

    rows.sort_by_key(|r| r.timestamp);
    let before = rows.len();
    rows.dedup_by_key(|r| r.timestamp);
    dropped.duplicate = before - rows.len();

    if dropped.total() > 0 {
        tracing::debug!(
            key = %key,
            zero_price = dropped.zero_price,
            non_finite = dropped.non_finite,
            outside_window = dropped.outside_window,
            duplicate = dropped.duplicate,
            "dropped raw records"
        );
    }

    TransformOutput { rows, dropped }
}

fn to_decimal(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value).map(|d| d.normalize())
}
