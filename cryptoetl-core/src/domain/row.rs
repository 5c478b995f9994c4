//! Canonical row: one time-bucketed observation for one asset.

use super::series::{Asset, IntervalKind, SeriesKey};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The (asset, interval, timestamp) tuple that uniquely identifies a stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub asset: Asset,
    pub interval: IntervalKind,
    pub timestamp: DateTime<Utc>,
}

impl NaturalKey {
    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.asset, self.interval)
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.asset,
            self.interval,
            self.timestamp.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// A normalized row as persisted in the target store.
///
/// Prices are exact decimals in the quote currency; `volume_quote` is the
/// traded volume expressed in the quote currency (USD).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub asset_symbol: Asset,
    pub interval_kind: IntervalKind,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume_quote: Decimal,
}

impl CanonicalRow {
    pub fn key(&self) -> NaturalKey {
        NaturalKey {
            asset: self.asset_symbol,
            interval: self.interval_kind,
            timestamp: self.timestamp,
        }
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.asset_symbol, self.interval_kind)
    }

    /// Compare the value columns only. Decimal equality ignores scale, so
    /// `6875.20` and `6875.2` are the same price.
    pub fn same_values(&self, other: &CanonicalRow) -> bool {
        self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume_quote == other.volume_quote
    }

    /// True when `low <= open, close <= high`.
    pub fn ohlc_consistent(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
    }
}
