//! Tracked assets, interval kinds, and the series key that pairs them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The fixed set of tracked assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Asset {
    #[serde(rename = "BTC", alias = "btc")]
    Btc,
    #[serde(rename = "ETH", alias = "eth")]
    Eth,
    #[serde(rename = "SOL", alias = "sol")]
    Sol,
}

impl Asset {
    pub const ALL: [Asset; 3] = [Asset::Btc, Asset::Eth, Asset::Sol];

    /// Ticker symbol as sent to the market-data API and stored in the target table.
    pub fn symbol(self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Sol => "SOL",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Asset {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            "SOL" => Ok(Asset::Sol),
            _ => Err(ParseKeyError::UnknownAsset(s.to_string())),
        }
    }
}

/// Bucket granularity of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IntervalKind {
    #[serde(rename = "DAILY", alias = "daily")]
    Daily,
    #[serde(rename = "HOURLY", alias = "hourly")]
    Hourly,
}

impl IntervalKind {
    pub const ALL: [IntervalKind; 2] = [IntervalKind::Daily, IntervalKind::Hourly];

    pub fn as_str(self) -> &'static str {
        match self {
            IntervalKind::Daily => "DAILY",
            IntervalKind::Hourly => "HOURLY",
        }
    }

    /// Bucket width in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            IntervalKind::Daily => 86_400,
            IntervalKind::Hourly => 3_600,
        }
    }

    pub fn granularity(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Floor a UTC instant to the start of its bucket.
    pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let floored = secs - secs.rem_euclid(self.seconds());
        DateTime::from_timestamp(floored, 0).unwrap_or(ts)
    }

    /// True when `ts` sits exactly on a bucket boundary.
    pub fn is_aligned(self, ts: DateTime<Utc>) -> bool {
        ts.timestamp_subsec_nanos() == 0 && ts.timestamp().rem_euclid(self.seconds()) == 0
    }

    /// Number of whole buckets from `from` to `to`.
    pub fn steps_between(self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        (to - from).num_seconds() / self.seconds()
    }
}

impl fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntervalKind {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" | "1d" | "d" => Ok(IntervalKind::Daily),
            "hourly" | "hour" | "1h" | "h" => Ok(IntervalKind::Hourly),
            _ => Err(ParseKeyError::UnknownInterval(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseKeyError {
    #[error("unknown asset symbol '{0}' (expected BTC, ETH or SOL)")]
    UnknownAsset(String),

    #[error("unknown interval '{0}' (expected daily or hourly)")]
    UnknownInterval(String),
}

/// One (asset, interval) series: the unit of locking, backup, and CLI invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub asset: Asset,
    pub interval: IntervalKind,
}

impl SeriesKey {
    pub fn new(asset: Asset, interval: IntervalKind) -> Self {
        Self { asset, interval }
    }

    /// Every combination of the given assets and intervals, asset-major.
    pub fn cross(assets: &[Asset], intervals: &[IntervalKind]) -> Vec<SeriesKey> {
        assets
            .iter()
            .flat_map(|&asset| intervals.iter().map(move |&interval| SeriesKey::new(asset, interval)))
            .collect()
    }

    /// `BTC_DAILY`, used in file names.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.asset, self.interval)
    }

    /// Stable 64-bit id for store-level advisory locks.
    pub fn lock_id(&self) -> i64 {
        let asset = match self.asset {
            Asset::Btc => 1,
            Asset::Eth => 2,
            Asset::Sol => 3,
        };
        let interval = match self.interval {
            IntervalKind::Daily => 1,
            IntervalKind::Hourly => 2,
        };
        0x4554_4c00_0000_0000 | (asset << 8) | interval
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.asset, self.interval)
    }
}
