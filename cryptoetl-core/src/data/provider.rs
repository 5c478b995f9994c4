//! Market-data provider trait and structured extraction errors.
//!
//! The MarketDataProvider trait abstracts over the remote API so the pipeline
//! can run against CryptoCompare in production and a canned provider in tests.

use crate::domain::{Asset, ExtractionWindow, IntervalKind, SeriesKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One raw observation as returned by a provider (before normalization).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume in units of the asset itself.
    pub volume_native: f64,
    /// Volume in the quote currency.
    pub volume_quote: f64,
}

/// Structured error types for extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,
}

impl ExtractError {
    /// Worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExtractError::RateLimited { .. } | ExtractError::NetworkFailure(_)
        )
    }
}

/// Result of a successful fetch for one series.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub key: SeriesKey,
    pub window: ExtractionWindow,
    /// Sorted ascending by timestamp.
    pub records: Vec<RawRecord>,
    pub pages: usize,
    pub source: String,
}

/// Trait for market-data providers.
pub trait MarketDataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch raw records for one asset/interval covering `window`.
    fn fetch(
        &self,
        asset: Asset,
        interval: IntervalKind,
        window: ExtractionWindow,
    ) -> Result<FetchResult, ExtractError>;

    /// Check if the provider is currently available (not rate-limited, not blocked).
    fn is_available(&self) -> bool;
}
