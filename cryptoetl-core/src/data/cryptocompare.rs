//! CryptoCompare data provider.
//!
//! Fetches daily or hourly OHLCV points from the `histoday` / `histohour`
//! endpoints. The API returns at most `limit` points per call ending at `toTs`,
//! so a window is walked backwards page by page. Handles rate limiting, retries
//! with exponential backoff, response parsing, and the circuit breaker.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{ExtractError, FetchResult, MarketDataProvider, RawRecord};
use crate::domain::{Asset, ExtractionWindow, IntervalKind, SeriesKey};
use chrono::DateTime;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://min-api.cryptocompare.com";

/// Connection and paging settings for the CryptoCompare client.
#[derive(Debug, Clone)]
pub struct CryptoCompareConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub quote_currency: String,
    pub page_limit: u32,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for CryptoCompareConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            quote_currency: "USD".to_string(),
            page_limit: 2000,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level response envelope. `Data` is only shaped like a page on success.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Response")]
    response: String,
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "Data", default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct HistoPage {
    #[serde(rename = "Data")]
    points: Vec<HistoPoint>,
}

#[derive(Debug, Deserialize)]
struct HistoPoint {
    time: i64,
    high: f64,
    low: f64,
    open: f64,
    close: f64,
    volumefrom: f64,
    volumeto: f64,
}

/// CryptoCompare data provider.
pub struct CryptoCompareProvider {
    client: reqwest::blocking::Client,
    config: CryptoCompareConfig,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl CryptoCompareProvider {
    pub fn new(
        config: CryptoCompareConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, ExtractError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("cryptoetl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExtractError::NetworkFailure(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            circuit_breaker,
        })
    }

    fn endpoint_url(&self, interval: IntervalKind) -> String {
        let path = match interval {
            IntervalKind::Daily => "histoday",
            IntervalKind::Hourly => "histohour",
        };
        format!("{}/data/v2/{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// One page ending at `to_ts`, with retry and circuit breaker logic.
    fn fetch_page_with_retry(
        &self,
        asset: Asset,
        interval: IntervalKind,
        to_ts: i64,
    ) -> Result<Vec<RawRecord>, ExtractError> {
        let url = self.endpoint_url(interval);
        let limit = self.config.page_limit.to_string();
        let to_ts_param = to_ts.to_string();
        let mut params = vec![
            ("fsym", asset.symbol()),
            ("tsym", self.config.quote_currency.as_str()),
            ("limit", limit.as_str()),
            ("toTs", to_ts_param.as_str()),
        ];
        if let Some(key) = self.config.api_key.as_deref() {
            params.push(("api_key", key));
        }

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = retry_delay(self.config.base_delay, attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying page");
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(ExtractError::CircuitBreakerTripped);
            }

            let resp = match self.client.get(&url).query(&params).send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(ExtractError::NetworkFailure(e.to_string()));
                    continue;
                }
                Err(e) => return Err(ExtractError::NetworkFailure(e.to_string())),
            };

            let status = resp.status();

            if status == reqwest::StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(ExtractError::CircuitBreakerTripped);
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.circuit_breaker.record_failure();
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                last_error = Some(ExtractError::RateLimited {
                    retry_after_secs: retry_after,
                });
                continue;
            }

            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ExtractError::Unauthorized(format!(
                    "HTTP 401 from {} for {asset}",
                    self.name()
                )));
            }

            if !status.is_success() {
                self.circuit_breaker.record_failure();
                last_error = Some(ExtractError::NetworkFailure(format!("HTTP {status} for {asset}")));
                continue;
            }

            let body = resp
                .text()
                .map_err(|e| ExtractError::NetworkFailure(format!("reading body: {e}")))?;

            match parse_page(&body) {
                Ok(records) => {
                    self.circuit_breaker.record_success();
                    return Ok(records);
                }
                Err(e @ ExtractError::RateLimited { .. }) => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| ExtractError::NetworkFailure("max retries exceeded".into())))
    }
}

impl MarketDataProvider for CryptoCompareProvider {
    fn name(&self) -> &str {
        "cryptocompare"
    }

    fn fetch(
        &self,
        asset: Asset,
        interval: IntervalKind,
        window: ExtractionWindow,
    ) -> Result<FetchResult, ExtractError> {
        let span = tracing::info_span!("extract", asset = %asset, interval = %interval);
        let _enter = span.enter();

        let (records, pages) = paginate(interval, window, |to_ts| {
            self.fetch_page_with_retry(asset, interval, to_ts)
        })?;

        tracing::info!(records = records.len(), pages, "fetched");
        Ok(FetchResult {
            key: SeriesKey::new(asset, interval),
            window,
            records,
            pages,
            source: self.name().to_string(),
        })
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

/// Longest sleep between two attempts.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff before retry `attempt` (1-based), capped at
/// [`MAX_RETRY_DELAY`].
pub(crate) fn retry_delay(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
}

/// Walk backwards from `window.end` until a page reaches `window.start` or
/// comes back empty. Returns records sorted ascending and unique by timestamp,
/// plus the number of pages requested.
pub(crate) fn paginate<F>(
    interval: IntervalKind,
    window: ExtractionWindow,
    mut fetch_page: F,
) -> Result<(Vec<RawRecord>, usize), ExtractError>
where
    F: FnMut(i64) -> Result<Vec<RawRecord>, ExtractError>,
{
    let window = window.truncated(interval);
    let start = window.start().timestamp();
    let mut to_ts = window.end().timestamp();
    let mut records = Vec::new();
    let mut pages = 0;

    loop {
        let page = fetch_page(to_ts)?;
        pages += 1;

        let Some(earliest) = page.iter().map(|r| r.timestamp.timestamp()).min() else {
            break;
        };
        records.extend(page);

        if earliest <= start {
            break;
        }
        let next = earliest - interval.seconds();
        // The API ignored toTs; stop rather than loop forever.
        if next >= to_ts {
            break;
        }
        to_ts = next;
    }

    records.sort_by_key(|r| r.timestamp);
    records.dedup_by_key(|r| r.timestamp);
    Ok((records, pages))
}

/// Parse one response body into raw records.
fn parse_page(body: &str) -> Result<Vec<RawRecord>, ExtractError> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| ExtractError::ResponseFormatChanged(format!("unexpected envelope: {e}")))?;

    if !envelope.response.eq_ignore_ascii_case("success") {
        return Err(classify_api_error(envelope.message.unwrap_or_default()));
    }

    let page: HistoPage = serde_json::from_value(envelope.data)
        .map_err(|e| ExtractError::ResponseFormatChanged(format!("unexpected page shape: {e}")))?;

    page.points
        .into_iter()
        .map(|p| {
            let timestamp = DateTime::from_timestamp(p.time, 0).ok_or_else(|| {
                ExtractError::ResponseFormatChanged(format!("invalid timestamp: {}", p.time))
            })?;
            Ok(RawRecord {
                timestamp,
                open: p.open,
                high: p.high,
                low: p.low,
                close: p.close,
                volume_native: p.volumefrom,
                volume_quote: p.volumeto,
            })
        })
        .collect()
}

/// CryptoCompare reports most failures as HTTP 200 with `Response: "Error"`.
fn classify_api_error(message: String) -> ExtractError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("rate limit") {
        ExtractError::RateLimited {
            retry_after_secs: 60,
        }
    } else if lower.contains("api key") || lower.contains("api_key") {
        ExtractError::Unauthorized(message)
    } else {
        ExtractError::ResponseFormatChanged(format!("API error: {message}"))
    }
}
