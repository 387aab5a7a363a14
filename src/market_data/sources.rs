// =============================================================================
// Live bar sources — yfinance, Alpaca, Alpha Vantage
// =============================================================================
//
// Each source implements the same narrow contract: fetch daily bars for a
// symbol over a lookback window. Errors are classified so the retry loop
// and the provider's fallback chain can distinguish "try again" from "move
// on to the next source":
//
//   Transient   — network/5xx/parse trouble; worth retrying with backoff.
//   RateLimited — the source told us to slow down; skip to the next source.
//   Permanent   — 4xx rejections, unknown symbols; retrying is pointless.
//
// Alpha Vantage additionally enforces a minimum interval between calls to
// honour its free-tier rate limit before the request is even sent.
// =============================================================================

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Bar, DataSource};
use crate::retry::Retryable;

/// HTTP timeout applied to every source request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    Transient,
    RateLimited,
    Permanent,
}

#[derive(Debug)]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::RateLimited,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Classify an HTTP status into an error.
    fn from_status(status: reqwest::StatusCode, body_hint: &str) -> Self {
        if status.as_u16() == 429 {
            Self::rate_limited(format!("HTTP 429: {body_hint}"))
        } else if status.is_server_error() {
            Self::transient(format!("HTTP {status}: {body_hint}"))
        } else {
            Self::permanent(format!("HTTP {status}: {body_hint}"))
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SourceError {}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        self.kind == SourceErrorKind::Transient
    }
}

// ---------------------------------------------------------------------------
// Source contract
// ---------------------------------------------------------------------------

/// A live daily-bar source. Implementations are transport-specific; the
/// provider only sees this contract.
#[async_trait]
pub trait BarSource: Send + Sync {
    fn id(&self) -> DataSource;

    /// Fetch daily bars covering roughly the trailing `lookback_days`
    /// calendar days. Returned bars may be unordered; the caller normalises.
    async fn fetch_daily(&self, symbol: &str, lookback_days: u32) -> Result<Vec<Bar>, SourceError>;
}

// ---------------------------------------------------------------------------
// yfinance (Yahoo Finance chart API)
// ---------------------------------------------------------------------------

pub struct YfinanceSource {
    base_url: String,
    client: reqwest::Client,
}

impl YfinanceSource {
    pub fn new() -> Self {
        Self::with_base_url("https://query1.finance.yahoo.com")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent("Mozilla/5.0 (compatible; meridian-trader)")
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

impl Default for YfinanceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BarSource for YfinanceSource {
    fn id(&self) -> DataSource {
        DataSource::Yfinance
    }

    async fn fetch_daily(&self, symbol: &str, lookback_days: u32) -> Result<Vec<Bar>, SourceError> {
        // The chart API accepts a coarse range; round up to a unit that
        // definitely covers the lookback.
        let range = match lookback_days {
            0..=28 => "1mo",
            29..=85 => "3mo",
            86..=175 => "6mo",
            176..=360 => "1y",
            _ => "2y",
        };
        let url = format!(
            "{}/v8/finance/chart/{}?interval=1d&range={}",
            self.base_url, symbol, range
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::transient(format!("yfinance request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SourceError::transient(format!("yfinance parse failed: {e}")))?;

        if !status.is_success() {
            return Err(SourceError::from_status(status, "yfinance chart"));
        }

        let result = body["chart"]["result"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| SourceError::permanent("yfinance: missing chart result"))?;

        let timestamps = result["timestamp"]
            .as_array()
            .ok_or_else(|| SourceError::transient("yfinance: missing timestamps"))?;
        let quote = &result["indicators"]["quote"][0];

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, ts) in timestamps.iter().enumerate() {
            let Some(epoch) = ts.as_i64() else { continue };
            let Some(date) = chrono::DateTime::from_timestamp(epoch, 0).map(|dt| dt.date_naive())
            else {
                continue;
            };
            // Nulls appear for halted sessions; skip incomplete rows.
            let fields = ["open", "high", "low", "close", "volume"]
                .map(|k| quote[k].get(i).and_then(serde_json::Value::as_f64));
            if let [Some(open), Some(high), Some(low), Some(close), Some(volume)] = fields {
                bars.push(Bar {
                    date,
                    open,
                    high,
                    low,
                    close,
                    volume,
                });
            }
        }

        debug!(symbol, rows = bars.len(), "yfinance bars fetched");
        Ok(bars)
    }
}

// ---------------------------------------------------------------------------
// Alpaca market data (v2 bars)
// ---------------------------------------------------------------------------

pub struct AlpacaSource {
    base_url: String,
    api_key: String,
    api_secret: String,
    client: reqwest::Client,
}

impl AlpacaSource {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self::with_base_url("https://data.alpaca.markets", api_key, api_secret)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

#[async_trait]
impl BarSource for AlpacaSource {
    fn id(&self) -> DataSource {
        DataSource::Alpaca
    }

    async fn fetch_daily(&self, symbol: &str, lookback_days: u32) -> Result<Vec<Bar>, SourceError> {
        let start = chrono::Utc::now() - chrono::Duration::days(i64::from(lookback_days) + 7);
        let url = format!(
            "{}/v2/stocks/{}/bars?timeframe=1Day&start={}&limit=1000&adjustment=split",
            self.base_url,
            symbol,
            start.format("%Y-%m-%d")
        );

        let resp = self
            .client
            .get(&url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
            .send()
            .await
            .map_err(|e| SourceError::transient(format!("alpaca request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SourceError::transient(format!("alpaca parse failed: {e}")))?;

        if !status.is_success() {
            return Err(SourceError::from_status(status, "alpaca bars"));
        }

        let raw = body["bars"]
            .as_array()
            .ok_or_else(|| SourceError::transient("alpaca: missing bars array"))?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(date) = entry["t"]
                .as_str()
                .and_then(|t| t.get(..10))
                .and_then(|d| d.parse::<NaiveDate>().ok())
            else {
                warn!(symbol, "skipping alpaca bar with malformed timestamp");
                continue;
            };
            let fields = ["o", "h", "l", "c", "v"].map(|k| entry[k].as_f64());
            if let [Some(open), Some(high), Some(low), Some(close), Some(volume)] = fields {
                bars.push(Bar {
                    date,
                    open,
                    high,
                    low,
                    close,
                    volume,
                });
            }
        }

        debug!(symbol, rows = bars.len(), "alpaca bars fetched");
        Ok(bars)
    }
}

impl std::fmt::Debug for AlpacaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaSource")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Alpha Vantage (rate-limited tertiary)
// ---------------------------------------------------------------------------

pub struct AlphaVantageSource {
    base_url: String,
    api_key: String,
    /// Minimum spacing between calls; the free tier is unforgiving.
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
    client: reqwest::Client,
}

impl AlphaVantageSource {
    pub fn new(api_key: impl Into<String>, min_interval: Duration) -> Self {
        Self::with_base_url("https://www.alphavantage.co", api_key, min_interval)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        min_interval: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            min_interval,
            last_call: Mutex::new(None),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    /// Sleep out the remainder of the minimum inter-call interval.
    async fn honour_min_interval(&self) {
        let wait = {
            let last = self.last_call.lock();
            last.map(|t| self.min_interval.saturating_sub(t.elapsed()))
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, "alpha_vantage pacing delay");
                tokio::time::sleep(wait).await;
            }
        }
        *self.last_call.lock() = Some(Instant::now());
    }
}

#[async_trait]
impl BarSource for AlphaVantageSource {
    fn id(&self) -> DataSource {
        DataSource::AlphaVantage
    }

    async fn fetch_daily(&self, symbol: &str, lookback_days: u32) -> Result<Vec<Bar>, SourceError> {
        self.honour_min_interval().await;

        let output_size = if lookback_days > 100 { "full" } else { "compact" };
        let url = format!(
            "{}/query?function=TIME_SERIES_DAILY&symbol={}&outputsize={}&apikey={}",
            self.base_url, symbol, output_size, self.api_key
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::transient(format!("alpha_vantage request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SourceError::transient(format!("alpha_vantage parse failed: {e}")))?;

        if !status.is_success() {
            return Err(SourceError::from_status(status, "alpha_vantage daily"));
        }

        // Alpha Vantage reports throttling as a 200 with a "Note" (or
        // "Information") body instead of an HTTP 429.
        for key in ["Note", "Information"] {
            if let Some(note) = body[key].as_str() {
                return Err(SourceError::rate_limited(format!("alpha_vantage: {note}")));
            }
        }
        if let Some(msg) = body["Error Message"].as_str() {
            return Err(SourceError::permanent(format!("alpha_vantage: {msg}")));
        }

        let series = body["Time Series (Daily)"]
            .as_object()
            .ok_or_else(|| SourceError::transient("alpha_vantage: missing time series"))?;

        let mut bars = Vec::with_capacity(series.len());
        for (date_str, row) in series {
            let Ok(date) = date_str.parse::<NaiveDate>() else {
                continue;
            };
            let field = |k: &str| {
                row[k]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .or_else(|| row[k].as_f64())
            };
            let fields = [
                field("1. open"),
                field("2. high"),
                field("3. low"),
                field("4. close"),
                field("5. volume"),
            ];
            if let [Some(open), Some(high), Some(low), Some(close), Some(volume)] = fields {
                bars.push(Bar {
                    date,
                    open,
                    high,
                    low,
                    close,
                    volume,
                });
            }
        }

        debug!(symbol, rows = bars.len(), "alpha_vantage bars fetched");
        Ok(bars)
    }
}

impl std::fmt::Debug for AlphaVantageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlphaVantageSource")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let rate = SourceError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "x");
        assert_eq!(rate.kind, SourceErrorKind::RateLimited);

        let server = SourceError::from_status(reqwest::StatusCode::BAD_GATEWAY, "x");
        assert_eq!(server.kind, SourceErrorKind::Transient);

        let client = SourceError::from_status(reqwest::StatusCode::FORBIDDEN, "x");
        assert_eq!(client.kind, SourceErrorKind::Permanent);
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(SourceError::transient("x").is_retryable());
        assert!(!SourceError::rate_limited("x").is_retryable());
        assert!(!SourceError::permanent("x").is_retryable());
    }

    #[tokio::test]
    async fn alpha_vantage_pacing_enforces_interval() {
        let source =
            AlphaVantageSource::new("demo", Duration::from_millis(50));
        let t0 = Instant::now();
        source.honour_min_interval().await;
        source.honour_min_interval().await;
        assert!(
            t0.elapsed() >= Duration::from_millis(50),
            "second call should wait out the interval"
        );
    }
}
