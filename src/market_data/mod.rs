// =============================================================================
// Market Data — daily OHLCV bars and the fetch-result model
// =============================================================================
//
// A `BarSeries` is the unit of market data consumed by the rest of the
// engine: a time-ordered, date-unique sequence of daily bars for one symbol.
// `MarketDataResult` wraps a series together with the full story of how it
// was obtained (which source served it, every attempt made along the way,
// and how stale a cache serve was).
// =============================================================================

pub mod cache;
pub mod health_log;
pub mod provider;
pub mod sources;

pub use provider::MarketDataProvider;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bar / BarSeries
// ---------------------------------------------------------------------------

/// One daily OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Time-ordered, date-unique sequence of daily bars for one symbol.
///
/// Invariant: dates are strictly increasing. Construction and merging
/// enforce this; bars with duplicate dates are deduplicated with the most
/// recently supplied bar winning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSeries {
    symbol: String,
    bars: Vec<Bar>,
}

impl BarSeries {
    /// Build a series from unordered bars: sorts by date and deduplicates,
    /// keeping the last bar supplied for any duplicated date.
    pub fn from_bars(symbol: impl Into<String>, mut bars: Vec<Bar>) -> Self {
        // Stable sort keeps later-supplied duplicates after earlier ones, so
        // the dedup below retains the most recently supplied bar.
        bars.sort_by_key(|b| b.date);
        let mut deduped: Vec<Bar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match deduped.last_mut() {
                Some(last) if last.date == bar.date => *last = bar,
                _ => deduped.push(bar),
            }
        }
        Self {
            symbol: symbol.into(),
            bars: deduped,
        }
    }

    pub fn empty(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bars: Vec::new(),
        }
    }

    /// Merge another batch of bars into this series, deduplicating by date.
    /// Incoming bars win over existing bars on the same date.
    pub fn merge(&mut self, incoming: Vec<Bar>) {
        let mut all = std::mem::take(&mut self.bars);
        all.extend(incoming);
        *self = Self::from_bars(std::mem::take(&mut self.symbol), all);
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// Closing prices, oldest first.
    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    /// The trailing `n` bars (or all of them when fewer exist).
    pub fn tail(&self, n: usize) -> &[Bar] {
        let start = self.bars.len().saturating_sub(n);
        &self.bars[start..]
    }
}

// ---------------------------------------------------------------------------
// Sources and attempts
// ---------------------------------------------------------------------------

/// Where a series (or a fetch attempt) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Yfinance,
    Alpaca,
    AlphaVantage,
    Cache,
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yfinance => write!(f, "yfinance"),
            Self::Alpaca => write!(f, "alpaca"),
            Self::AlphaVantage => write!(f, "alpha_vantage"),
            Self::Cache => write!(f, "cache"),
        }
    }
}

/// Record of a single fetch attempt, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchAttempt {
    pub source: DataSource,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub rows: usize,
    pub latency_ms: u64,
}

/// The outcome of a `get_daily_bars` call.
///
/// Invariant: `source` equals the source of the last successful attempt, or
/// `Cache` when only the cache produced data. `cache_age_hours` is populated
/// on every cache serve so consumers can apply their own staleness policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataResult {
    pub series: BarSeries,
    pub source: DataSource,
    pub attempts: Vec<FetchAttempt>,
    pub total_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_hours: Option<f64>,
}

impl MarketDataResult {
    /// Whether the data is older than the refresh schedule allows. Consumers
    /// MAY decline to trade on stale data; the provider does not enforce it.
    pub fn is_stale(&self, ttl_hours: f64) -> bool {
        self.source == DataSource::Cache
            && self.cache_age_hours.map_or(false, |age| age > ttl_hours)
    }
}
