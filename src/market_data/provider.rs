// =============================================================================
// Market Data Provider — self-healing ordered fallback chain
// =============================================================================
//
// Chain, in order: in-memory cache → live sources in configured priority
// (yfinance, alpaca, alpha_vantage by default) → disk cache (stale serves
// permitted, age reported). Each live source gets its own retry budget and
// backoff schedule; a rate-limit signal abandons that source immediately
// and moves down the chain.
//
// The provider never returns a partially filled series: a result either
// carries at least `min_rows` bars or the call fails with DataUnavailable.
// Every attempt — success or failure — lands in the result's attempt list
// and in the persistent health log.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use super::cache::BarCache;
use super::health_log::{HealthLog, HealthRecord};
use super::sources::{BarSource, SourceErrorKind};
use super::{BarSeries, DataSource, FetchAttempt, MarketDataResult};
use crate::errors::EngineError;
use crate::retry::RetryPolicy;

/// Fraction of the lookback that must be covered by actual bars; the gap
/// tolerates weekends, holidays, and halted sessions.
const MIN_ROWS_FRACTION: f64 = 0.6;

/// One live source plus its retry schedule.
pub struct SourceSlot {
    pub source: Arc<dyn BarSource>,
    pub retry: RetryPolicy,
}

pub struct MarketDataProvider {
    sources: Vec<SourceSlot>,
    cache: BarCache,
    health_log: HealthLog,
}

impl MarketDataProvider {
    pub fn new(sources: Vec<SourceSlot>, cache: BarCache, health_log: HealthLog) -> Self {
        Self {
            sources,
            cache,
            health_log,
        }
    }

    /// Minimum acceptable row count for a lookback window.
    pub fn min_rows(lookback_days: u32) -> usize {
        (f64::from(lookback_days) * MIN_ROWS_FRACTION).ceil() as usize
    }

    /// Fetch daily bars for `symbol` covering `lookback_days`, walking the
    /// fallback chain. Deadline, when given, bounds retry sleeps.
    pub async fn get_daily_bars(
        &self,
        symbol: &str,
        lookback_days: u32,
        deadline: Option<Instant>,
    ) -> Result<MarketDataResult, EngineError> {
        let started = Instant::now();
        let min_rows = Self::min_rows(lookback_days);
        let mut attempts: Vec<FetchAttempt> = Vec::new();

        // ── 1. In-memory cache (fresh only) ─────────────────────────────
        if let Some((series, age_hours)) = self.cache.memory_get(symbol, min_rows) {
            let result = MarketDataResult {
                series,
                source: DataSource::Cache,
                attempts,
                total_latency_ms: started.elapsed().as_millis() as u64,
                cache_age_hours: Some(age_hours),
            };
            self.log_health(symbol, &result, true);
            return Ok(result);
        }

        // ── 2. Live sources in priority order ───────────────────────────
        for slot in &self.sources {
            let source_id = slot.source.id();
            let mut give_up_source = false;

            for attempt_no in 0..=slot.retry.max_retries {
                let attempt_started = Instant::now();
                let outcome = slot.source.fetch_daily(symbol, lookback_days).await;
                let latency_ms = attempt_started.elapsed().as_millis() as u64;

                match outcome {
                    Ok(bars) => {
                        let series = BarSeries::from_bars(symbol, bars);
                        // Trim to the lookback window; sources may over-fetch.
                        let series =
                            BarSeries::from_bars(symbol, series.tail(lookback_days as usize).to_vec());
                        let rows = series.len();

                        if rows >= min_rows {
                            attempts.push(FetchAttempt {
                                source: source_id,
                                success: true,
                                error: None,
                                rows,
                                latency_ms,
                            });
                            self.cache.store(&series);
                            let result = MarketDataResult {
                                series,
                                source: source_id,
                                attempts,
                                total_latency_ms: started.elapsed().as_millis() as u64,
                                cache_age_hours: None,
                            };
                            info!(
                                symbol,
                                source = %source_id,
                                rows,
                                attempts = result.attempts.len(),
                                "market data fetched"
                            );
                            self.log_health(symbol, &result, true);
                            return Ok(result);
                        }

                        // A short series is a failed attempt; never return it.
                        attempts.push(FetchAttempt {
                            source: source_id,
                            success: false,
                            error: Some(format!("insufficient rows: {rows} < {min_rows}")),
                            rows,
                            latency_ms,
                        });
                        give_up_source = true;
                    }
                    Err(err) => {
                        attempts.push(FetchAttempt {
                            source: source_id,
                            success: false,
                            error: Some(err.to_string()),
                            rows: 0,
                            latency_ms,
                        });
                        match err.kind {
                            SourceErrorKind::RateLimited => {
                                warn!(symbol, source = %source_id, "rate limited — moving to next source");
                                give_up_source = true;
                            }
                            SourceErrorKind::Permanent => give_up_source = true,
                            SourceErrorKind::Transient => {}
                        }
                    }
                }

                if give_up_source || attempt_no == slot.retry.max_retries {
                    break;
                }

                let delay = slot.retry.delay_for(attempt_no);
                if let Some(deadline) = deadline {
                    if Instant::now() + delay >= deadline {
                        warn!(symbol, source = %source_id, "deadline reached — abandoning source");
                        break;
                    }
                }
                tokio::time::sleep(delay).await;
            }
        }

        // ── 3. Disk cache (stale permitted) ─────────────────────────────
        if let Some((series, age_hours)) = self.cache.disk_get(symbol, min_rows) {
            warn!(
                symbol,
                cache_age_hours = format!("{age_hours:.1}"),
                "all live sources failed — serving disk cache"
            );
            let result = MarketDataResult {
                series,
                source: DataSource::Cache,
                attempts,
                total_latency_ms: started.elapsed().as_millis() as u64,
                cache_age_hours: Some(age_hours),
            };
            self.log_health(symbol, &result, true);
            return Ok(result);
        }

        // ── 4. Nothing left ─────────────────────────────────────────────
        let detail = attempts
            .last()
            .and_then(|a| a.error.clone())
            .unwrap_or_else(|| "no sources configured".to_string());
        warn!(symbol, attempts = attempts.len(), "market data unavailable");

        self.health_log.append(&HealthRecord {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            source: None,
            rows: 0,
            total_attempts: attempts.len(),
            total_latency_ms: started.elapsed().as_millis() as u64,
            cache_age_hours: None,
            attempts,
        });

        Err(EngineError::DataUnavailable {
            symbol: symbol.to_string(),
            detail,
        })
    }

    fn log_health(&self, symbol: &str, result: &MarketDataResult, _success: bool) {
        self.health_log.append(&HealthRecord {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            source: Some(result.source),
            rows: result.series.len(),
            total_attempts: result.attempts.len(),
            total_latency_ms: result.total_latency_ms,
            cache_age_hours: result.cache_age_hours,
            attempts: result.attempts.clone(),
        });
    }
}

impl std::fmt::Debug for MarketDataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let chain: Vec<String> = self.sources.iter().map(|s| s.source.id().to_string()).collect();
        f.debug_struct("MarketDataProvider")
            .field("chain", &chain)
            .finish()
    }
}
