// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the
// decision pipeline. Series functions return vectors aligned one-to-one
// with their input, with `None` marking the undefined warm-up prefix —
// never zero. Callers are forced to handle the absent case.
//
// All indicators are forward recursions: appending future bars never
// changes values already computed for earlier indices.
// =============================================================================

pub mod atr;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod volatility;

use serde::Serialize;

use crate::market_data::BarSeries;

/// Guard against division by near-zero denominators in smoothing ratios.
pub(crate) const EPSILON: f64 = 1e-12;

/// The indicator snapshot handed to every specialist for one symbol.
///
/// Computed once per symbol per run; shared read-only across the fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd: Option<macd::MacdPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma_20: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma_50: Option<f64>,
    /// Annualised realized volatility over the regime window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_vol: Option<f64>,
    /// Percentile rank of the latest realized vol within its own history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vol_percentile: Option<f64>,
    /// ADX-like trend strength in [0, 100].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend_strength: Option<f64>,
    /// Latest volume relative to its 20-bar average.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_ratio: Option<f64>,
}

impl IndicatorSet {
    /// Compute the full indicator snapshot for a series.
    pub fn compute(series: &BarSeries) -> Self {
        let closes = series.closes();
        let bars = series.bars();

        let macd = macd::macd_series(&closes, 12, 26, 9)
            .last()
            .cloned()
            .flatten();
        let rsi = last_defined(&rsi::rsi_series(&closes, 14));
        let atr = last_defined(&atr::atr_series(bars, 14));
        let sma_20 = last_defined(&ema::sma_series(&closes, 20));
        let sma_50 = last_defined(&ema::sma_series(&closes, 50));

        let vol_series = volatility::rolling_volatility(&closes, 20);
        let realized_vol = last_defined(&vol_series);
        let vol_percentile = realized_vol.map(|latest| {
            let history: Vec<f64> = vol_series.iter().flatten().copied().collect();
            volatility::percentile_rank(&history, latest)
        });
        let trend_strength = volatility::trend_strength(bars, 14);

        let volume_ratio = volume_ratio(series, 20);

        Self {
            macd,
            rsi,
            atr,
            sma_20,
            sma_50,
            realized_vol,
            vol_percentile,
            trend_strength,
            volume_ratio,
        }
    }
}

/// Latest volume divided by the average volume of the preceding `window`
/// bars (the latest bar excluded from the average).
fn volume_ratio(series: &BarSeries, window: usize) -> Option<f64> {
    let bars = series.bars();
    if bars.len() < window + 1 {
        return None;
    }
    let latest = bars.last()?.volume;
    let prior = &bars[bars.len() - 1 - window..bars.len() - 1];
    let avg = prior.iter().map(|b| b.volume).sum::<f64>() / window as f64;
    if avg <= EPSILON {
        return None;
    }
    let ratio = latest / avg;
    ratio.is_finite().then_some(ratio)
}

/// Most recent defined value of an aligned indicator series.
pub fn last_defined(series: &[Option<f64>]) -> Option<f64> {
    series.iter().rev().flatten().next().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Bar;

    fn series_with_volumes(volumes: &[f64]) -> BarSeries {
        let bars = volumes
            .iter()
            .enumerate()
            .map(|(i, &v)| Bar {
                date: chrono::NaiveDate::from_ymd_opt(2025, 1, 1)
                    .unwrap()
                    .checked_add_days(chrono::Days::new(i as u64))
                    .unwrap(),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: v,
            })
            .collect();
        BarSeries::from_bars("TST", bars)
    }

    #[test]
    fn volume_ratio_excludes_latest_bar() {
        let mut volumes = vec![100.0; 20];
        volumes.push(130.0);
        let series = series_with_volumes(&volumes);
        let ratio = volume_ratio(&series, 20).unwrap();
        assert!((ratio - 1.3).abs() < 1e-9);
    }

    #[test]
    fn volume_ratio_needs_enough_bars() {
        let series = series_with_volumes(&[100.0; 10]);
        assert!(volume_ratio(&series, 20).is_none());
    }

    #[test]
    fn last_defined_skips_trailing_none() {
        let series = vec![None, Some(1.0), Some(2.0), None];
        assert_eq!(last_defined(&series), Some(2.0));
        assert_eq!(last_defined(&[None, None]), None);
    }
}
