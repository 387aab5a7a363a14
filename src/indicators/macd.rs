// =============================================================================
// Moving Average Convergence/Divergence (MACD)
// =============================================================================
//
//   line      = EMA(close, fast) - EMA(close, slow)
//   signal    = EMA(line, signal_period), seeded over the defined line values
//   histogram = line - signal
//
// Defaults: fast=12, slow=26, signal=9. The first `slow - 1` values are
// undefined; the signal (and histogram) additionally need `signal_period`
// defined line values before they appear.
// =============================================================================

use serde::Serialize;

use super::ema::ema_series;

/// One fully-defined MACD observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MacdPoint {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD series aligned with `closes`. Entries are `None` until both the
/// slow EMA and the signal EMA have warmed up.
pub fn macd_series(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Vec<Option<MacdPoint>> {
    let mut out = vec![None; closes.len()];
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return out;
    }
    if closes.len() < slow {
        return out;
    }

    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);

    // MACD line, defined where both EMAs are.
    let line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    // Signal line: EMA over the defined line values, seeded with the SMA of
    // the first `signal_period` of them.
    let multiplier = 2.0 / (signal_period as f64 + 1.0);
    let mut defined_count = 0usize;
    let mut seed_sum = 0.0;
    let mut signal: Option<f64> = None;

    for (i, point) in line.iter().enumerate() {
        let Some(line_val) = point else { continue };

        match signal {
            None => {
                defined_count += 1;
                seed_sum += line_val;
                if defined_count == signal_period {
                    signal = Some(seed_sum / signal_period as f64);
                }
            }
            Some(prev) => {
                signal = Some(line_val * multiplier + prev * (1.0 - multiplier));
            }
        }

        if let Some(sig) = signal {
            if !sig.is_finite() || !line_val.is_finite() {
                break;
            }
            out[i] = Some(MacdPoint {
                line: *line_val,
                signal: sig,
                histogram: line_val - sig,
            });
        }
    }

    out
}

/// Most recent MACD point with the standard (12, 26, 9) parameters.
pub fn latest_macd(closes: &[f64]) -> Option<MacdPoint> {
    macd_series(closes, 12, 26, 9).last().cloned().flatten()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trending(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64 * 0.5).collect()
    }

    #[test]
    fn warmup_prefix_is_undefined() {
        let closes = trending(60);
        let out = macd_series(&closes, 12, 26, 9);
        // Nothing before the slow EMA warms up, and the signal needs nine
        // defined line values on top of that.
        for point in out.iter().take(25 + 8) {
            assert!(point.is_none());
        }
        assert!(out[25 + 8].is_some());
    }

    #[test]
    fn uptrend_gives_positive_line() {
        let closes = trending(80);
        let point = latest_macd(&closes).unwrap();
        assert!(point.line > 0.0, "steady uptrend should give positive MACD");
    }

    #[test]
    fn histogram_is_line_minus_signal() {
        let closes: Vec<f64> = (0..90)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1)
            .collect();
        for point in macd_series(&closes, 12, 26, 9).iter().flatten() {
            assert!((point.histogram - (point.line - point.signal)).abs() < 1e-12);
        }
    }

    #[test]
    fn constant_prices_give_zero_macd() {
        let closes = vec![250.0; 80];
        let point = latest_macd(&closes).unwrap();
        assert!(point.line.abs() < 1e-9);
        assert!(point.signal.abs() < 1e-9);
        assert!(point.histogram.abs() < 1e-9);
    }

    #[test]
    fn invalid_parameters_yield_all_none() {
        let closes = trending(60);
        assert!(macd_series(&closes, 26, 12, 9).iter().all(Option::is_none));
        assert!(macd_series(&closes, 0, 26, 9).iter().all(Option::is_none));
        assert!(macd_series(&closes, 12, 26, 0).iter().all(Option::is_none));
    }

    #[test]
    fn prefix_stable_under_append() {
        let closes: Vec<f64> = (0..100)
            .map(|i| 100.0 + (i as f64 * 0.4).cos() * 3.0)
            .collect();
        let short = macd_series(&closes[..70], 12, 26, 9);
        let full = macd_series(&closes, 12, 26, 9);
        for i in 0..70 {
            assert_eq!(short[i], full[i], "MACD changed at index {i} after append");
        }
    }

    #[test]
    fn too_few_closes_yield_all_none() {
        let closes = trending(20);
        assert!(macd_series(&closes, 12, 26, 9).iter().all(Option::is_none));
    }
}
