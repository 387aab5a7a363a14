// =============================================================================
// Volatility & Trend Metrics
// =============================================================================
//
// - Rolling realized volatility: stdev of log returns over a window,
//   annualised by sqrt(252).
// - Percentile rank of a value within its own history (regime detection).
// - ADX-like trend strength from Wilder's directional movement, in [0, 100].
// - Expected move: price * iv * sqrt(dte / 365).
// =============================================================================

use super::EPSILON;
use crate::market_data::Bar;

/// Trading days per year used to annualise daily volatility.
const TRADING_DAYS: f64 = 252.0;

/// Annualised realized volatility series aligned with `closes`. Entry `i`
/// uses the `window` log returns ending at close `i`; the warm-up prefix is
/// `None`.
pub fn rolling_volatility(closes: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if window < 2 || closes.len() < window + 1 {
        return out;
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .map(|w| {
            if w[0] > EPSILON && w[1] > EPSILON {
                (w[1] / w[0]).ln()
            } else {
                f64::NAN
            }
        })
        .collect();

    for i in window..closes.len() {
        let slice = &returns[i - window..i];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let var = slice.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (window as f64 - 1.0);
        let vol = var.sqrt() * TRADING_DAYS.sqrt();
        out[i] = vol.is_finite().then_some(vol);
    }

    out
}

/// Most recent annualised realized volatility over `window` returns.
pub fn realized_vol(closes: &[f64], window: usize) -> Option<f64> {
    rolling_volatility(closes, window).last().cloned().flatten()
}

/// Fraction of `history` values at or below `value`, in [0, 1]. An empty
/// history ranks everything at 0.5 (no information either way).
pub fn percentile_rank(history: &[f64], value: f64) -> f64 {
    if history.is_empty() {
        return 0.5;
    }
    let below = history.iter().filter(|&&v| v <= value).count();
    below as f64 / history.len() as f64
}

/// ADX-like trend strength in [0, 100] from Wilder's directional movement.
///
/// Pipeline: +DM/-DM and TR per bar transition, Wilder-smoothed over
/// `period`, then DX = |+DI - -DI| / (+DI + -DI) * 100, and the trend
/// strength is the Wilder-smoothed DX. Needs `2 * period + 1` bars.
pub fn trend_strength(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let n = bars.len();

    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    let mut tr_vals = Vec::with_capacity(n - 1);

    for w in bars.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);
        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;
        plus_dm.push(if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 });
        minus_dm.push(if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 });
        tr_vals.push(tr);
    }

    // Initial Wilder sums over the first `period` transitions.
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();
    let mut sm_tr: f64 = tr_vals[..period].iter().sum();

    let dx_at = |sm_plus: f64, sm_minus: f64, sm_tr: f64| -> f64 {
        let plus_di = sm_plus / sm_tr.max(EPSILON) * 100.0;
        let minus_di = sm_minus / sm_tr.max(EPSILON) * 100.0;
        let di_sum = plus_di + minus_di;
        (plus_di - minus_di).abs() / di_sum.max(EPSILON) * 100.0
    };

    let mut dx_values = vec![dx_at(sm_plus, sm_minus, sm_tr)];
    for i in period..tr_vals.len() {
        sm_plus = sm_plus - sm_plus / period_f + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period_f + minus_dm[i];
        sm_tr = sm_tr - sm_tr / period_f + tr_vals[i];
        dx_values.push(dx_at(sm_plus, sm_minus, sm_tr));
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    (adx.is_finite()).then(|| adx.clamp(0.0, 100.0))
}

/// One-standard-deviation expected move for an option-implied volatility
/// over `dte` calendar days: `price * iv * sqrt(dte / 365)`.
pub fn expected_move(price: f64, iv: f64, dte: f64) -> f64 {
    if dte <= 0.0 {
        return 0.0;
    }
    price * iv * (dte / 365.0).sqrt()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Days, NaiveDate};

    fn bar(i: usize, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            date: NaiveDate::from_ymd_opt(2025, 1, 1)
                .unwrap()
                .checked_add_days(Days::new(i as u64))
                .unwrap(),
            open,
            high,
            low,
            close,
            volume: 1_000_000.0,
        }
    }

    #[test]
    fn constant_prices_have_zero_vol() {
        let closes = vec![100.0; 40];
        let vol = realized_vol(&closes, 20).unwrap();
        assert!(vol.abs() < 1e-12);
    }

    #[test]
    fn wilder_vol_increases_with_swing_size() {
        let calm: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64).sin() * 0.1).collect();
        let wild: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64).sin() * 5.0).collect();
        let calm_vol = realized_vol(&calm, 20).unwrap();
        let wild_vol = realized_vol(&wild, 20).unwrap();
        assert!(wild_vol > calm_vol * 5.0);
    }

    #[test]
    fn vol_prefix_stable_under_append() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 3.0)
            .collect();
        let short = rolling_volatility(&closes[..50], 20);
        let full = rolling_volatility(&closes, 20);
        for i in 0..50 {
            assert_eq!(short[i], full[i], "vol changed at index {i} after append");
        }
    }

    #[test]
    fn percentile_rank_basic() {
        let history = vec![1.0, 2.0, 3.0, 4.0];
        assert!((percentile_rank(&history, 4.0) - 1.0).abs() < 1e-12);
        assert!((percentile_rank(&history, 2.0) - 0.5).abs() < 1e-12);
        assert!((percentile_rank(&history, 0.5) - 0.0).abs() < 1e-12);
        assert!((percentile_rank(&[], 1.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn strong_uptrend_reads_high_strength() {
        let bars: Vec<Bar> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                bar(i, base, base + 2.5, base - 0.5, base + 2.0)
            })
            .collect();
        let strength = trend_strength(&bars, 14).unwrap();
        assert!(strength > 50.0, "directional march should read strong, got {strength}");
    }

    #[test]
    fn choppy_market_reads_low_strength() {
        let bars: Vec<Bar> = (0..60)
            .map(|i| {
                let base = if i % 2 == 0 { 100.0 } else { 101.0 };
                bar(i, base, base + 1.5, base - 1.5, base)
            })
            .collect();
        let strength = trend_strength(&bars, 14).unwrap();
        assert!(strength < 25.0, "alternating chop should read weak, got {strength}");
    }

    #[test]
    fn trend_strength_needs_enough_bars() {
        let bars: Vec<Bar> = (0..20)
            .map(|i| bar(i, 100.0, 101.0, 99.0, 100.0))
            .collect();
        assert!(trend_strength(&bars, 14).is_none());
    }

    #[test]
    fn expected_move_scales_with_sqrt_time() {
        let one_day = expected_move(100.0, 0.20, 1.0);
        let four_days = expected_move(100.0, 0.20, 4.0);
        assert!((four_days / one_day - 2.0).abs() < 1e-9);
        assert_eq!(expected_move(100.0, 0.20, 0.0), 0.0);
    }

    #[test]
    fn expected_move_one_year_is_iv() {
        let m = expected_move(100.0, 0.25, 365.0);
        assert!((m - 25.0).abs() < 1e-9);
    }
}
