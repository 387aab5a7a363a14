// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 14. The stop-loss engine consumes the latest value.
// =============================================================================

use crate::market_data::Bar;

/// ATR series aligned with `bars`. The first `period` entries are `None`
/// (each TR needs a previous bar, and the seed consumes `period` TRs).
pub fn atr_series(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if period == 0 || bars.len() < period + 1 {
        return out;
    }

    let tr_values: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let hl = w[1].high - w[1].low;
            let hc = (w[1].high - prev_close).abs();
            let lc = (w[1].low - prev_close).abs();
            hl.max(hc).max(lc)
        })
        .collect();

    let period_f = period as f64;
    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return out;
    }
    out[period] = Some(seed);

    let mut atr = seed;
    for (i, &tr) in tr_values.iter().enumerate().skip(period) {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            break;
        }
        // TR index i corresponds to bar index i + 1.
        out[i + 1] = Some(atr);
    }

    out
}

/// Most recent ATR with the standard 14-bar period.
pub fn latest_atr(bars: &[Bar]) -> Option<f64> {
    atr_series(bars, 14).last().cloned().flatten()
}
