// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — price deltas from consecutive closes.
// Step 2 — seed average gain / loss with the SMA of the first `period` deltas.
// Step 3 — Wilder's smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + loss) / period
// Step 4 — RS = avg_gain / avg_loss,  RSI = 100 - 100 / (1 + RS)
//
// The first `period` entries are undefined. A zero average loss is guarded
// with a tiny epsilon rather than producing an infinity.
// =============================================================================

use super::EPSILON;

/// RSI series aligned with `closes`. The first `period` entries are `None`.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return out;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    match rsi_from_averages(avg_gain, avg_loss) {
        Some(rsi) => out[period] = Some(rsi),
        None => return out,
    }

    for (i, &delta) in deltas.iter().enumerate().skip(period) {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_from_averages(avg_gain, avg_loss) {
            // Delta index i corresponds to close index i + 1.
            Some(rsi) => out[i + 1] = Some(rsi),
            None => break,
        }
    }

    out
}

/// RSI from smoothed averages, with the near-zero-loss guard applied.
/// A dead-flat tape (no gains, no losses) reads neutral, not oversold.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    if !avg_gain.is_finite() || !avg_loss.is_finite() {
        return None;
    }
    if avg_gain <= EPSILON && avg_loss <= EPSILON {
        return Some(50.0);
    }
    let rs = avg_gain / avg_loss.max(EPSILON);
    let rsi = 100.0 - 100.0 / (1.0 + rs);
    rsi.is_finite().then_some(rsi.clamp(0.0, 100.0))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_prefix_is_none() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let out = rsi_series(&closes, 14);
        for v in out.iter().take(14) {
            assert!(v.is_none());
        }
        assert!(out[14].is_some());
    }

    #[test]
    fn all_gains_pin_near_100() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let rsi = rsi_series(&closes, 14).last().unwrap().unwrap();
        assert!(rsi > 99.0, "monotone rally should pin RSI near 100, got {rsi}");
    }

    #[test]
    fn all_losses_pin_near_0() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64 * 0.5).collect();
        let rsi = rsi_series(&closes, 14).last().unwrap().unwrap();
        assert!(rsi < 1.0, "monotone decline should pin RSI near 0, got {rsi}");
    }

    #[test]
    fn alternating_moves_sit_mid_band() {
        let closes: Vec<f64> = (0..60)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let rsi = rsi_series(&closes, 14).last().unwrap().unwrap();
        assert!((30.0..=70.0).contains(&rsi), "expected mid-band RSI, got {rsi}");
    }

    #[test]
    fn rsi_bounded() {
        let closes: Vec<f64> = (0..100)
            .map(|i| 100.0 + (i as f64 * 1.3).sin() * 20.0)
            .collect();
        for rsi in rsi_series(&closes, 14).iter().flatten() {
            assert!((0.0..=100.0).contains(rsi));
        }
    }

    #[test]
    fn insufficient_data_is_all_none() {
        let closes = vec![100.0; 10];
        assert!(rsi_series(&closes, 14).iter().all(Option::is_none));
        assert!(rsi_series(&closes, 0).iter().all(Option::is_none));
    }

    #[test]
    fn prefix_stable_under_append() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + (i as f64 * 0.9).sin() * 4.0)
            .collect();
        let short = rsi_series(&closes[..50], 14);
        let full = rsi_series(&closes, 14);
        for i in 0..50 {
            assert_eq!(short[i], full[i], "RSI changed at index {i} after append");
        }
    }

    #[test]
    fn flat_prices_read_neutral() {
        let closes = vec![100.0; 40];
        // Zero gains and zero losses: neutral, not an extreme.
        let rsi = rsi_series(&closes, 14).last().unwrap().unwrap();
        assert!((rsi - 50.0).abs() < 1e-9);
    }
}
