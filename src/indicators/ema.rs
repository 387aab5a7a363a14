// =============================================================================
// Moving Averages — SMA and EMA
// =============================================================================
//
// EMA weights recent prices more heavily than the SMA:
//
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first EMA value is seeded with the SMA of the first `period` closes.
// Output vectors are aligned with the input; the warm-up prefix is `None`.
// =============================================================================

/// Simple moving average, aligned with the input. The first `period - 1`
/// entries are `None`.
pub fn sma_series(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let mut window_sum: f64 = values[..period].iter().sum();
    let period_f = period as f64;

    let first = window_sum / period_f;
    out[period - 1] = first.is_finite().then_some(first);

    for i in period..values.len() {
        window_sum += values[i] - values[i - period];
        let sma = window_sum / period_f;
        out[i] = sma.is_finite().then_some(sma);
    }
    out
}

/// Exponential moving average, aligned with the input. The first
/// `period - 1` entries are `None`; the value at `period - 1` is the SMA
/// seed. A non-finite intermediate value truncates the defined suffix.
pub fn ema_series(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);

    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return out;
    }
    out[period - 1] = Some(seed);

    let mut prev = seed;
    for i in period..values.len() {
        let ema = values[i] * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        out[i] = Some(ema);
        prev = ema;
    }
    out
}
