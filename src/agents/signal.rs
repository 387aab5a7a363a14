// =============================================================================
// Signal Agent — technical composite in [-1, 1]
// =============================================================================
//
// Blends four technical reads into one score:
//
//   MACD histogram  (momentum, normalised by ATR)        weight 0.35
//   RSI band        (mean reversion at the extremes)     weight 0.25
//   trend vs SMAs   (price above/below 20 and 50)        weight 0.25
//   volume ratio    (conviction behind the move)         weight 0.15
//
// Score > +0.15 reads BUY, < -0.15 reads SELL, otherwise HOLD; the
// confidence is the absolute score.
// =============================================================================

use serde::Serialize;

use super::{AgentContext, AgentId, SpecialistRecommendation};
use crate::types::Action;

const MACD_WEIGHT: f64 = 0.35;
const RSI_WEIGHT: f64 = 0.25;
const TREND_WEIGHT: f64 = 0.25;
const VOLUME_WEIGHT: f64 = 0.15;

/// Score beyond which the composite stops reading as noise.
const ACTION_THRESHOLD: f64 = 0.15;

#[derive(Debug, Clone, Serialize)]
struct SignalEvidence {
    macd_component: f64,
    rsi_component: f64,
    trend_component: f64,
    volume_component: f64,
    score: f64,
}

#[derive(Debug, Default)]
pub struct SignalAgent;

impl SignalAgent {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, ctx: &AgentContext) -> SpecialistRecommendation {
        let ind = &ctx.indicators;

        // ── MACD: histogram sign and magnitude, in ATR units ────────────
        let macd_component = match (ind.macd.as_ref(), ind.atr) {
            (Some(macd), Some(atr)) if atr > 0.0 => {
                (macd.histogram / atr).clamp(-1.0, 1.0)
            }
            (Some(macd), _) => macd.histogram.signum() * 0.5,
            _ => 0.0,
        };

        // ── RSI: fade the extremes, neutral mid-band ────────────────────
        let rsi_component = match ind.rsi {
            Some(rsi) if rsi <= 30.0 => ((30.0 - rsi) / 30.0).min(1.0),
            Some(rsi) if rsi >= 70.0 => -((rsi - 70.0) / 30.0).min(1.0),
            Some(_) => 0.0,
            None => 0.0,
        };

        // ── Trend: price vs the moving-average stack ────────────────────
        let trend_component = match (ind.sma_20, ind.sma_50) {
            (Some(s20), Some(s50)) => {
                if ctx.price > s20 && ctx.price > s50 {
                    if s20 > s50 {
                        1.0
                    } else {
                        0.5
                    }
                } else if ctx.price < s20 && ctx.price < s50 {
                    if s20 < s50 {
                        -1.0
                    } else {
                        -0.5
                    }
                } else {
                    0.0
                }
            }
            (Some(s20), None) => {
                if ctx.price > s20 {
                    0.5
                } else if ctx.price < s20 {
                    -0.5
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        // ── Volume: conviction confirms the directional components ──────
        let directional = macd_component + trend_component;
        let volume_component = match ind.volume_ratio {
            Some(ratio) if ratio > 1.2 => directional.signum() * ((ratio - 1.0).min(1.0)),
            Some(ratio) if ratio < 0.8 => -directional.signum() * 0.3,
            _ => 0.0,
        };

        let score = (MACD_WEIGHT * macd_component
            + RSI_WEIGHT * rsi_component
            + TREND_WEIGHT * trend_component
            + VOLUME_WEIGHT * volume_component)
            .clamp(-1.0, 1.0);

        let action = if score > ACTION_THRESHOLD {
            Action::Buy
        } else if score < -ACTION_THRESHOLD {
            Action::Sell
        } else {
            Action::Hold
        };

        let evidence = SignalEvidence {
            macd_component,
            rsi_component,
            trend_component,
            volume_component,
            score,
        };

        SpecialistRecommendation::new(
            AgentId::Signal,
            action,
            score.abs(),
            format!("technical composite {score:+.2}"),
        )
        .with_evidence(serde_json::to_value(&evidence).unwrap_or_default())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::{context, context_with, context_with_volumes};

    /// Sawtooth with net drift keeps RSI mid-band so the trend and volume
    /// components carry the score; a monotone ramp would pin RSI at an
    /// extreme and fight its own trend.
    fn drifting(n: usize, slope: f64) -> impl Fn(usize) -> f64 {
        move |i| 520.0 + i as f64 * slope + (i % 2) as f64 * 2.0 * slope.signum()
    }

    #[test]
    fn sawtooth_uptrend_reads_buy() {
        let ctx = context_with_volumes(60, drifting(60, 0.5), |i| {
            if i == 59 {
                1_400_000.0
            } else {
                1_000_000.0
            }
        });
        let rec = SignalAgent::new().analyze(&ctx);
        assert_eq!(rec.action, Action::Buy, "rationale: {}", rec.rationale);
        assert!(rec.confidence > 0.2);
    }

    #[test]
    fn sawtooth_downtrend_reads_sell() {
        let ctx = context_with_volumes(60, drifting(60, -0.5), |i| {
            if i == 59 {
                1_400_000.0
            } else {
                1_000_000.0
            }
        });
        let rec = SignalAgent::new().analyze(&ctx);
        assert_eq!(rec.action, Action::Sell, "rationale: {}", rec.rationale);
    }

    #[test]
    fn flat_tape_reads_hold() {
        let ctx = context_with(60, |_| 500.0);
        let rec = SignalAgent::new().analyze(&ctx);
        assert_eq!(rec.action, Action::Hold);
        assert!(rec.confidence < 0.2);
    }

    #[test]
    fn confidence_equals_absolute_score() {
        let ctx = context(60);
        let rec = SignalAgent::new().analyze(&ctx);
        let score = rec.evidence["score"].as_f64().unwrap();
        assert!((rec.confidence - score.abs()).abs() < 1e-9);
    }

    #[test]
    fn short_series_degrades_to_hold() {
        // Too few bars for any indicator: every component reads zero.
        let ctx = context(5);
        let rec = SignalAgent::new().analyze(&ctx);
        assert_eq!(rec.action, Action::Hold);
        assert_eq!(rec.confidence, 0.0);
    }

    #[test]
    fn evidence_carries_all_components() {
        let ctx = context(60);
        let rec = SignalAgent::new().analyze(&ctx);
        for key in [
            "macd_component",
            "rsi_component",
            "trend_component",
            "volume_component",
            "score",
        ] {
            assert!(rec.evidence.get(key).is_some(), "missing {key}");
        }
    }
}
