// =============================================================================
// Meta Agent — regime detection and regime-weighted consensus
// =============================================================================
//
// Two jobs:
//
//   1. Classify the market regime for a symbol from a fixed window of
//      returns: realized-vol level and percentile against its own rolling
//      history, ADX-like trend strength, and the recent drawdown.
//
//   2. Aggregate the specialists' recommendations into one decision.
//      Each vote is action(±1/0) × confidence × regime weight; the summed
//      score crosses ±`buy_threshold` or the symbol holds. In CRISIS any
//      BUY additionally requires a unanimous specialist panel.
//
// Classification hierarchy (first match wins):
//
//   1. CRISIS    elevated vol (percentile >= 0.90 or >= 30% annualised)
//                while the recent return breaches -5%
//   2. HIGH_VOL  realized vol >= 30% annualised
//   3. TRENDING  trend strength >= 25
//   4. LOW_VOL   realized vol <= 15% annualised
//   5. RANGING   everything else
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AgentId, SpecialistRecommendation};
use crate::indicators::volatility;
use crate::market_data::BarSeries;
use crate::types::Action;

/// Window of bars the regime read is computed over.
pub const REGIME_WINDOW: usize = 30;
/// Vol window used inside the regime window.
const VOL_WINDOW: usize = 10;
/// Bars behind the "recent return" drawdown check.
const RECENT_RETURN_BARS: usize = 5;

// ---------------------------------------------------------------------------
// Regime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    LowVol,
    HighVol,
    Trending,
    Ranging,
    Crisis,
}

impl Regime {
    /// Position-size multiplier applied by the risk manager.
    pub fn size_multiplier(self) -> f64 {
        match self {
            Self::LowVol => 1.0,
            Self::HighVol => 0.5,
            Self::Trending => 1.2,
            Self::Ranging => 0.8,
            Self::Crisis => 0.0,
        }
    }

    /// Reward : risk ratio used to place take-profits relative to stops.
    pub fn reward_risk(self) -> (f64, f64) {
        match self {
            Self::Trending => (3.0, 1.0),
            Self::HighVol => (2.5, 1.0),
            Self::LowVol => (2.0, 1.0),
            Self::Ranging => (1.5, 1.0),
            Self::Crisis => (0.0, 0.0),
        }
    }

    /// Stable key component for the RL filter's discretized state.
    pub fn key(self) -> &'static str {
        match self {
            Self::LowVol => "LOW_VOL",
            Self::HighVol => "HIGH_VOL",
            Self::Trending => "TRENDING",
            Self::Ranging => "RANGING",
            Self::Crisis => "CRISIS",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// The regime classification plus the metrics behind it, for the audit
/// trail.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeReading {
    pub regime: Regime,
    pub realized_vol: Option<f64>,
    pub vol_percentile: Option<f64>,
    pub trend_strength: Option<f64>,
    pub recent_return: Option<f64>,
}

/// Classify the regime for a series. Falls back to RANGING when the window
/// is too short for a confident read.
pub fn detect_regime(series: &BarSeries) -> RegimeReading {
    let window = series.tail(REGIME_WINDOW);
    let closes: Vec<f64> = window.iter().map(|b| b.close).collect();

    let vol_series = volatility::rolling_volatility(&closes, VOL_WINDOW);
    let realized_vol = vol_series.iter().rev().flatten().next().copied();
    let vol_percentile = realized_vol.map(|latest| {
        let history: Vec<f64> = vol_series.iter().flatten().copied().collect();
        volatility::percentile_rank(&history, latest)
    });
    let trend = volatility::trend_strength(window, 14);

    let recent_return = (closes.len() > RECENT_RETURN_BARS)
        .then(|| {
            let then = closes[closes.len() - 1 - RECENT_RETURN_BARS];
            let now = closes[closes.len() - 1];
            (then > 0.0).then(|| now / then - 1.0)
        })
        .flatten();

    let regime = classify(realized_vol, vol_percentile, trend, recent_return);

    let reading = RegimeReading {
        regime,
        realized_vol,
        vol_percentile,
        trend_strength: trend,
        recent_return,
    };
    debug!(
        symbol = series.symbol(),
        regime = %regime,
        vol = ?realized_vol,
        vol_pct = ?vol_percentile,
        trend = ?trend,
        "regime detected"
    );
    reading
}

fn classify(
    realized_vol: Option<f64>,
    vol_percentile: Option<f64>,
    trend_strength: Option<f64>,
    recent_return: Option<f64>,
) -> Regime {
    let vol = realized_vol.unwrap_or(0.0);
    let vol_pct = vol_percentile.unwrap_or(0.5);
    let trend = trend_strength.unwrap_or(0.0);
    let ret = recent_return.unwrap_or(0.0);

    if (vol_pct >= 0.90 || vol >= 0.30) && ret <= -0.05 {
        Regime::Crisis
    } else if vol >= 0.30 {
        Regime::HighVol
    } else if trend >= 25.0 {
        Regime::Trending
    } else if realized_vol.is_some() && vol <= 0.15 {
        Regime::LowVol
    } else {
        Regime::Ranging
    }
}

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// Per-specialist weight vector; sums to 1 for every regime.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AgentWeights {
    pub research: f64,
    pub signal: f64,
    pub risk: f64,
    pub execution: f64,
}

impl AgentWeights {
    pub fn for_regime(regime: Regime) -> Self {
        match regime {
            Regime::LowVol => Self {
                research: 0.40,
                signal: 0.30,
                risk: 0.20,
                execution: 0.10,
            },
            Regime::HighVol => Self {
                research: 0.20,
                signal: 0.20,
                risk: 0.50,
                execution: 0.10,
            },
            Regime::Trending => Self {
                research: 0.20,
                signal: 0.50,
                risk: 0.20,
                execution: 0.10,
            },
            Regime::Ranging => Self {
                research: 0.33,
                signal: 0.33,
                risk: 0.33,
                execution: 0.01,
            },
            // Crisis keeps balanced weights; the unanimity rule does the
            // real gating.
            Regime::Crisis => Self {
                research: 0.25,
                signal: 0.25,
                risk: 0.25,
                execution: 0.25,
            },
        }
    }

    pub fn weight_for(&self, agent: AgentId) -> f64 {
        match agent {
            AgentId::Research => self.research,
            AgentId::Signal => self.signal,
            AgentId::Risk => self.risk,
            AgentId::Execution => self.execution,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// One specialist's weighted contribution to the decision.
#[derive(Debug, Clone, Serialize)]
pub struct Contribution {
    pub agent_id: AgentId,
    pub action: Action,
    pub confidence: f64,
    pub weight: f64,
    pub weighted_vote: f64,
}

/// The single decision the pipeline produces for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct MetaDecision {
    pub symbol: String,
    pub action: Action,
    pub confidence: f64,
    pub regime: Regime,
    pub weights_used: AgentWeights,
    pub contributors: Vec<Contribution>,
}

pub struct MetaAgent {
    buy_threshold: f64,
}

impl MetaAgent {
    pub fn new(buy_threshold: f64) -> Self {
        Self { buy_threshold }
    }

    /// Weighted consensus over the specialist panel. `data_stale` applies
    /// the stale-data confidence haircut.
    pub fn aggregate(
        &self,
        symbol: &str,
        regime: Regime,
        recommendations: &[SpecialistRecommendation],
        data_stale: bool,
    ) -> MetaDecision {
        let weights = AgentWeights::for_regime(regime);

        let mut sum = 0.0;
        let contributors: Vec<Contribution> = recommendations
            .iter()
            .map(|rec| {
                let weight = weights.weight_for(rec.agent_id);
                let weighted_vote = rec.action.vote() * rec.confidence * weight;
                sum += weighted_vote;
                Contribution {
                    agent_id: rec.agent_id,
                    action: rec.action,
                    confidence: rec.confidence,
                    weight,
                    weighted_vote,
                }
            })
            .collect();

        let mut action = if sum > self.buy_threshold {
            Action::Buy
        } else if sum < -self.buy_threshold {
            Action::Sell
        } else {
            Action::Hold
        };

        // Crisis discipline: long exposure only on a unanimous panel.
        if regime == Regime::Crisis && action == Action::Buy {
            let unanimous = !recommendations.is_empty()
                && recommendations.iter().all(|r| r.action == Action::Buy);
            if !unanimous {
                action = Action::Hold;
            }
        }

        let mut confidence = sum.abs().clamp(0.0, 1.0);
        if data_stale {
            confidence *= 0.7;
        }

        info!(
            symbol,
            action = %action,
            confidence = format!("{confidence:.2}"),
            regime = %regime,
            score = format!("{sum:+.3}"),
            "meta decision"
        );

        MetaDecision {
            symbol: symbol.to_string(),
            action,
            confidence,
            regime,
            weights_used: weights,
            contributors,
        }
    }
}

impl Default for MetaAgent {
    fn default() -> Self {
        Self::new(0.35)
    }
}
