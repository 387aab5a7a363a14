// =============================================================================
// Risk Agent — the sizing desk's vote
// =============================================================================
//
// Runs the risk manager's sizing hypothetically for a long entry and votes
// from the result: a healthy full-size allocation reads as a confident BUY,
// a shrunken one as a tepid BUY, and a veto as a firm HOLD. This agent
// never says SELL — vetoing exposure is HOLD's job.
// =============================================================================

use std::sync::Arc;

use super::{AgentContext, AgentId, SpecialistRecommendation};
use crate::risk::{RiskManager, SizingInputs};
use crate::types::{Action, Side};

pub struct RiskAgent {
    risk: Arc<RiskManager>,
}

impl RiskAgent {
    pub fn new(risk: Arc<RiskManager>) -> Self {
        Self { risk }
    }

    pub fn analyze(&self, ctx: &AgentContext) -> SpecialistRecommendation {
        let Some(atr) = ctx.indicators.atr else {
            return SpecialistRecommendation::neutral(AgentId::Risk, "ATR unavailable");
        };

        let inputs = SizingInputs {
            symbol: &ctx.symbol,
            side: Side::Buy,
            equity: ctx.equity,
            price: ctx.price,
            atr,
            observed_vol: ctx.indicators.realized_vol,
            regime: ctx.regime,
            stats: &ctx.stats,
            breaker_scale: ctx.breaker_scale,
            symbol_exposure: ctx.symbol_exposure,
            data_stale: ctx.data_stale,
        };

        match self.risk.size_entry(&inputs) {
            Ok((request, breakdown)) => {
                // Confidence tracks how much of the base allocation survived
                // the shrink chain.
                let allowed = request.notional.unwrap_or(0.0);
                let confidence = if breakdown.base_notional > 0.0 {
                    (allowed / breakdown.base_notional).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                SpecialistRecommendation::new(
                    AgentId::Risk,
                    Action::Buy,
                    confidence,
                    format!("sizing allows {allowed:.0} notional"),
                )
                .with_evidence(serde_json::to_value(&breakdown).unwrap_or_default())
            }
            Err(err) => SpecialistRecommendation::new(
                AgentId::Risk,
                Action::Hold,
                0.9,
                format!("sizing vetoed: {err}"),
            ),
        }
    }
}

impl std::fmt::Debug for RiskAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskAgent").finish()
    }
}
