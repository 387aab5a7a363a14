// =============================================================================
// Specialist Agents — the decision pipeline's four perspectives
// =============================================================================
//
// Each specialist reads the same immutable context and emits one scored
// recommendation; they never talk to each other. The meta agent joins the
// fan-out, weights the votes by regime, and produces the single decision
// per symbol.
//
// Specialists are tagged variants of one enum rather than a trait-object
// hierarchy: the meta agent dispatches by variant, and the whole set stays
// visible in one place.
// =============================================================================

pub mod execution_agent;
pub mod meta;
pub mod research;
pub mod risk_agent;
pub mod rl_filter;
pub mod signal;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::indicators::IndicatorSet;
use crate::market_data::BarSeries;
use crate::state::JournalStats;
use crate::types::Action;
use meta::Regime;

// ---------------------------------------------------------------------------
// Context and recommendation
// ---------------------------------------------------------------------------

/// Immutable per-symbol context shared by every specialist in the fan-out.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub symbol: String,
    pub bars: Arc<BarSeries>,
    pub indicators: Arc<IndicatorSet>,
    pub regime: Regime,
    /// Latest close, used as the working quote.
    pub price: f64,
    pub equity: f64,
    /// Notional already deployed in this symbol.
    pub symbol_exposure: f64,
    pub stats: JournalStats,
    /// Sizing multiplier granted by the portfolio breaker.
    pub breaker_scale: f64,
    /// The bars were served from a stale cache; confidence haircuts apply.
    pub data_stale: bool,
    /// Wall-clock of the evaluation, for session-phase timing.
    pub now: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    Research,
    Signal,
    Risk,
    Execution,
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Research => write!(f, "research"),
            Self::Signal => write!(f, "signal"),
            Self::Risk => write!(f, "risk"),
            Self::Execution => write!(f, "execution"),
        }
    }
}

/// One specialist's scored opinion.
#[derive(Debug, Clone, Serialize)]
pub struct SpecialistRecommendation {
    pub agent_id: AgentId,
    pub action: Action,
    /// In [0, 1].
    pub confidence: f64,
    pub rationale: String,
    /// Structured supporting data, carried into the audit trail.
    pub evidence: serde_json::Value,
}

impl SpecialistRecommendation {
    pub fn new(
        agent_id: AgentId,
        action: Action,
        confidence: f64,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            agent_id,
            action,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
            evidence: serde_json::Value::Null,
        }
    }

    pub fn with_evidence(mut self, evidence: serde_json::Value) -> Self {
        self.evidence = evidence;
        self
    }

    /// The neutral answer a specialist falls back to when it cannot form
    /// an opinion (timeout, missing data, LLM outage).
    pub fn neutral(agent_id: AgentId, rationale: impl Into<String>) -> Self {
        Self::new(agent_id, Action::Hold, 0.0, rationale)
    }
}

// ---------------------------------------------------------------------------
// The specialist set
// ---------------------------------------------------------------------------

pub enum SpecialistAgent {
    Research(research::ResearchAgent),
    Signal(signal::SignalAgent),
    Risk(risk_agent::RiskAgent),
    Execution(execution_agent::ExecutionAgent),
}

impl SpecialistAgent {
    pub fn id(&self) -> AgentId {
        match self {
            Self::Research(_) => AgentId::Research,
            Self::Signal(_) => AgentId::Signal,
            Self::Risk(_) => AgentId::Risk,
            Self::Execution(_) => AgentId::Execution,
        }
    }

    pub async fn analyze(&self, ctx: &AgentContext) -> SpecialistRecommendation {
        match self {
            Self::Research(agent) => agent.analyze(ctx).await,
            Self::Signal(agent) => agent.analyze(ctx),
            Self::Risk(agent) => agent.analyze(ctx),
            Self::Execution(agent) => agent.analyze(ctx),
        }
    }
}

/// Fan the context out to every specialist concurrently and join, applying
/// the per-specialist timeout. A timed-out specialist contributes HOLD with
/// zero confidence — it never sinks the symbol.
pub async fn run_specialists(
    agents: &[Arc<SpecialistAgent>],
    ctx: Arc<AgentContext>,
    timeout: Duration,
) -> Vec<SpecialistRecommendation> {
    let mut handles = Vec::with_capacity(agents.len());
    for agent in agents {
        let agent = agent.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let id = agent.id();
            match tokio::time::timeout(timeout, agent.analyze(&ctx)).await {
                Ok(rec) => rec,
                Err(_) => {
                    warn!(agent = %id, symbol = %ctx.symbol, "specialist timed out");
                    SpecialistRecommendation::neutral(id, "timed out")
                }
            }
        }));
    }

    let mut recommendations = Vec::with_capacity(handles.len());
    for (handle, agent) in handles.into_iter().zip(agents) {
        match handle.await {
            Ok(rec) => recommendations.push(rec),
            Err(e) => {
                warn!(agent = %agent.id(), error = %e, "specialist task panicked");
                recommendations.push(SpecialistRecommendation::neutral(
                    agent.id(),
                    "internal failure",
                ));
            }
        }
    }
    recommendations
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::market_data::Bar;
    use chrono::{Days, NaiveDate, Utc};

    /// A context over `n` gently trending bars; good-enough defaults for
    /// most agent tests.
    pub(crate) fn context(n: usize) -> AgentContext {
        context_with(n, |i| 500.0 + i as f64 * 0.2)
    }

    pub(crate) fn context_with(n: usize, price_at: impl Fn(usize) -> f64) -> AgentContext {
        context_with_volumes(n, price_at, |_| 1_000_000.0)
    }

    pub(crate) fn context_with_volumes(
        n: usize,
        price_at: impl Fn(usize) -> f64,
        volume_at: impl Fn(usize) -> f64,
    ) -> AgentContext {
        let bars: Vec<Bar> = (0..n)
            .map(|i| {
                let close = price_at(i);
                Bar {
                    date: NaiveDate::from_ymd_opt(2025, 1, 1)
                        .unwrap()
                        .checked_add_days(Days::new(i as u64))
                        .unwrap(),
                    open: close - 0.5,
                    high: close + 1.5,
                    low: close - 1.5,
                    close,
                    volume: volume_at(i),
                }
            })
            .collect();
        let series = BarSeries::from_bars("SPY", bars);
        let indicators = IndicatorSet::compute(&series);
        let price = series.last().map(|b| b.close).unwrap_or(0.0);
        AgentContext {
            symbol: "SPY".into(),
            bars: Arc::new(series),
            indicators: Arc::new(indicators),
            regime: Regime::LowVol,
            price,
            equity: 100_000.0,
            symbol_exposure: 0.0,
            stats: JournalStats::default(),
            breaker_scale: 1.0,
            data_stale: false,
            now: Utc::now(),
        }
    }

    #[test]
    fn neutral_recommendation_is_hold_zero() {
        let rec = SpecialistRecommendation::neutral(AgentId::Research, "llm down");
        assert_eq!(rec.action, Action::Hold);
        assert_eq!(rec.confidence, 0.0);
    }

    #[test]
    fn confidence_is_clamped() {
        let rec = SpecialistRecommendation::new(AgentId::Signal, Action::Buy, 1.7, "x");
        assert_eq!(rec.confidence, 1.0);
        let rec = SpecialistRecommendation::new(AgentId::Signal, Action::Buy, -0.3, "x");
        assert_eq!(rec.confidence, 0.0);
    }
}
