// =============================================================================
// Execution Agent — intraday timing quality
// =============================================================================
//
// The daily pipeline fires around the open, but not always exactly there.
// This agent scores how hospitable the current session phase is to a market
// order, estimates the spread cost from recent bar ranges, and downgrades
// its confidence (or recommends waiting) when conditions are poor.
// =============================================================================

use chrono::Timelike;
use serde::Serialize;

use super::{AgentContext, AgentId, SpecialistRecommendation};
use crate::types::Action;

/// US equities regular session in UTC (summer time; the coarse phase
/// buckets below tolerate the DST hour either way).
const SESSION_OPEN_HOUR: u32 = 13; // 13:30 UTC
const SESSION_CLOSE_HOUR: u32 = 20; // 20:00 UTC

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    PreMarket,
    OpeningAuction,
    Regular,
    ClosingHour,
    AfterHours,
}

impl SessionPhase {
    pub fn from_utc(now: chrono::DateTime<chrono::Utc>) -> Self {
        let minutes = now.hour() * 60 + now.minute();
        let open = SESSION_OPEN_HOUR * 60 + 30;
        let close = SESSION_CLOSE_HOUR * 60;

        if minutes < open {
            Self::PreMarket
        } else if minutes < open + 30 {
            Self::OpeningAuction
        } else if minutes < close - 60 {
            Self::Regular
        } else if minutes < close {
            Self::ClosingHour
        } else {
            Self::AfterHours
        }
    }

    /// Baseline timing quality in [0, 1].
    fn timing_score(self) -> f64 {
        match self {
            // Orders queued pre-open fill at the auction; acceptable.
            Self::PreMarket => 0.7,
            // The first half hour is the most chaotic tape of the day.
            Self::OpeningAuction => 0.4,
            Self::Regular => 0.9,
            Self::ClosingHour => 0.6,
            Self::AfterHours => 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ExecutionEvidence {
    session_phase: SessionPhase,
    timing_score: f64,
    spread_estimate_bps: Option<f64>,
    delay_suggested: bool,
}

#[derive(Debug, Default)]
pub struct ExecutionAgent;

impl ExecutionAgent {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, ctx: &AgentContext) -> SpecialistRecommendation {
        let phase = SessionPhase::from_utc(ctx.now);
        let mut score = phase.timing_score();

        // Spread proxy: average daily range in basis points, scaled down to
        // a plausible quoted-spread fraction. Wide-ranging names cost more
        // to cross.
        let spread_estimate_bps = spread_estimate_bps(ctx);
        if let Some(bps) = spread_estimate_bps {
            if bps > 25.0 {
                score *= 0.7;
            } else if bps > 10.0 {
                score *= 0.9;
            }
        }

        let delay_suggested = phase == SessionPhase::OpeningAuction;
        let action = if score >= 0.3 { Action::Buy } else { Action::Hold };

        let evidence = ExecutionEvidence {
            session_phase: phase,
            timing_score: score,
            spread_estimate_bps,
            delay_suggested,
        };

        let rationale = if delay_suggested {
            format!("timing {score:.2}; prefer waiting out the opening auction")
        } else {
            format!("timing {score:.2} in {phase:?}")
        };

        SpecialistRecommendation::new(AgentId::Execution, action, score, rationale)
            .with_evidence(serde_json::to_value(&evidence).unwrap_or_default())
    }
}

/// Rough quoted-spread estimate from the last few bars' high-low ranges:
/// a fixed fraction of the average range, in basis points of price.
fn spread_estimate_bps(ctx: &AgentContext) -> Option<f64> {
    let tail = ctx.bars.tail(5);
    if tail.is_empty() || ctx.price <= 0.0 {
        return None;
    }
    let avg_range = tail.iter().map(|b| b.high - b.low).sum::<f64>() / tail.len() as f64;
    let estimate = avg_range / ctx.price * 10_000.0 * 0.05;
    estimate.is_finite().then_some(estimate)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::{context, context_with};
    use chrono::{TimeZone, Utc};

    fn at_hour(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).unwrap()
    }

    #[test]
    fn session_phases() {
        assert_eq!(SessionPhase::from_utc(at_hour(11, 0)), SessionPhase::PreMarket);
        assert_eq!(
            SessionPhase::from_utc(at_hour(13, 45)),
            SessionPhase::OpeningAuction
        );
        assert_eq!(SessionPhase::from_utc(at_hour(16, 0)), SessionPhase::Regular);
        assert_eq!(SessionPhase::from_utc(at_hour(19, 30)), SessionPhase::ClosingHour);
        assert_eq!(SessionPhase::from_utc(at_hour(22, 0)), SessionPhase::AfterHours);
    }

    #[test]
    fn regular_session_is_confident() {
        let mut ctx = context(60);
        ctx.now = at_hour(16, 0);
        let rec = ExecutionAgent::new().analyze(&ctx);
        assert_eq!(rec.action, Action::Buy);
        assert!(rec.confidence > 0.6);
    }

    #[test]
    fn opening_auction_suggests_delay() {
        let mut ctx = context(60);
        ctx.now = at_hour(13, 40);
        let rec = ExecutionAgent::new().analyze(&ctx);
        assert!(rec.evidence["delay_suggested"].as_bool().unwrap());
        assert!(rec.confidence < 0.6);
    }

    #[test]
    fn after_hours_reads_hold() {
        let mut ctx = context(60);
        ctx.now = at_hour(23, 0);
        let rec = ExecutionAgent::new().analyze(&ctx);
        assert_eq!(rec.action, Action::Hold);
    }

    #[test]
    fn wide_ranges_downgrade_confidence() {
        let mut calm = context_with(60, |i| 500.0 + i as f64 * 0.01);
        calm.now = at_hour(16, 0);
        let calm_conf = ExecutionAgent::new().analyze(&calm).confidence;

        // Same trend, but bar ranges are ~60x wider relative to price.
        let mut wild = context_with(60, |i| 8.0 + i as f64 * 0.01);
        wild.now = at_hour(16, 0);
        let wild_conf = ExecutionAgent::new().analyze(&wild).confidence;

        assert!(wild_conf < calm_conf);
    }
}
