// =============================================================================
// Research Agent — fundamentals & sentiment through the LLM seam
// =============================================================================
//
// Builds a compact market brief for the symbol, asks the configured LLM for
// a verdict, and parses the reply into an action + confidence. Any failure
// on the LLM side — outage, timeout, unparseable reply — fails soft: the
// agent returns HOLD with low confidence and the pipeline moves on.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, warn};

use super::{AgentContext, AgentId, SpecialistRecommendation};
use crate::llm::{LlmClient, LlmOptions};
use crate::types::Action;

/// Confidence reported when the LLM is unreachable; low enough that the
/// weighted consensus effectively ignores the vote.
const UNAVAILABLE_CONFIDENCE: f64 = 0.1;

pub struct ResearchAgent {
    llm: Arc<dyn LlmClient>,
    options: LlmOptions,
}

impl ResearchAgent {
    pub fn new(llm: Arc<dyn LlmClient>, options: LlmOptions) -> Self {
        Self { llm, options }
    }

    pub async fn analyze(&self, ctx: &AgentContext) -> SpecialistRecommendation {
        let prompt = self.build_prompt(ctx);

        let analysis = match self.llm.analyze(&prompt, &self.options).await {
            Ok(a) => a,
            Err(e) => {
                warn!(symbol = %ctx.symbol, error = %e, "llm unavailable — research degrades to HOLD");
                return SpecialistRecommendation::new(
                    AgentId::Research,
                    Action::Hold,
                    UNAVAILABLE_CONFIDENCE,
                    "llm unavailable",
                );
            }
        };

        let (action, parsed_confidence) = parse_verdict(&analysis.text);
        let confidence = analysis
            .confidence_hint
            .unwrap_or(parsed_confidence)
            .clamp(0.0, 1.0);

        debug!(
            symbol = %ctx.symbol,
            action = %action,
            confidence = format!("{confidence:.2}"),
            "research verdict"
        );

        SpecialistRecommendation::new(
            AgentId::Research,
            action,
            confidence,
            format!("llm verdict: {}", first_line(&analysis.text)),
        )
        .with_evidence(serde_json::json!({ "response": analysis.text }))
    }

    fn build_prompt(&self, ctx: &AgentContext) -> String {
        let ind = &ctx.indicators;
        format!(
            "You are an equity research analyst. Assess {symbol} for a one-day \
             swing position.\n\
             Latest price: {price:.2}\n\
             RSI(14): {rsi}\n\
             MACD histogram: {macd}\n\
             Trend strength: {trend}\n\
             Market regime: {regime}\n\
             Reply with exactly one line: VERDICT: BUY|SELL|HOLD CONFIDENCE: 0.0-1.0 \
             followed by a one-sentence rationale.",
            symbol = ctx.symbol,
            price = ctx.price,
            rsi = fmt_opt(ind.rsi),
            macd = fmt_opt(ind.macd.as_ref().map(|m| m.histogram)),
            trend = fmt_opt(ind.trend_strength),
            regime = ctx.regime,
        )
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

/// Pull `VERDICT: <action>` and `CONFIDENCE: <x>` out of the reply. An
/// unparseable reply reads as HOLD with token confidence — the model said
/// something, but nothing we can act on.
fn parse_verdict(text: &str) -> (Action, f64) {
    let upper = text.to_uppercase();

    let action = if upper.contains("VERDICT: BUY") || upper.contains("VERDICT:BUY") {
        Action::Buy
    } else if upper.contains("VERDICT: SELL") || upper.contains("VERDICT:SELL") {
        Action::Sell
    } else if upper.contains("VERDICT: HOLD") || upper.contains("VERDICT:HOLD") {
        Action::Hold
    } else {
        return (Action::Hold, UNAVAILABLE_CONFIDENCE);
    };

    let confidence = upper
        .split("CONFIDENCE:")
        .nth(1)
        .and_then(|rest| {
            rest.trim_start()
                .split(|c: char| c.is_whitespace())
                .next()
                .and_then(|tok| tok.trim_end_matches(|c: char| !c.is_ascii_digit()).parse::<f64>().ok())
        })
        .unwrap_or(0.5);

    (action, confidence.clamp(0.0, 1.0))
}

impl std::fmt::Debug for ResearchAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResearchAgent")
            .field("options", &self.options)
            .finish()
    }
}
