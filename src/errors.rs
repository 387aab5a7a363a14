// =============================================================================
// Typed engine errors
// =============================================================================
//
// Soft errors (LLM outage, a single specialist timeout, one broker failing)
// are handled at the component boundary and never surface here. The variants
// below are the matchable outcomes that cross component boundaries:
// the orchestrator pattern-matches on them to decide between skipping a
// symbol, recording a failure, or terminating the run.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The market-data provider exhausted every source for a symbol.
    /// Recovery: skip the symbol for this run.
    #[error("market data unavailable for {symbol}: {detail}")]
    DataUnavailable { symbol: String, detail: String },

    /// Persisted system state is older than the expiry threshold. Terminal:
    /// the operator must refresh state before the engine will trade again.
    #[error("system state expired: {age_hours:.1}h old (limit {limit_hours:.0}h)")]
    StateExpired { age_hours: f64, limit_hours: f64 },

    /// A trade was attempted while the portfolio breaker blocks trading.
    #[error("circuit breaker open: {reason}")]
    BreakerOpen { reason: String },

    /// The risk manager refused to size the trade.
    #[error("risk veto: {reason}")]
    RiskVeto { reason: String },

    /// Every configured broker failed (or was skipped with an open breaker).
    #[error("all brokers failed: {last_error}")]
    ExecutionFailed { last_error: String },

    /// The LLM interface is unreachable. Research degrades to HOLD.
    #[error("llm unavailable: {0}")]
    LlmUnavailable(String),

    /// A component exceeded its deadline.
    #[error("{component} timed out after {seconds}s")]
    Timeout { component: String, seconds: u64 },

    /// Pre-market health check failed; the run refuses to trade.
    #[error("pre-market health check failed: {reason}")]
    HealthCheckFailed { reason: String },

    /// Unexpected invariant violation. The run terminates, preserving state.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Process exit code for a run that ended with this error.
    ///
    /// 0 = completed, 2 = state expired, 3 = breaker halt, 4 = health check
    /// failed, 5 = unhandled error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StateExpired { .. } => 2,
            Self::BreakerOpen { .. } => 3,
            Self::HealthCheckFailed { .. } => 4,
            _ => 5,
        }
    }

    /// Whether this error ends the whole run (as opposed to one symbol's
    /// slice of the pipeline).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::StateExpired { .. }
                | Self::BreakerOpen { .. }
                | Self::HealthCheckFailed { .. }
                | Self::Fatal(_)
        )
    }
}
