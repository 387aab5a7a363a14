// =============================================================================
// Risk Manager — position sizing, stop placement, and vetoes
// =============================================================================
//
// Sizing applies an ordered chain of rules, each of which can only shrink
// the position (never grow it):
//
//   1. base fraction of equity
//   2. Kelly cap (with a safety multiplier in [0.25, 0.5])
//   3. volatility adjustment, target_vol / observed_vol clamped [0.25, 2.0]
//   4. regime multiplier
//   5. circuit-breaker scale factor
//   6. per-symbol concentration cap (hard veto when already at cap)
//
// The stop-loss lands `stop_atr_mult` ATRs away from entry on the losing
// side; the take-profit mirrors it scaled by the regime's reward:risk.
// =============================================================================

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::agents::meta::Regime;
use crate::errors::EngineError;
use crate::state::JournalStats;
use crate::types::{Side, TimeInForce};

/// Kelly needs a minimum sample before its estimate means anything.
const MIN_TRADES_FOR_KELLY: usize = 10;
/// Refuse to submit dust orders.
const MIN_NOTIONAL: f64 = 1.0;

// ---------------------------------------------------------------------------
// Position request
// ---------------------------------------------------------------------------

/// A fully sized order the executor can submit.
///
/// Invariant: exactly one of `notional` / `qty` is populated. The two
/// constructors are the only way to build one.
#[derive(Debug, Clone, Serialize)]
pub struct PositionRequest {
    /// Client-generated id; adapters pass it through as the broker
    /// client-order-id so retries and failover never double-fill.
    pub request_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub notional: Option<f64>,
    pub qty: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub tif: TimeInForce,
}

impl PositionRequest {
    pub fn by_notional(symbol: impl Into<String>, side: Side, notional: f64) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            notional: Some(notional),
            qty: None,
            stop_loss_price: None,
            take_profit_price: None,
            tif: TimeInForce::Day,
        }
    }

    pub fn by_qty(symbol: impl Into<String>, side: Side, qty: f64) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            notional: None,
            qty: Some(qty),
            stop_loss_price: None,
            take_profit_price: None,
            tif: TimeInForce::Day,
        }
    }

    pub fn with_stop(mut self, stop: f64) -> Self {
        self.stop_loss_price = Some(stop);
        self
    }

    pub fn with_take_profit(mut self, tp: f64) -> Self {
        self.take_profit_price = Some(tp);
        self
    }
}

// ---------------------------------------------------------------------------
// Configuration and inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Base position size as a fraction of equity.
    pub base_pct: f64,
    /// Kelly safety multiplier; clamped to [0.25, 0.5] at construction.
    pub kelly_safety: f64,
    /// Annualised volatility the sizing is normalised against.
    pub target_vol: f64,
    /// Per-symbol cap as a fraction of equity.
    pub max_symbol_pct: f64,
    /// Stop distance in ATRs.
    pub stop_atr_mult: f64,
    /// Hard-veto trades sized from stale (cache-served) data instead of
    /// merely reducing pipeline confidence.
    pub veto_on_stale: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            base_pct: 0.01,
            kelly_safety: 0.5,
            target_vol: 0.15,
            max_symbol_pct: 0.10,
            stop_atr_mult: 2.0,
            veto_on_stale: false,
        }
    }
}

impl RiskConfig {
    pub fn sanitized(mut self) -> Self {
        self.kelly_safety = self.kelly_safety.clamp(0.25, 0.5);
        self
    }
}

/// Everything sizing needs for one trade.
#[derive(Debug, Clone)]
pub struct SizingInputs<'a> {
    pub symbol: &'a str,
    pub side: Side,
    pub equity: f64,
    pub price: f64,
    pub atr: f64,
    /// Annualised realized vol of the symbol.
    pub observed_vol: Option<f64>,
    pub regime: Regime,
    pub stats: &'a JournalStats,
    /// Scale from the portfolio breaker's gate decision.
    pub breaker_scale: f64,
    /// Notional already deployed in this symbol.
    pub symbol_exposure: f64,
    /// Whether the bars behind this trade came from a stale cache serve.
    pub data_stale: bool,
}

/// The sizing decision with its arithmetic trail, for the audit record.
#[derive(Debug, Clone, Serialize)]
pub struct SizingBreakdown {
    pub base_notional: f64,
    pub kelly_fraction: Option<f64>,
    pub vol_adjustment: f64,
    pub regime_multiplier: f64,
    pub breaker_scale: f64,
    pub final_notional: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
}

// ---------------------------------------------------------------------------
// Risk manager
// ---------------------------------------------------------------------------

pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config: config.sanitized(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Size an entry or veto it. Every rule below can only shrink the
    /// notional computed by the rule before it.
    pub fn size_entry(
        &self,
        inputs: &SizingInputs<'_>,
    ) -> Result<(PositionRequest, SizingBreakdown), EngineError> {
        let veto = |reason: String| EngineError::RiskVeto { reason };

        if inputs.equity <= 0.0 {
            return Err(veto("no equity".to_string()));
        }
        if inputs.price <= 0.0 || !inputs.price.is_finite() {
            return Err(veto(format!("invalid price {}", inputs.price)));
        }
        if inputs.atr <= 0.0 || !inputs.atr.is_finite() {
            return Err(veto("ATR unavailable".to_string()));
        }
        if inputs.data_stale && self.config.veto_on_stale {
            return Err(veto("stale market data".to_string()));
        }

        // 1. Base fraction.
        let base_notional = inputs.equity * self.config.base_pct;
        let mut notional = base_notional;

        // 2. Kelly cap.
        let kelly_fraction = kelly_fraction(inputs.stats);
        if let Some(kelly) = kelly_fraction {
            let kelly_notional = inputs.equity * (kelly * self.config.kelly_safety).max(0.0);
            notional = notional.min(kelly_notional);
            if notional <= 0.0 {
                return Err(veto(format!(
                    "negative edge: kelly fraction {kelly:.3} with win rate {:.2}",
                    inputs.stats.win_rate
                )));
            }
        }

        // 3. Volatility adjustment (shrink-only: clamped ratio, capped at 1).
        let vol_adjustment = inputs
            .observed_vol
            .filter(|v| *v > 0.0)
            .map(|v| (self.config.target_vol / v).clamp(0.25, 2.0))
            .unwrap_or(1.0)
            .min(1.0);
        notional *= vol_adjustment;

        // 4. Regime multiplier (capped at 1 for the same reason).
        let regime_multiplier = inputs.regime.size_multiplier();
        if regime_multiplier <= 0.0 {
            return Err(veto(format!("{} regime: no new exposure", inputs.regime)));
        }
        notional *= regime_multiplier.min(1.0);

        // 5. Breaker scale.
        if inputs.breaker_scale <= 0.0 {
            return Err(veto("breaker scale factor is zero".to_string()));
        }
        notional *= inputs.breaker_scale.clamp(0.0, 1.0);

        // 6. Concentration cap.
        let cap = inputs.equity * self.config.max_symbol_pct;
        let headroom = cap - inputs.symbol_exposure;
        if headroom <= 0.0 {
            return Err(veto(format!(
                "{} already at concentration cap ({:.0} deployed, cap {:.0})",
                inputs.symbol, inputs.symbol_exposure, cap
            )));
        }
        notional = notional.min(headroom);

        if notional < MIN_NOTIONAL {
            return Err(veto(format!("notional {notional:.2} below minimum")));
        }

        // 7. Protective levels from ATR.
        let stop_distance = self.config.stop_atr_mult * inputs.atr;
        let (reward, risk_unit) = inputs.regime.reward_risk();
        let tp_distance = stop_distance * if risk_unit > 0.0 { reward / risk_unit } else { 1.0 };
        let (stop_loss_price, take_profit_price) = match inputs.side {
            Side::Buy => (inputs.price - stop_distance, inputs.price + tp_distance),
            Side::Sell => (inputs.price + stop_distance, inputs.price - tp_distance),
        };
        if stop_loss_price <= 0.0 {
            return Err(veto(format!(
                "stop {stop_loss_price:.2} not meaningful at price {:.2}",
                inputs.price
            )));
        }

        let breakdown = SizingBreakdown {
            base_notional,
            kelly_fraction,
            vol_adjustment,
            regime_multiplier,
            breaker_scale: inputs.breaker_scale,
            final_notional: notional,
            stop_loss_price,
            take_profit_price,
        };

        info!(
            symbol = inputs.symbol,
            side = %inputs.side,
            notional = format!("{notional:.2}"),
            stop = format!("{stop_loss_price:.2}"),
            take_profit = format!("{take_profit_price:.2}"),
            regime = %inputs.regime,
            "position sized"
        );
        debug!(?breakdown, "sizing breakdown");

        let request = PositionRequest::by_notional(inputs.symbol, inputs.side, notional)
            .with_stop(stop_loss_price)
            .with_take_profit(take_profit_price);
        Ok((request, breakdown))
    }
}

/// Kelly fraction from the trade journal: `w - (1 - w) / payoff`. `None`
/// until the journal holds enough trades to estimate from.
fn kelly_fraction(stats: &JournalStats) -> Option<f64> {
    if stats.total_trades < MIN_TRADES_FOR_KELLY {
        return None;
    }
    let payoff = stats.payoff_ratio()?;
    if payoff <= 0.0 {
        return None;
    }
    Some(stats.win_rate - (1.0 - stats.win_rate) / payoff)
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("config", &self.config)
            .finish()
    }
}
