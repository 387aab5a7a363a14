// =============================================================================
// RL Filter — tabular Q-learning over a discretized pipeline state
// =============================================================================
//
// A lightweight learned policy layered on top of the meta agent. The state
// key discretizes the pipeline's view of a symbol:
//
//   (regime, RSI decade bucket, MACD histogram sign, 3-state trend bucket)
//
// encoded as e.g. "LOW_VOL|r5|m+|t1". At decision time, with probability
// `epsilon`, the filter may override the meta action with its argmax action
// when the learned advantage clears the override threshold. After every
// closed trade it receives the realized risk-adjusted reward and applies
// the standard update with alpha=0.1, gamma=0.95.
//
// The Q-table is owned here at runtime and persisted through the state
// store's `learned_params`.
// =============================================================================

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use super::meta::Regime;
use crate::indicators::IndicatorSet;
use crate::state::{LearnedParams, QRow};
use crate::types::Action;

// ---------------------------------------------------------------------------
// State key
// ---------------------------------------------------------------------------

/// Discretized pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StateKey {
    pub regime: Regime,
    /// RSI bucket of 10 units: 0..=9 (missing RSI buckets to the middle).
    pub rsi_bucket: u8,
    /// -1, 0, +1 from the MACD histogram sign.
    pub macd_sign: i8,
    /// -1 below both SMAs, +1 above both, 0 mixed/unknown.
    pub trend_bucket: i8,
}

impl StateKey {
    pub fn from_indicators(regime: Regime, indicators: &IndicatorSet, price: f64) -> Self {
        let rsi_bucket = indicators
            .rsi
            .map(|rsi| ((rsi / 10.0) as u8).min(9))
            .unwrap_or(5);

        let macd_sign = indicators
            .macd
            .as_ref()
            .map(|m| {
                if m.histogram > 0.0 {
                    1
                } else if m.histogram < 0.0 {
                    -1
                } else {
                    0
                }
            })
            .unwrap_or(0);

        let trend_bucket = match (indicators.sma_20, indicators.sma_50) {
            (Some(s20), Some(s50)) if price > s20 && price > s50 => 1,
            (Some(s20), Some(s50)) if price < s20 && price < s50 => -1,
            _ => 0,
        };

        Self {
            regime,
            rsi_bucket,
            macd_sign,
            trend_bucket,
        }
    }

    /// Stable string encoding, used as the persisted Q-table key.
    pub fn encode(&self) -> String {
        let macd = match self.macd_sign {
            1 => "m+",
            -1 => "m-",
            _ => "m0",
        };
        format!(
            "{}|r{}|{}|t{}",
            self.regime.key(),
            self.rsi_bucket,
            macd,
            self.trend_bucket
        )
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RlConfig {
    pub enabled: bool,
    /// Exploration probability per decision.
    pub epsilon: f64,
    /// Learning rate.
    pub alpha: f64,
    /// Discount factor.
    pub gamma: f64,
    /// Minimum Q-advantage of the argmax action over the meta action
    /// before an override fires.
    pub override_threshold: f64,
    /// Fixed RNG seed for reproducible runs; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for RlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            epsilon: 0.1,
            alpha: 0.1,
            gamma: 0.95,
            override_threshold: 0.2,
            seed: None,
        }
    }
}

/// A fired override, for the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct RlOverride {
    pub state_key: String,
    pub meta_action: Action,
    pub override_action: Action,
    pub advantage: f64,
}

pub struct RlFilter {
    config: RlConfig,
    q: RwLock<HashMap<String, QRow>>,
    rng: Mutex<StdRng>,
}

impl RlFilter {
    pub fn new(config: RlConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            q: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn restore(&self, params: &LearnedParams) {
        *self.q.write() = params.q_table.clone();
        debug!(states = params.q_table.len(), "q-table restored");
    }

    pub fn to_learned_params(&self) -> LearnedParams {
        LearnedParams {
            q_table: self.q.read().clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Decision-time override
    // -------------------------------------------------------------------------

    /// Possibly override the meta action. Fires only when the epsilon draw
    /// selects exploration AND the learned argmax disagrees with the meta
    /// action by at least the override threshold.
    pub fn maybe_override(&self, key: &StateKey, meta_action: Action) -> Option<RlOverride> {
        if !self.config.enabled {
            return None;
        }
        if self.rng.lock().gen::<f64>() >= self.config.epsilon {
            return None;
        }

        let encoded = key.encode();
        let q = self.q.read();
        let row = q.get(&encoded)?;

        let (best_action, best_value) = argmax(row);
        if best_action == meta_action {
            return None;
        }

        let advantage = best_value - q_value(row, meta_action);
        if advantage < self.config.override_threshold {
            return None;
        }

        info!(
            state_key = %encoded,
            meta_action = %meta_action,
            override_action = %best_action,
            advantage = format!("{advantage:.3}"),
            "rl filter override"
        );
        Some(RlOverride {
            state_key: encoded,
            meta_action,
            override_action: best_action,
            advantage,
        })
    }

    // -------------------------------------------------------------------------
    // Learning
    // -------------------------------------------------------------------------

    /// Apply the Q-update for a closed trade's realized reward. The closed
    /// trade is terminal for its episode, so the bootstrap term uses the
    /// same state's best value.
    pub fn update(&self, state_key: &str, action: Action, reward: f64) {
        let mut q = self.q.write();
        let row = q.entry(state_key.to_string()).or_default();

        let (_, best_next) = argmax(row);
        let current = q_value(row, action);
        let updated =
            current + self.config.alpha * (reward + self.config.gamma * best_next - current);

        set_q_value(row, action, updated);
        debug!(
            state_key,
            action = %action,
            reward = format!("{reward:.3}"),
            q = format!("{updated:.4}"),
            "q-table updated"
        );
    }

    #[cfg(test)]
    pub fn q_value_for(&self, state_key: &str, action: Action) -> f64 {
        self.q
            .read()
            .get(state_key)
            .map(|row| q_value(row, action))
            .unwrap_or(0.0)
    }

    #[cfg(test)]
    pub fn seed_q(&self, state_key: &str, row: QRow) {
        self.q.write().insert(state_key.to_string(), row);
    }
}

fn q_value(row: &QRow, action: Action) -> f64 {
    match action {
        Action::Buy => row.buy,
        Action::Sell => row.sell,
        Action::Hold => row.hold,
    }
}

fn set_q_value(row: &mut QRow, action: Action, value: f64) {
    match action {
        Action::Buy => row.buy = value,
        Action::Sell => row.sell = value,
        Action::Hold => row.hold = value,
    }
}

/// Best action and value; HOLD wins ties (never trade on indifference).
fn argmax(row: &QRow) -> (Action, f64) {
    let mut best = (Action::Hold, row.hold);
    if row.buy > best.1 {
        best = (Action::Buy, row.buy);
    }
    if row.sell > best.1 {
        best = (Action::Sell, row.sell);
    }
    best
}

impl std::fmt::Debug for RlFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RlFilter")
            .field("config", &self.config)
            .field("states", &self.q.read().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StateKey {
        StateKey {
            regime: Regime::LowVol,
            rsi_bucket: 5,
            macd_sign: 1,
            trend_bucket: 1,
        }
    }

    /// epsilon = 1.0 forces every decision into the exploration branch.
    fn always_exploring() -> RlFilter {
        RlFilter::new(RlConfig {
            epsilon: 1.0,
            seed: Some(7),
            ..RlConfig::default()
        })
    }

    #[test]
    fn key_encoding_is_stable() {
        assert_eq!(key().encode(), "LOW_VOL|r5|m+|t1");
        let bearish = StateKey {
            regime: Regime::Crisis,
            rsi_bucket: 2,
            macd_sign: -1,
            trend_bucket: -1,
        };
        assert_eq!(bearish.encode(), "CRISIS|r2|m-|t-1");
    }

    #[test]
    fn override_fires_when_q_strongly_prefers_another_action() {
        let filter = always_exploring();
        filter.seed_q(
            &key().encode(),
            QRow {
                buy: 0.9,
                sell: -0.4,
                hold: 0.0,
            },
        );

        let fired = filter.maybe_override(&key(), Action::Hold).unwrap();
        assert_eq!(fired.override_action, Action::Buy);
        assert!((fired.advantage - 0.9).abs() < 1e-9);
    }

    #[test]
    fn no_override_below_advantage_threshold() {
        let filter = always_exploring();
        filter.seed_q(
            &key().encode(),
            QRow {
                buy: 0.1,
                sell: 0.0,
                hold: 0.0,
            },
        );
        assert!(filter.maybe_override(&key(), Action::Hold).is_none());
    }

    #[test]
    fn no_override_when_argmax_agrees_with_meta() {
        let filter = always_exploring();
        filter.seed_q(
            &key().encode(),
            QRow {
                buy: 0.9,
                sell: 0.0,
                hold: 0.0,
            },
        );
        assert!(filter.maybe_override(&key(), Action::Buy).is_none());
    }

    #[test]
    fn no_override_for_unseen_state() {
        let filter = always_exploring();
        assert!(filter.maybe_override(&key(), Action::Hold).is_none());
    }

    #[test]
    fn epsilon_zero_never_overrides() {
        let filter = RlFilter::new(RlConfig {
            epsilon: 0.0,
            seed: Some(7),
            ..RlConfig::default()
        });
        filter.seed_q(
            &key().encode(),
            QRow {
                buy: 5.0,
                sell: 0.0,
                hold: 0.0,
            },
        );
        for _ in 0..100 {
            assert!(filter.maybe_override(&key(), Action::Hold).is_none());
        }
    }

    #[test]
    fn disabled_filter_never_overrides() {
        let filter = RlFilter::new(RlConfig {
            enabled: false,
            epsilon: 1.0,
            seed: Some(7),
            ..RlConfig::default()
        });
        filter.seed_q(
            &key().encode(),
            QRow {
                buy: 5.0,
                sell: 0.0,
                hold: 0.0,
            },
        );
        assert!(filter.maybe_override(&key(), Action::Hold).is_none());
    }

    #[test]
    fn positive_reward_raises_q_value() {
        let filter = RlFilter::new(RlConfig {
            seed: Some(7),
            ..RlConfig::default()
        });
        let encoded = key().encode();

        let before = filter.q_value_for(&encoded, Action::Buy);
        filter.update(&encoded, Action::Buy, 1.5);
        let after = filter.q_value_for(&encoded, Action::Buy);
        assert!(after > before);
        // First update from zero: alpha * reward.
        assert!((after - 0.15).abs() < 1e-9);
    }

    #[test]
    fn repeated_rewards_converge_toward_target() {
        let filter = RlFilter::new(RlConfig {
            seed: Some(7),
            gamma: 0.0, // isolate the reward-tracking behaviour
            ..RlConfig::default()
        });
        let encoded = key().encode();
        for _ in 0..500 {
            filter.update(&encoded, Action::Buy, 1.0);
        }
        let q = filter.q_value_for(&encoded, Action::Buy);
        assert!((q - 1.0).abs() < 0.01, "q should converge to reward, got {q}");
    }

    #[test]
    fn learned_params_roundtrip() {
        let filter = RlFilter::new(RlConfig::default());
        filter.update("LOW_VOL|r5|m+|t1", Action::Buy, 0.8);
        filter.update("CRISIS|r2|m-|t-1", Action::Sell, -0.3);

        let params = filter.to_learned_params();
        assert_eq!(params.q_table.len(), 2);

        let restored = RlFilter::new(RlConfig::default());
        restored.restore(&params);
        assert!(
            (restored.q_value_for("LOW_VOL|r5|m+|t1", Action::Buy)
                - filter.q_value_for("LOW_VOL|r5|m+|t1", Action::Buy))
            .abs()
                < 1e-12
        );
    }

    #[test]
    fn argmax_ties_favour_hold() {
        let row = QRow {
            buy: 0.0,
            sell: 0.0,
            hold: 0.0,
        };
        assert_eq!(argmax(&row).0, Action::Hold);
    }
}
