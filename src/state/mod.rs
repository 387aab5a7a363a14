// =============================================================================
// Persistent system state — the engine's durable memory between runs
// =============================================================================
//
// Everything the engine must remember across daily invocations lives here:
// the portfolio snapshot, open positions, the archive of closed trades, the
// circuit-breaker record, and the learned RL parameters. The state store
// (see `store.rs`) is the single owner; every mutation flows through its
// serialized save path.
// =============================================================================

pub mod store;

pub use store::StateStore;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::breaker::BreakerStatus;
use crate::types::ExitReason;

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

/// Account-level snapshot, refreshed from the broker at run start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub as_of_utc: DateTime<Utc>,
}

impl Default for PortfolioSnapshot {
    fn default() -> Self {
        Self {
            equity: 0.0,
            cash: 0.0,
            buying_power: 0.0,
            as_of_utc: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Positions and closed trades
// ---------------------------------------------------------------------------

/// An open position. Created by the first fill, marked to market on every
/// run, archived to a `ClosedTrade` when quantity reaches zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub symbol: String,
    pub qty: f64,
    pub avg_entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub stop_loss_price: Option<f64>,
    #[serde(default)]
    pub take_profit_price: Option<f64>,
    /// Latest mark; refreshed by the mark-to-market pass.
    #[serde(default)]
    pub market_price: f64,
    #[serde(default)]
    pub unrealized_pnl_pct: f64,
    /// Discretized pipeline state at entry, for the RL reward update when
    /// the position closes.
    #[serde(default)]
    pub entry_state_key: Option<String>,
}

impl PositionRecord {
    pub fn notional(&self) -> f64 {
        self.qty * self.market_price.max(self.avg_entry_price)
    }

    pub fn unrealized_pnl(&self) -> f64 {
        (self.market_price - self.avg_entry_price) * self.qty
    }
}

/// Archived outcome of a position that reached zero quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub realized_pnl_pct: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub exit_reason: ExitReason,
}

// ---------------------------------------------------------------------------
// Breaker record and learned parameters
// ---------------------------------------------------------------------------

/// Persisted portfolio-breaker state, written after every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub status: BreakerStatus,
    pub reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            status: BreakerStatus::Closed,
            reason: None,
            tripped_at: None,
        }
    }
}

/// Q-values for one discretized state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QRow {
    #[serde(rename = "BUY")]
    pub buy: f64,
    #[serde(rename = "SELL")]
    pub sell: f64,
    #[serde(rename = "HOLD")]
    pub hold: f64,
}

/// Parameters learned across runs. Owned by the RL filter at runtime,
/// persisted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearnedParams {
    #[serde(default)]
    pub q_table: HashMap<String, QRow>,
}

// ---------------------------------------------------------------------------
// Staleness metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StalenessStatus {
    Fresh,
    Aging,
    Stale,
    Expired,
}

impl std::fmt::Display for StalenessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "FRESH"),
            Self::Aging => write!(f, "AGING"),
            Self::Stale => write!(f, "STALE"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Populated on load, cleared on save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessMeta {
    pub staleness_hours: f64,
    pub staleness_status: StalenessStatus,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// SystemState
// ---------------------------------------------------------------------------

/// The whole persisted engine state. `last_updated_utc` is monotonically
/// non-decreasing across saves; the store enforces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub portfolio: PortfolioSnapshot,
    #[serde(default)]
    pub positions: Vec<PositionRecord>,
    #[serde(default)]
    pub closed_trades: Vec<ClosedTrade>,
    #[serde(default)]
    pub breaker: BreakerRecord,
    #[serde(default)]
    pub learned_params: LearnedParams,
    pub last_updated_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<StalenessMeta>,
}

impl SystemState {
    pub fn new(portfolio: PortfolioSnapshot) -> Self {
        Self {
            portfolio,
            positions: Vec::new(),
            closed_trades: Vec::new(),
            breaker: BreakerRecord::default(),
            learned_params: LearnedParams::default(),
            last_updated_utc: Utc::now(),
            meta: None,
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&PositionRecord> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    /// Notional currently deployed in `symbol`, for the concentration cap.
    pub fn symbol_exposure(&self, symbol: &str) -> f64 {
        self.position(symbol).map(PositionRecord::notional).unwrap_or(0.0)
    }

    /// Remove a position and archive it as a closed trade.
    pub fn archive_position(
        &mut self,
        symbol: &str,
        exit_price: f64,
        exit_reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> Option<ClosedTrade> {
        let idx = self.positions.iter().position(|p| p.symbol == symbol)?;
        let pos = self.positions.remove(idx);

        let realized_pnl = (exit_price - pos.avg_entry_price) * pos.qty;
        let realized_pnl_pct = if pos.avg_entry_price > 0.0 {
            (exit_price - pos.avg_entry_price) / pos.avg_entry_price * 100.0
        } else {
            0.0
        };

        let trade = ClosedTrade {
            symbol: pos.symbol,
            qty: pos.qty,
            entry_price: pos.avg_entry_price,
            exit_price,
            realized_pnl,
            realized_pnl_pct,
            opened_at: pos.opened_at,
            closed_at,
            exit_reason,
        };
        self.closed_trades.push(trade.clone());
        Some(trade)
    }

    /// Aggregate statistics over the closed-trade archive. Feeds the Kelly
    /// estimate in the risk manager.
    pub fn journal_stats(&self) -> JournalStats {
        let total = self.closed_trades.len();
        if total == 0 {
            return JournalStats::default();
        }

        let wins: Vec<f64> = self
            .closed_trades
            .iter()
            .filter(|t| t.realized_pnl > 0.0)
            .map(|t| t.realized_pnl)
            .collect();
        let losses: Vec<f64> = self
            .closed_trades
            .iter()
            .filter(|t| t.realized_pnl <= 0.0)
            .map(|t| t.realized_pnl.abs())
            .collect();

        let win_rate = wins.len() as f64 / total as f64;
        let avg_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        };

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        JournalStats {
            total_trades: total,
            win_rate,
            avg_win,
            avg_loss,
            expectancy: win_rate * avg_win - (1.0 - win_rate) * avg_loss,
            profit_factor,
        }
    }

    /// Realized PnL from trades closed today (UTC), plus open unrealized.
    /// This is the quantity the daily-loss breaker watches.
    pub fn daily_pnl(&self, now: DateTime<Utc>) -> f64 {
        let today = now.date_naive();
        let realized: f64 = self
            .closed_trades
            .iter()
            .filter(|t| t.closed_at.date_naive() == today)
            .map(|t| t.realized_pnl)
            .sum();
        let unrealized: f64 = self.positions.iter().map(PositionRecord::unrealized_pnl).sum();
        realized + unrealized
    }

    /// Consecutive losing closed trades, counted back from the most recent.
    pub fn consecutive_losses(&self) -> u32 {
        self.closed_trades
            .iter()
            .rev()
            .take_while(|t| t.realized_pnl < 0.0)
            .count() as u32
    }
}

/// Trade journal aggregates.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JournalStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub expectancy: f64,
    pub profit_factor: f64,
}

impl JournalStats {
    /// Average win divided by average loss; the Kelly payoff ratio.
    pub fn payoff_ratio(&self) -> Option<f64> {
        (self.avg_loss > 0.0).then(|| self.avg_win / self.avg_loss)
    }
}
