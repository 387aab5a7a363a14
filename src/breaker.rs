// =============================================================================
// Portfolio Circuit Breaker — the authoritative "may trade?" gate
// =============================================================================
//
// State machine:
//
//   CLOSED     trading permitted
//   OPEN       trading blocked
//   HALF_OPEN  one probe trade permitted
//
//   CLOSED → OPEN       daily loss breach, consecutive-loss breach, API-error
//                       breach, or manual trip
//   OPEN → HALF_OPEN    cooldown elapsed, or the UTC trading day rolled over
//   HALF_OPEN → CLOSED  probe trade closed profitably
//   HALF_OPEN → OPEN    probe trade closed at a loss
//
// On top of the hard gate, a tiered advisory ladder shapes what the risk
// manager is allowed to do as the day's losses deepen:
//
//   CAUTION   loss >= 1%   position sizes halved
//   WARNING   loss >= 2%   no new entries
//   CRITICAL  loss >= 3%   exits only
//   HALT      loss >= 5%   full stop, manual reset required
//
// The breaker record is persisted through the state store after every
// transition; the orchestrator restores it at run start.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::state::BreakerRecord;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Advisory tier derived from the day's loss fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LossTier {
    Normal,
    Caution,
    Warning,
    Critical,
    Halt,
}

/// What the caller wants to do; exits stay permitted deeper into the
/// tier ladder than new entries.
#[derive(Debug, Clone, Copy)]
pub struct TradeIntent<'a> {
    pub symbol: &'a str,
    pub is_exit: bool,
}

/// Verdict of `may_trade`.
#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub allow: bool,
    /// Sizing multiplier in [0, 1] the risk manager must apply.
    pub scale_factor: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GateDecision {
    fn allow(scale_factor: f64) -> Self {
        Self {
            allow: true,
            scale_factor,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            scale_factor: 0.0,
            reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Daily loss fraction that trips the breaker (e.g. 0.02 = 2%).
    pub daily_loss_pct: f64,
    pub max_consec_losses: u32,
    pub max_api_errors: u32,
    /// How long OPEN lasts before a probe is permitted.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            daily_loss_pct: 0.02,
            max_consec_losses: 3,
            max_api_errors: 5,
            cooldown: Duration::from_secs(3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

struct Inner {
    status: BreakerStatus,
    tripped_reason: Option<String>,
    tripped_at: Option<DateTime<Utc>>,
    /// Daily starting equity, denominates loss percentages.
    capital: f64,
    daily_pnl: f64,
    consecutive_losses: u32,
    api_errors_today: u32,
    current_date: NaiveDate,
    /// Set when a HALF_OPEN probe has been handed out and not yet resolved.
    probe_outstanding: bool,
    manual_halt: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, capital: f64) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                status: BreakerStatus::Closed,
                tripped_reason: None,
                tripped_at: None,
                capital: capital.max(0.0),
                daily_pnl: 0.0,
                consecutive_losses: 0,
                api_errors_today: 0,
                current_date: Utc::now().date_naive(),
                probe_outstanding: false,
                manual_halt: false,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Restore the persisted record plus the counters the state archive
    /// implies (consecutive losses, today's realized + unrealized PnL).
    pub fn restore(
        &self,
        record: &BreakerRecord,
        capital: f64,
        daily_pnl: f64,
        consecutive_losses: u32,
        now: DateTime<Utc>,
    ) {
        let mut s = self.inner.write();
        s.status = record.status;
        s.tripped_reason = record.reason.clone();
        s.tripped_at = record.tripped_at;
        s.capital = capital.max(0.0);
        s.daily_pnl = daily_pnl;
        s.consecutive_losses = consecutive_losses;
        s.current_date = now.date_naive();
        if s.status == BreakerStatus::Closed {
            self.evaluate_triggers(&mut s, now);
        }
        drop(s);
        self.advance_clock(now);
    }

    pub fn snapshot(&self) -> BreakerRecord {
        let s = self.inner.read();
        BreakerRecord {
            status: s.status,
            reason: s.tripped_reason.clone(),
            tripped_at: s.tripped_at,
        }
    }

    pub fn status(&self) -> BreakerStatus {
        self.inner.read().status
    }

    // -------------------------------------------------------------------------
    // Clock
    // -------------------------------------------------------------------------

    /// Apply time-based transitions: daily counter reset on date roll, and
    /// OPEN → HALF_OPEN after the cooldown or at the next trading day.
    pub fn advance_clock(&self, now: DateTime<Utc>) {
        let mut s = self.inner.write();

        let today = now.date_naive();
        let date_rolled = today != s.current_date;
        if date_rolled {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                "date rolled — resetting daily breaker counters"
            );
            s.daily_pnl = 0.0;
            s.api_errors_today = 0;
            s.current_date = today;
        }

        if s.status == BreakerStatus::Open && !s.manual_halt {
            let cooled = s
                .tripped_at
                .map(|t| now.signed_duration_since(t).to_std().unwrap_or_default() >= self.config.cooldown)
                .unwrap_or(true);
            if date_rolled || cooled {
                info!("breaker OPEN → HALF_OPEN (probe permitted)");
                s.status = BreakerStatus::HalfOpen;
                s.probe_outstanding = false;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Event recording
    // -------------------------------------------------------------------------

    /// Record the realized PnL of a closed trade. Drives the consecutive-
    /// loss trigger and resolves HALF_OPEN probes.
    pub fn record_closed_trade(&self, pnl: f64, now: DateTime<Utc>) {
        self.advance_clock(now);
        let mut s = self.inner.write();

        s.daily_pnl += pnl;
        if pnl >= 0.0 {
            s.consecutive_losses = 0;
        } else {
            s.consecutive_losses += 1;
        }

        match s.status {
            BreakerStatus::HalfOpen => {
                if pnl > 0.0 {
                    info!(pnl, "probe trade profitable — breaker HALF_OPEN → CLOSED");
                    s.status = BreakerStatus::Closed;
                    s.tripped_reason = None;
                    s.tripped_at = None;
                } else {
                    warn!(pnl, "probe trade lost — breaker HALF_OPEN → OPEN");
                    s.status = BreakerStatus::Open;
                    s.tripped_at = Some(now);
                    s.tripped_reason = Some("probe_loss".to_string());
                }
                s.probe_outstanding = false;
            }
            BreakerStatus::Closed => {
                self.evaluate_triggers(&mut s, now);
            }
            BreakerStatus::Open => {}
        }
    }

    /// Refresh the unrealized component of today's PnL (mark-to-market).
    pub fn record_daily_pnl(&self, daily_pnl: f64, now: DateTime<Utc>) {
        self.advance_clock(now);
        let mut s = self.inner.write();
        s.daily_pnl = daily_pnl;
        if s.status == BreakerStatus::Closed {
            self.evaluate_triggers(&mut s, now);
        }
    }

    /// Count an upstream API failure (market data or broker). Enough of
    /// them in one day trips the breaker.
    pub fn record_api_error(&self, now: DateTime<Utc>) {
        self.advance_clock(now);
        let mut s = self.inner.write();
        s.api_errors_today += 1;
        if s.status == BreakerStatus::Closed {
            self.evaluate_triggers(&mut s, now);
        }
    }

    /// Operator-initiated trip. Clears only through `reset_manual`.
    pub fn trip_manual(&self, reason: impl Into<String>, now: DateTime<Utc>) {
        let mut s = self.inner.write();
        let reason = reason.into();
        warn!(reason = %reason, "breaker manually tripped");
        s.status = BreakerStatus::Open;
        s.manual_halt = true;
        s.tripped_reason = Some(reason);
        s.tripped_at = Some(now);
    }

    /// Operator reset after a manual trip or a HALT-tier stop.
    pub fn reset_manual(&self) {
        let mut s = self.inner.write();
        info!("breaker manually reset — CLOSED");
        s.status = BreakerStatus::Closed;
        s.manual_halt = false;
        s.tripped_reason = None;
        s.tripped_at = None;
        s.probe_outstanding = false;
    }

    fn evaluate_triggers(&self, s: &mut Inner, now: DateTime<Utc>) {
        let loss_fraction = self.loss_fraction(s);

        let reason = if loss_fraction >= self.config.daily_loss_pct {
            Some(format!(
                "daily_loss: {:.2}% (limit {:.2}%)",
                loss_fraction * 100.0,
                self.config.daily_loss_pct * 100.0
            ))
        } else if s.consecutive_losses >= self.config.max_consec_losses {
            Some(format!(
                "consecutive_losses: {} (limit {})",
                s.consecutive_losses, self.config.max_consec_losses
            ))
        } else if s.api_errors_today >= self.config.max_api_errors {
            Some(format!(
                "api_errors: {} (limit {})",
                s.api_errors_today, self.config.max_api_errors
            ))
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!(reason = %reason, "breaker CLOSED → OPEN");
            s.status = BreakerStatus::Open;
            s.tripped_reason = Some(reason);
            s.tripped_at = Some(now);
        }
    }

    fn loss_fraction(&self, s: &Inner) -> f64 {
        if s.capital <= 0.0 {
            return 0.0;
        }
        (-s.daily_pnl / s.capital).max(0.0)
    }

    // -------------------------------------------------------------------------
    // The gate
    // -------------------------------------------------------------------------

    /// Current advisory tier from today's loss fraction.
    pub fn tier(&self) -> LossTier {
        let s = self.inner.read();
        if s.manual_halt {
            return LossTier::Halt;
        }
        let loss = self.loss_fraction(&s);
        if loss >= 0.05 {
            LossTier::Halt
        } else if loss >= 0.03 {
            LossTier::Critical
        } else if loss >= 0.02 {
            LossTier::Warning
        } else if loss >= 0.01 {
            LossTier::Caution
        } else {
            LossTier::Normal
        }
    }

    /// The authoritative predicate. Returns allow/deny plus the sizing
    /// scale factor the risk manager must honour.
    pub fn may_trade(&self, intent: &TradeIntent<'_>) -> GateDecision {
        let tier = self.tier();
        let s = self.inner.read();

        if s.manual_halt || tier == LossTier::Halt {
            return GateDecision::deny(
                s.tripped_reason
                    .clone()
                    .unwrap_or_else(|| "halt: daily loss beyond hard stop".to_string()),
            );
        }

        match s.status {
            BreakerStatus::Open => {
                return GateDecision::deny(
                    s.tripped_reason
                        .clone()
                        .unwrap_or_else(|| "breaker open".to_string()),
                );
            }
            BreakerStatus::HalfOpen => {
                if intent.is_exit {
                    // Closing positions never counts against the probe.
                    return GateDecision::allow(1.0);
                }
                if s.probe_outstanding {
                    return GateDecision::deny("probe already in flight".to_string());
                }
                drop(s);
                self.inner.write().probe_outstanding = true;
                return GateDecision::allow(0.5);
            }
            BreakerStatus::Closed => {}
        }

        match tier {
            LossTier::Normal => GateDecision::allow(1.0),
            LossTier::Caution => GateDecision::allow(0.5),
            LossTier::Warning if intent.is_exit => GateDecision::allow(1.0),
            LossTier::Warning => GateDecision::deny("warning tier: no new entries"),
            LossTier::Critical if intent.is_exit => GateDecision::allow(1.0),
            LossTier::Critical => GateDecision::deny("critical tier: exits only"),
            LossTier::Halt => GateDecision::deny("halt"),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.inner.read();
        f.debug_struct("CircuitBreaker")
            .field("status", &s.status)
            .field("daily_pnl", &s.daily_pnl)
            .field("consecutive_losses", &s.consecutive_losses)
            .field("api_errors_today", &s.api_errors_today)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default(), 100_000.0)
    }

    fn entry_intent() -> TradeIntent<'static> {
        TradeIntent {
            symbol: "SPY",
            is_exit: false,
        }
    }

    #[test]
    fn starts_closed_and_allows() {
        let b = breaker();
        assert_eq!(b.status(), BreakerStatus::Closed);
        let gate = b.may_trade(&entry_intent());
        assert!(gate.allow);
        assert_eq!(gate.scale_factor, 1.0);
    }

    #[test]
    fn trips_open_after_exact_consecutive_loss_limit() {
        let b = breaker();
        let now = Utc::now();
        b.record_closed_trade(-100.0, now);
        b.record_closed_trade(-100.0, now);
        assert_eq!(b.status(), BreakerStatus::Closed);

        b.record_closed_trade(-100.0, now);
        assert_eq!(b.status(), BreakerStatus::Open);
        let snap = b.snapshot();
        assert!(snap.reason.unwrap().starts_with("consecutive_losses"));

        let gate = b.may_trade(&entry_intent());
        assert!(!gate.allow);
    }

    #[test]
    fn win_resets_consecutive_loss_count() {
        let b = breaker();
        let now = Utc::now();
        b.record_closed_trade(-100.0, now);
        b.record_closed_trade(-100.0, now);
        b.record_closed_trade(50.0, now);
        b.record_closed_trade(-100.0, now);
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[test]
    fn daily_loss_trips_breaker() {
        let b = breaker();
        let now = Utc::now();
        // 2% of 100k = 2000.
        b.record_daily_pnl(-2_100.0, now);
        assert_eq!(b.status(), BreakerStatus::Open);
        assert!(b.snapshot().reason.unwrap().starts_with("daily_loss"));
    }

    #[test]
    fn api_errors_trip_breaker() {
        let b = breaker();
        let now = Utc::now();
        for _ in 0..4 {
            b.record_api_error(now);
        }
        assert_eq!(b.status(), BreakerStatus::Closed);
        b.record_api_error(now);
        assert_eq!(b.status(), BreakerStatus::Open);
        assert!(b.snapshot().reason.unwrap().starts_with("api_errors"));
    }

    #[test]
    fn open_goes_half_open_after_cooldown() {
        let config = BreakerConfig {
            cooldown: Duration::from_secs(0),
            ..BreakerConfig::default()
        };
        let b = CircuitBreaker::new(config, 100_000.0);
        let now = Utc::now();
        b.record_daily_pnl(-3_000.0, now);
        assert_eq!(b.status(), BreakerStatus::Open);

        b.advance_clock(now + chrono::Duration::seconds(1));
        assert_eq!(b.status(), BreakerStatus::HalfOpen);
    }

    #[test]
    fn open_goes_half_open_on_next_trading_day() {
        let b = breaker();
        let now = Utc::now();
        for _ in 0..3 {
            b.record_closed_trade(-100.0, now);
        }
        assert_eq!(b.status(), BreakerStatus::Open);

        b.advance_clock(now + chrono::Duration::days(1));
        assert_eq!(b.status(), BreakerStatus::HalfOpen);
    }

    #[test]
    fn half_open_probe_win_closes_probe_loss_reopens() {
        let b = breaker();
        let now = Utc::now();
        for _ in 0..3 {
            b.record_closed_trade(-100.0, now);
        }
        let tomorrow = now + chrono::Duration::days(1);
        b.advance_clock(tomorrow);
        assert_eq!(b.status(), BreakerStatus::HalfOpen);

        // Losing probe reopens.
        b.record_closed_trade(-50.0, tomorrow);
        assert_eq!(b.status(), BreakerStatus::Open);

        // Next day: half-open again, winning probe closes.
        let day_after = tomorrow + chrono::Duration::days(1);
        b.advance_clock(day_after);
        assert_eq!(b.status(), BreakerStatus::HalfOpen);
        b.record_closed_trade(80.0, day_after);
        assert_eq!(b.status(), BreakerStatus::Closed);
        assert!(b.snapshot().reason.is_none());
    }

    #[test]
    fn half_open_permits_exactly_one_probe_entry() {
        let b = breaker();
        let now = Utc::now();
        for _ in 0..3 {
            b.record_closed_trade(-100.0, now);
        }
        b.advance_clock(now + chrono::Duration::days(1));

        let first = b.may_trade(&entry_intent());
        assert!(first.allow);
        let second = b.may_trade(&entry_intent());
        assert!(!second.allow, "only one probe may be outstanding");

        // Exits stay allowed.
        let exit = b.may_trade(&TradeIntent {
            symbol: "SPY",
            is_exit: true,
        });
        assert!(exit.allow);
    }

    #[test]
    fn tier_ladder() {
        let b = breaker();
        let now = Utc::now();

        b.record_daily_pnl(-500.0, now);
        assert_eq!(b.tier(), LossTier::Normal);

        b.record_daily_pnl(-1_200.0, now);
        assert_eq!(b.tier(), LossTier::Caution);
        let gate = b.may_trade(&entry_intent());
        assert!(gate.allow);
        assert_eq!(gate.scale_factor, 0.5);

        // 3.5% loss: the 2% trigger has opened the breaker and the tier
        // reads CRITICAL.
        b.record_daily_pnl(-3_500.0, now);
        assert_eq!(b.tier(), LossTier::Critical);
        assert!(!b.may_trade(&entry_intent()).allow);
    }

    #[test]
    fn halt_tier_denies_everything_until_manual_reset() {
        let b = breaker();
        let now = Utc::now();
        b.record_daily_pnl(-6_000.0, now);
        assert_eq!(b.tier(), LossTier::Halt);
        assert!(!b.may_trade(&entry_intent()).allow);
        assert!(!b
            .may_trade(&TradeIntent {
                symbol: "SPY",
                is_exit: true
            })
            .allow);
    }

    #[test]
    fn manual_trip_and_reset() {
        let b = breaker();
        let now = Utc::now();
        b.trip_manual("operator says no", now);
        assert!(!b.may_trade(&entry_intent()).allow);

        // Cooldown/date-roll must not clear a manual trip.
        b.advance_clock(now + chrono::Duration::days(2));
        assert!(!b.may_trade(&entry_intent()).allow);

        b.reset_manual();
        assert!(b.may_trade(&entry_intent()).allow);
    }

    #[test]
    fn date_roll_resets_daily_counters() {
        let b = breaker();
        let now = Utc::now();
        b.record_api_error(now);
        b.record_api_error(now);

        b.advance_clock(now + chrono::Duration::days(1));
        // Three more errors would have tripped with the old count.
        for _ in 0..4 {
            b.record_api_error(now + chrono::Duration::days(1));
        }
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let b = breaker();
        let now = Utc::now();
        for _ in 0..3 {
            b.record_closed_trade(-100.0, now);
        }
        let record = b.snapshot();
        assert_eq!(record.status, BreakerStatus::Open);

        let restored = breaker();
        restored.restore(&record, 100_000.0, -300.0, 3, now);
        assert_eq!(restored.status(), BreakerStatus::Open);
        assert!(!restored.may_trade(&entry_intent()).allow);
    }
}
