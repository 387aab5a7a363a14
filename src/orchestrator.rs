// =============================================================================
// Orchestrator — one full decision-and-execution run
// =============================================================================
//
// A single invocation (the scheduler fires one per trading day):
//
//   1. Load persisted state (EXPIRED state refuses the run).
//   2. Pre-market health check: market-data smoke test on the index symbol,
//      broker reachability, account refresh, free cash.
//   3. Consult the portfolio breaker; a HALT tier ends the run.
//   4. Pipeline over the watchlist with a bounded worker pool: bars →
//      indicators → regime → specialist fan-out → meta consensus → RL
//      override → risk sizing → breaker gate → execution with failover.
//   5. Mark open positions to market; close stop-loss / take-profit hits.
//   6. Persist state and emit the run report.
//
// Per-symbol work is independent and runs concurrently; all state mutation
// happens serially on the orchestrator task after the join point.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::agents::meta::{detect_regime, MetaAgent, MetaDecision};
use crate::agents::rl_filter::{RlFilter, RlOverride, StateKey};
use crate::agents::{run_specialists, AgentContext, SpecialistAgent};
use crate::audit::{AuditKind, AuditRecord, AuditTrail};
use crate::breaker::{CircuitBreaker, LossTier, TradeIntent};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::executor::{MultiBrokerExecutor, OrderResult};
use crate::indicators::IndicatorSet;
use crate::market_data::MarketDataProvider;
use crate::risk::{PositionRequest, RiskManager};
use crate::state::{PortfolioSnapshot, PositionRecord, StateStore, SystemState};
use crate::types::{Action, ExitReason, Side};

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DecisionSummary {
    pub symbol: String,
    pub action: Action,
    pub confidence: f64,
    pub outcome: String,
}

/// What a single run did; `main` logs it and derives the exit code.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub symbols_evaluated: usize,
    pub symbols_skipped: usize,
    pub orders_submitted: usize,
    pub positions_closed: usize,
    pub decisions: Vec<DecisionSummary>,
    /// The breaker blocked all new entries for the whole run.
    pub entries_blocked: bool,
}

// ---------------------------------------------------------------------------
// Per-symbol outcome (returned from worker tasks to the join point)
// ---------------------------------------------------------------------------

struct EntryFill {
    request: PositionRequest,
    result: OrderResult,
    state_key: String,
    reference_price: f64,
}

struct SymbolOutcome {
    symbol: String,
    decision: Option<MetaDecision>,
    rl_override: Option<RlOverride>,
    entry: Option<EntryFill>,
    /// A SELL decision closed an existing position.
    signal_exit: Option<OrderResult>,
    skipped: Option<String>,
    api_error: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    pub config: EngineConfig,
    pub provider: Arc<MarketDataProvider>,
    pub state_store: Arc<StateStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub risk: Arc<RiskManager>,
    pub specialists: Vec<Arc<SpecialistAgent>>,
    pub meta: Arc<MetaAgent>,
    pub rl: Arc<RlFilter>,
    pub executor: Arc<MultiBrokerExecutor>,
    pub audit: Arc<AuditTrail>,
}

impl Orchestrator {
    /// Execute one full run. Terminal errors map to non-zero exit codes in
    /// `main`; a completed run (even with zero trades) returns a report.
    pub async fn run(&self) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        let deadline = started + self.config.run_deadline();
        let now = Utc::now();

        // ── 1. Load state ────────────────────────────────────────────────
        let mut state = self.load_state().await?;
        self.breaker.restore(
            &state.breaker,
            state.portfolio.equity,
            state.daily_pnl(now),
            state.consecutive_losses(),
            now,
        );
        self.rl.restore(&state.learned_params);

        // ── 2. Pre-market health check ───────────────────────────────────
        self.health_check(&mut state, deadline).await?;

        // ── 3. Breaker halt gate ─────────────────────────────────────────
        if self.breaker.tier() == LossTier::Halt {
            let reason = self
                .breaker
                .snapshot()
                .reason
                .unwrap_or_else(|| "halt tier".to_string());
            self.audit.record(AuditRecord::new(
                AuditKind::BreakerBlock,
                None,
                format!("run halted: {reason}"),
                serde_json::json!({ "tier": "HALT" }),
            ));
            // Persist the restored breaker record before refusing.
            state.breaker = self.breaker.snapshot();
            self.state_store.save(state)?;
            return Err(EngineError::BreakerOpen { reason });
        }

        // ── 4. Watchlist pipeline ────────────────────────────────────────
        let mut report = RunReport::default();
        let outcomes = self.run_pipeline(&state, deadline).await;

        for outcome in outcomes {
            self.apply_outcome(&mut state, outcome, &mut report);
        }

        // ── 5. Mark-to-market and protective exits ───────────────────────
        self.mark_to_market(&mut state, deadline, &mut report).await;

        // ── 6. Persist ───────────────────────────────────────────────────
        state.breaker = self.breaker.snapshot();
        state.learned_params = self.rl.to_learned_params();
        state.portfolio.as_of_utc = Utc::now();
        self.state_store.save(state)?;

        report.entries_blocked = self.breaker.status() != crate::breaker::BreakerStatus::Closed
            || self.breaker.tier() >= LossTier::Warning;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            symbols = report.symbols_evaluated,
            orders = report.orders_submitted,
            closed = report.positions_closed,
            skipped = report.symbols_skipped,
            "run complete"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // State loading
    // -------------------------------------------------------------------------

    async fn load_state(&self) -> Result<SystemState, EngineError> {
        if self.state_store.path().exists() {
            return self.state_store.load();
        }
        // First run on a fresh deployment: seed the portfolio from the
        // primary broker's account.
        let account = self.executor.primary_account().await.map_err(|e| {
            EngineError::HealthCheckFailed {
                reason: format!("no state file and no reachable broker to bootstrap from: {e}"),
            }
        })?;
        self.state_store.load_or_bootstrap(PortfolioSnapshot {
            equity: account.equity,
            cash: account.cash,
            buying_power: account.buying_power,
            as_of_utc: Utc::now(),
        })
    }

    // -------------------------------------------------------------------------
    // Health check
    // -------------------------------------------------------------------------

    async fn health_check(
        &self,
        state: &mut SystemState,
        deadline: Instant,
    ) -> Result<(), EngineError> {
        // Market data smoke test on the index symbol.
        if let Err(e) = self
            .provider
            .get_daily_bars(&self.config.index_symbol, self.config.lookback_days, Some(deadline))
            .await
        {
            self.record_health_failure(&format!("market data smoke test failed: {e}"));
            return Err(EngineError::HealthCheckFailed {
                reason: format!("market data smoke test: {e}"),
            });
        }

        // At least one broker must be reachable.
        if !self.executor.any_broker_healthy().await {
            self.record_health_failure("no broker reachable");
            return Err(EngineError::HealthCheckFailed {
                reason: "no broker reachable".to_string(),
            });
        }

        // Refresh the portfolio snapshot and confirm free cash.
        match self.executor.primary_account().await {
            Ok(account) => {
                state.portfolio.equity = account.equity;
                state.portfolio.cash = account.cash;
                state.portfolio.buying_power = account.buying_power;
                state.portfolio.as_of_utc = Utc::now();
                if account.cash <= 0.0 {
                    self.record_health_failure("no free cash");
                    return Err(EngineError::HealthCheckFailed {
                        reason: format!("no free cash (cash {:.2})", account.cash),
                    });
                }
            }
            Err(e) => {
                self.record_health_failure(&format!("account refresh failed: {e}"));
                return Err(EngineError::HealthCheckFailed {
                    reason: format!("account refresh: {e}"),
                });
            }
        }

        self.audit.record(AuditRecord::new(
            AuditKind::Health,
            None,
            "pre-market health check passed",
            serde_json::json!({
                "breaker": self.breaker.status().to_string(),
                "equity": state.portfolio.equity,
            }),
        ));
        Ok(())
    }

    fn record_health_failure(&self, reason: &str) {
        error!(reason, "pre-market health check failed");
        self.audit.record(AuditRecord::new(
            AuditKind::Health,
            None,
            format!("health check failed: {reason}"),
            serde_json::Value::Null,
        ));
    }

    // -------------------------------------------------------------------------
    // Watchlist pipeline
    // -------------------------------------------------------------------------

    async fn run_pipeline(&self, state: &SystemState, deadline: Instant) -> Vec<SymbolOutcome> {
        let workers = self.config.effective_workers();
        let semaphore = Arc::new(Semaphore::new(workers));
        // Shared remaining daily-investment budget across symbol tasks.
        let budget = Arc::new(Mutex::new(self.config.daily_investment));

        info!(
            symbols = self.config.watchlist.len(),
            workers,
            budget = self.config.daily_investment,
            "starting watchlist pipeline"
        );

        let mut join_set: JoinSet<SymbolOutcome> = JoinSet::new();
        for symbol in self.config.watchlist.clone() {
            let semaphore = semaphore.clone();
            let budget = budget.clone();
            let task = SymbolTask {
                symbol_exposure: state.symbol_exposure(&symbol),
                open_position: state.position(&symbol).cloned(),
                symbol,
                config: self.config.clone(),
                provider: self.provider.clone(),
                breaker: self.breaker.clone(),
                risk: self.risk.clone(),
                specialists: self.specialists.clone(),
                meta: self.meta.clone(),
                rl: self.rl.clone(),
                executor: self.executor.clone(),
                equity: state.portfolio.equity,
                stats: state.journal_stats(),
                deadline,
            };
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                task.evaluate(budget).await
            });
        }

        let mut outcomes = Vec::new();
        let overall = tokio::time::timeout(
            deadline.saturating_duration_since(Instant::now()),
            async {
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok(outcome) => outcomes.push(outcome),
                        Err(e) => error!(error = %e, "symbol task panicked"),
                    }
                }
            },
        )
        .await;

        if overall.is_err() {
            warn!("run deadline reached — abandoning remaining symbols");
            join_set.abort_all();
            self.audit.record(AuditRecord::new(
                AuditKind::Failure,
                None,
                "run deadline reached before all symbols evaluated",
                serde_json::Value::Null,
            ));
        }

        outcomes
    }

    /// Serially fold one symbol's outcome into state, audit, and report.
    fn apply_outcome(
        &self,
        state: &mut SystemState,
        outcome: SymbolOutcome,
        report: &mut RunReport,
    ) {
        let now = Utc::now();
        report.symbols_evaluated += 1;

        if outcome.api_error {
            self.breaker.record_api_error(now);
        }

        if let Some(reason) = &outcome.skipped {
            report.symbols_skipped += 1;
            self.audit.record(AuditRecord::new(
                AuditKind::Veto,
                Some(&outcome.symbol),
                format!("skipped: {reason}"),
                serde_json::Value::Null,
            ));
        }

        let Some(decision) = &outcome.decision else {
            return;
        };

        let final_action = outcome
            .rl_override
            .as_ref()
            .map(|o| o.override_action)
            .unwrap_or(decision.action);

        self.audit.record(AuditRecord::new(
            AuditKind::Decision,
            Some(&outcome.symbol),
            format!(
                "{final_action} confidence {:.2} ({} regime)",
                decision.confidence, decision.regime
            ),
            serde_json::to_value(decision).unwrap_or_default(),
        ));
        if let Some(rl_override) = &outcome.rl_override {
            self.audit.record(AuditRecord::new(
                AuditKind::Override,
                Some(&outcome.symbol),
                format!(
                    "{} overridden to {} (override_source=rl_filter)",
                    rl_override.meta_action, rl_override.override_action
                ),
                serde_json::to_value(rl_override).unwrap_or_default(),
            ));
        }

        let mut outcome_label = outcome.skipped.clone().unwrap_or_else(|| "hold".to_string());

        if let Some(fill) = outcome.entry {
            if fill.result.emergency_closed {
                self.audit.record(AuditRecord::new(
                    AuditKind::Failure,
                    Some(&outcome.symbol),
                    "CRITICAL: stop placement failed; position emergency-closed",
                    serde_json::to_value(&fill.result).unwrap_or_default(),
                ));
                self.breaker.record_api_error(now);
                outcome_label = "emergency_closed".to_string();
            } else {
                let fill_price = fill
                    .result
                    .filled_avg_price
                    .unwrap_or(fill.reference_price);
                let qty = if fill.result.qty > 0.0 {
                    fill.result.qty
                } else {
                    fill.request.notional.unwrap_or(0.0) / fill_price.max(1e-9)
                };

                state.positions.push(PositionRecord {
                    symbol: outcome.symbol.clone(),
                    qty,
                    avg_entry_price: fill_price,
                    opened_at: now,
                    stop_loss_price: fill.request.stop_loss_price,
                    take_profit_price: fill.request.take_profit_price,
                    market_price: fill_price,
                    unrealized_pnl_pct: 0.0,
                    entry_state_key: Some(fill.state_key),
                });
                state.portfolio.cash -= qty * fill_price;
                report.orders_submitted += 1;
                outcome_label = format!("filled via {}", fill.result.broker);

                self.audit.record(AuditRecord::new(
                    AuditKind::Order,
                    Some(&outcome.symbol),
                    format!(
                        "{} {:.4} @ {:.2} via {}",
                        fill.result.side, qty, fill_price, fill.result.broker
                    ),
                    serde_json::to_value(&fill.result).unwrap_or_default(),
                ));
            }
        }

        if let Some(exit_result) = outcome.signal_exit {
            let exit_price = exit_result
                .filled_avg_price
                .unwrap_or_else(|| {
                    state
                        .position(&outcome.symbol)
                        .map(|p| p.market_price)
                        .unwrap_or(0.0)
                });
            self.close_position(state, &outcome.symbol, exit_price, ExitReason::Signal, report);
            outcome_label = format!("closed via {}", exit_result.broker);
        }

        report.decisions.push(DecisionSummary {
            symbol: outcome.symbol,
            action: final_action,
            confidence: decision.confidence,
            outcome: outcome_label,
        });
    }

    // -------------------------------------------------------------------------
    // Mark-to-market and protective exits
    // -------------------------------------------------------------------------

    async fn mark_to_market(
        &self,
        state: &mut SystemState,
        deadline: Instant,
        report: &mut RunReport,
    ) {
        let now = Utc::now();
        let open_symbols: Vec<String> =
            state.positions.iter().map(|p| p.symbol.clone()).collect();

        for symbol in open_symbols {
            // Usually a warm cache hit; positions outside the watchlist pay
            // one live fetch.
            let result = match self
                .provider
                .get_daily_bars(&symbol, self.config.lookback_days, Some(deadline))
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "mark-to-market fetch failed");
                    self.breaker.record_api_error(now);
                    continue;
                }
            };
            let Some(last_bar) = result.series.last().copied() else {
                continue;
            };

            let Some(position) = state.positions.iter_mut().find(|p| p.symbol == symbol) else {
                continue;
            };
            position.market_price = last_bar.close;
            position.unrealized_pnl_pct = if position.avg_entry_price > 0.0 {
                (last_bar.close - position.avg_entry_price) / position.avg_entry_price * 100.0
            } else {
                0.0
            };

            // Stop first: when both levels lie inside one daily bar the
            // conservative read is that the stop filled.
            let stop_hit = position
                .stop_loss_price
                .map(|stop| last_bar.low <= stop)
                .unwrap_or(false);
            let tp_hit = position
                .take_profit_price
                .map(|tp| last_bar.high >= tp)
                .unwrap_or(false);

            let (exit_price, reason) = if stop_hit {
                (position.stop_loss_price.unwrap_or(last_bar.close), ExitReason::StopLoss)
            } else if tp_hit {
                (
                    position.take_profit_price.unwrap_or(last_bar.close),
                    ExitReason::TakeProfit,
                )
            } else {
                continue;
            };
            let qty = position.qty;

            // Exits stay permitted deep into the tier ladder; only a HALT
            // blocks them, and then the position simply stays marked.
            let gate = self.breaker.may_trade(&TradeIntent {
                symbol: &symbol,
                is_exit: true,
            });
            if !gate.allow {
                warn!(symbol = %symbol, reason = ?gate.reason, "exit blocked by breaker");
                continue;
            }

            let exit_request = PositionRequest::by_qty(symbol.as_str(), Side::Sell, qty);
            match self.executor.submit(&exit_request).await {
                Ok(exit_result) => {
                    let realized_price = exit_result.filled_avg_price.unwrap_or(exit_price);
                    self.close_position(state, &symbol, realized_price, reason, report);
                }
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "protective exit failed");
                    self.breaker.record_api_error(now);
                    self.audit.record(AuditRecord::new(
                        AuditKind::Failure,
                        Some(&symbol),
                        format!("protective exit failed: {e}"),
                        serde_json::Value::Null,
                    ));
                }
            }
        }

        self.breaker.record_daily_pnl(state.daily_pnl(now), now);
    }

    /// Archive a position, feed the breaker, and reward the RL filter.
    fn close_position(
        &self,
        state: &mut SystemState,
        symbol: &str,
        exit_price: f64,
        reason: ExitReason,
        report: &mut RunReport,
    ) {
        let now = Utc::now();
        let entry_state_key = state
            .position(symbol)
            .and_then(|p| p.entry_state_key.clone());
        let stop_fraction = state.position(symbol).and_then(|p| {
            p.stop_loss_price.map(|stop| {
                ((p.avg_entry_price - stop).abs() / p.avg_entry_price.max(1e-9)).max(1e-6)
            })
        });

        let Some(trade) = state.archive_position(symbol, exit_price, reason, now) else {
            return;
        };

        self.breaker.record_closed_trade(trade.realized_pnl, now);

        // Risk-adjusted reward: the trade's return expressed in R multiples
        // of the stop distance (raw return when no stop was set).
        if let Some(key) = entry_state_key {
            let pnl_fraction = trade.realized_pnl_pct / 100.0;
            let reward = match stop_fraction {
                Some(stop) => pnl_fraction / stop,
                None => pnl_fraction,
            };
            self.rl.update(&key, Action::Buy, reward);
        }

        report.positions_closed += 1;
        self.audit.record(AuditRecord::new(
            AuditKind::Exit,
            Some(symbol),
            format!(
                "closed {:.4} @ {:.2} ({}), pnl {:.2}",
                trade.qty, trade.exit_price, trade.exit_reason, trade.realized_pnl
            ),
            serde_json::to_value(&trade).unwrap_or_default(),
        ));
    }
}

// ---------------------------------------------------------------------------
// Per-symbol worker
// ---------------------------------------------------------------------------

struct SymbolTask {
    symbol: String,
    config: EngineConfig,
    provider: Arc<MarketDataProvider>,
    breaker: Arc<CircuitBreaker>,
    risk: Arc<RiskManager>,
    specialists: Vec<Arc<SpecialistAgent>>,
    meta: Arc<MetaAgent>,
    rl: Arc<RlFilter>,
    executor: Arc<MultiBrokerExecutor>,
    equity: f64,
    symbol_exposure: f64,
    open_position: Option<PositionRecord>,
    stats: crate::state::JournalStats,
    deadline: Instant,
}

impl SymbolTask {
    async fn evaluate(self, budget: Arc<Mutex<f64>>) -> SymbolOutcome {
        let mut outcome = SymbolOutcome {
            symbol: self.symbol.clone(),
            decision: None,
            rl_override: None,
            entry: None,
            signal_exit: None,
            skipped: None,
            api_error: false,
        };

        // ── Market data ──────────────────────────────────────────────────
        let data = match self
            .provider
            .get_daily_bars(&self.symbol, self.config.lookback_days, Some(self.deadline))
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "skipping symbol: no market data");
                outcome.skipped = Some(format!("market data unavailable: {e}"));
                outcome.api_error = true;
                return outcome;
            }
        };
        let data_stale = data.is_stale(self.config.cache_ttl_seconds as f64 / 3600.0);
        let series = Arc::new(data.series);
        let Some(price) = series.last().map(|b| b.close) else {
            outcome.skipped = Some("empty series".to_string());
            return outcome;
        };

        // ── Indicators & regime ──────────────────────────────────────────
        let indicators = Arc::new(IndicatorSet::compute(&series));
        let regime_reading = detect_regime(&series);
        let regime = regime_reading.regime;

        // ── Breaker gate (scale feeds sizing; entries may be denied) ─────
        let gate = self.breaker.may_trade(&TradeIntent {
            symbol: &self.symbol,
            is_exit: false,
        });

        // ── Specialist fan-out ───────────────────────────────────────────
        let ctx = Arc::new(AgentContext {
            symbol: self.symbol.clone(),
            bars: series.clone(),
            indicators: indicators.clone(),
            regime,
            price,
            equity: self.equity,
            symbol_exposure: self.symbol_exposure,
            stats: self.stats,
            breaker_scale: if gate.allow { gate.scale_factor } else { 0.0 },
            data_stale,
            now: Utc::now(),
        });
        let recommendations =
            run_specialists(&self.specialists, ctx, self.config.specialist_timeout()).await;

        // ── Meta consensus and RL override ───────────────────────────────
        let decision = self
            .meta
            .aggregate(&self.symbol, regime, &recommendations, data_stale);
        let state_key = StateKey::from_indicators(regime, &indicators, price);
        let rl_override = self.rl.maybe_override(&state_key, decision.action);
        let action = rl_override
            .as_ref()
            .map(|o| o.override_action)
            .unwrap_or(decision.action);

        outcome.decision = Some(decision);
        outcome.rl_override = rl_override;

        match action {
            Action::Hold => outcome,
            Action::Sell => self.handle_sell(outcome).await,
            Action::Buy => {
                self.handle_buy(
                    outcome,
                    price,
                    &indicators,
                    regime,
                    &gate,
                    state_key,
                    data_stale,
                    budget,
                )
                .await
            }
        }
    }

    /// SELL closes an existing position; short entries are not taken.
    async fn handle_sell(self, mut outcome: SymbolOutcome) -> SymbolOutcome {
        let Some(position) = &self.open_position else {
            outcome.skipped = Some("sell signal with no open position".to_string());
            return outcome;
        };

        let gate = self.breaker.may_trade(&TradeIntent {
            symbol: &self.symbol,
            is_exit: true,
        });
        if !gate.allow {
            outcome.skipped = Some(format!(
                "exit blocked: {}",
                gate.reason.unwrap_or_default()
            ));
            return outcome;
        }

        let request = PositionRequest::by_qty(self.symbol.as_str(), Side::Sell, position.qty);
        match self.executor.submit(&request).await {
            Ok(result) => outcome.signal_exit = Some(result),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "signal exit failed");
                outcome.skipped = Some(format!("exit failed: {e}"));
                outcome.api_error = true;
            }
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_buy(
        self,
        mut outcome: SymbolOutcome,
        price: f64,
        indicators: &IndicatorSet,
        regime: crate::agents::meta::Regime,
        gate: &crate::breaker::GateDecision,
        state_key: StateKey,
        data_stale: bool,
        budget: Arc<Mutex<f64>>,
    ) -> SymbolOutcome {
        if !gate.allow {
            outcome.skipped = Some(format!(
                "entry blocked: {}",
                gate.reason.clone().unwrap_or_default()
            ));
            return outcome;
        }

        let Some(atr) = indicators.atr else {
            outcome.skipped = Some("ATR unavailable for sizing".to_string());
            return outcome;
        };

        let inputs = crate::risk::SizingInputs {
            symbol: &self.symbol,
            side: Side::Buy,
            equity: self.equity,
            price,
            atr,
            observed_vol: indicators.realized_vol,
            regime,
            stats: &self.stats,
            breaker_scale: gate.scale_factor,
            symbol_exposure: self.symbol_exposure,
            data_stale,
        };
        let (request, _breakdown) = match self.risk.size_entry(&inputs) {
            Ok(sized) => sized,
            Err(e) => {
                info!(symbol = %self.symbol, reason = %e, "risk veto");
                outcome.skipped = Some(format!("{e}"));
                return outcome;
            }
        };

        // Reserve from the shared daily budget before touching a broker.
        let notional = request.notional.unwrap_or(0.0);
        {
            let mut remaining = budget.lock();
            if *remaining < notional {
                outcome.skipped = Some(format!(
                    "daily investment budget exhausted ({remaining:.2} left, need {notional:.2})"
                ));
                return outcome;
            }
            *remaining -= notional;
        }

        match self.executor.submit(&request).await {
            Ok(result) => {
                outcome.entry = Some(EntryFill {
                    request,
                    result,
                    state_key: state_key.encode(),
                    reference_price: price,
                });
            }
            Err(e) => {
                *budget.lock() += notional;
                error!(symbol = %self.symbol, error = %e, "execution failed on all brokers");
                outcome.skipped = Some(format!("{e}"));
                outcome.api_error = true;
            }
        }
        outcome
    }
}

// =============================================================================
// Scenario Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::{Days, NaiveDate};
    use tempfile::TempDir;

    use crate::agents::execution_agent::ExecutionAgent;
    use crate::agents::research::ResearchAgent;
    use crate::agents::risk_agent::RiskAgent;
    use crate::agents::rl_filter::RlConfig;
    use crate::agents::signal::SignalAgent;
    use crate::broker::paper::PaperBroker;
    use crate::broker::BrokerAdapter;
    use crate::executor::ExecutorConfig;
    use crate::llm::{DisabledLlm, LlmOptions};
    use crate::market_data::cache::BarCache;
    use crate::market_data::health_log::HealthLog;
    use crate::market_data::provider::SourceSlot;
    use crate::market_data::sources::{BarSource, SourceError};
    use crate::market_data::{Bar, DataSource};
    use crate::retry::RetryPolicy;
    use crate::state::QRow;
    use crate::types::ExitReason;

    // ── Bar builders ────────────────────────────────────────────────────

    fn bar(i: usize, close: f64, volume: f64) -> Bar {
        Bar {
            date: NaiveDate::from_ymd_opt(2025, 1, 1)
                .unwrap()
                .checked_add_days(Days::new(i as u64))
                .unwrap(),
            open: close - 0.5,
            high: close + 1.5,
            low: close - 1.5,
            close,
            volume,
        }
    }

    /// Sawtooth uptrend: net drift up, RSI mid-band, volume pop on the
    /// final bar.
    fn sawtooth_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let close = 500.0 + i as f64 * 0.5 + (i % 2) as f64 * 2.0;
                let volume = if i == n - 1 { 1_300_000.0 } else { 1_000_000.0 };
                bar(i, close, volume)
            })
            .collect()
    }

    fn flat_bars(n: usize) -> Vec<Bar> {
        (0..n).map(|i| bar(i, 500.0, 1_000_000.0)).collect()
    }

    // ── Scripted source ─────────────────────────────────────────────────

    /// Serves a fixed bar set per symbol; unknown symbols fail permanently.
    struct MapSource {
        bars: HashMap<String, Vec<Bar>>,
    }

    #[async_trait]
    impl BarSource for MapSource {
        fn id(&self) -> DataSource {
            DataSource::Yfinance
        }

        async fn fetch_daily(
            &self,
            symbol: &str,
            _lookback_days: u32,
        ) -> Result<Vec<Bar>, SourceError> {
            self.bars
                .get(symbol)
                .cloned()
                .ok_or_else(|| SourceError::permanent(format!("no data for {symbol}")))
        }
    }

    // ── Harness ─────────────────────────────────────────────────────────

    struct Harness {
        orchestrator: Orchestrator,
        primary: Arc<PaperBroker>,
        backup: Arc<PaperBroker>,
        _tmp: TempDir,
    }

    fn build_harness(
        bars_by_symbol: HashMap<String, Vec<Bar>>,
        rl_config: RlConfig,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Harness {
        let tmp = tempfile::tempdir().unwrap();

        let mut config = EngineConfig::default();
        config.watchlist = vec!["SPY".to_string()];
        config.index_symbol = "SPY".to_string();
        config.lookback_days = 40;
        config.state_path = tmp
            .path()
            .join("state.json")
            .to_string_lossy()
            .into_owned();
        config.buy_threshold = 0.10;
        tweak(&mut config);

        let provider = Arc::new(MarketDataProvider::new(
            vec![SourceSlot {
                source: Arc::new(MapSource {
                    bars: bars_by_symbol.clone(),
                }),
                retry: RetryPolicy::none(),
            }],
            BarCache::new(
                tmp.path().join("cache"),
                std::time::Duration::from_secs(config.cache_ttl_seconds),
                config.cache_max_age_days,
            ),
            HealthLog::disabled(),
        ));

        let primary = Arc::new(PaperBroker::new("primary", 100_000.0));
        let backup = Arc::new(PaperBroker::new("backup", 100_000.0));
        for (symbol, bars) in &bars_by_symbol {
            if let Some(last) = bars.last() {
                primary.set_quote(symbol, last.close);
                backup.set_quote(symbol, last.close);
            }
        }

        let executor = Arc::new(MultiBrokerExecutor::new(
            vec![
                primary.clone() as Arc<dyn BrokerAdapter>,
                backup.clone() as Arc<dyn BrokerAdapter>,
            ],
            ExecutorConfig {
                failover_enabled: config.enable_broker_failover,
                ..ExecutorConfig::default()
            },
        ));

        let risk = Arc::new(RiskManager::new(config.risk_config()));
        let specialists = vec![
            Arc::new(SpecialistAgent::Research(ResearchAgent::new(
                Arc::new(DisabledLlm),
                LlmOptions::default(),
            ))),
            Arc::new(SpecialistAgent::Signal(SignalAgent::new())),
            Arc::new(SpecialistAgent::Risk(RiskAgent::new(risk.clone()))),
            Arc::new(SpecialistAgent::Execution(ExecutionAgent::new())),
        ];

        let orchestrator = Orchestrator {
            meta: Arc::new(MetaAgent::new(config.buy_threshold)),
            state_store: Arc::new(StateStore::new(
                config.state_path.clone(),
                config.state_expiry_hours,
            )),
            breaker: Arc::new(CircuitBreaker::new(config.breaker_config(), 100_000.0)),
            rl: Arc::new(RlFilter::new(rl_config)),
            risk,
            specialists,
            provider,
            executor,
            audit: Arc::new(AuditTrail::in_memory()),
            config,
        };

        Harness {
            orchestrator,
            primary,
            backup,
            _tmp: tmp,
        }
    }

    fn spy_bars(bars: Vec<Bar>) -> HashMap<String, Vec<Bar>> {
        HashMap::from([("SPY".to_string(), bars)])
    }

    fn rl_disabled() -> RlConfig {
        RlConfig {
            enabled: false,
            ..RlConfig::default()
        }
    }

    // ── Scenarios ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn fresh_run_primary_broker_fills_and_state_persists() {
        let h = build_harness(spy_bars(sawtooth_bars(40)), rl_disabled(), |_| {});

        let report = h.orchestrator.run().await.unwrap();
        assert_eq!(report.symbols_evaluated, 1);
        assert_eq!(report.orders_submitted, 1, "decisions: {:?}", report.decisions);
        assert!(!report.entries_blocked);

        // Position landed in state with a protective stop on the broker.
        let state = h.orchestrator.state_store.load().unwrap();
        assert_eq!(state.positions.len(), 1);
        let position = &state.positions[0];
        assert_eq!(position.symbol, "SPY");
        assert!(position.qty > 0.0);
        assert!(position.stop_loss_price.unwrap() < position.avg_entry_price);
        assert_eq!(h.primary.list_open_orders().await.unwrap().len(), 1);
        assert_eq!(h.backup.order_count(), 0);

        // Saved state reads back FRESH.
        let meta = state.meta.unwrap();
        assert_eq!(meta.staleness_status, crate::state::StalenessStatus::Fresh);
    }

    #[tokio::test]
    async fn degraded_primary_fails_over_to_backup() {
        let h = build_harness(spy_bars(sawtooth_bars(40)), rl_disabled(), |_| {});
        h.primary.fail_next_submits(1);

        let report = h.orchestrator.run().await.unwrap();
        assert_eq!(report.orders_submitted, 1);

        // Backup filled; primary's breaker counted exactly one failure.
        assert_eq!(h.backup.filled_orders().len(), 1);
        assert_eq!(
            h.orchestrator.executor.breaker_failure_count("primary"),
            Some(1)
        );
        let order_records = h.orchestrator.audit.records_of_kind(AuditKind::Order);
        assert_eq!(order_records.len(), 1);
        assert!(order_records[0].summary.contains("backup"));
    }

    #[tokio::test]
    async fn third_consecutive_loss_trips_breaker_and_next_run_blocks_entries() {
        let h = build_harness(spy_bars(flat_bars(40)), rl_disabled(), |cfg| {
            cfg.buy_threshold = 0.35;
        });

        // Seed: two losing trades closed today, plus an open position whose
        // stop sits above the flat tape (guaranteed stop hit).
        let now = Utc::now();
        let mut state = SystemState::new(PortfolioSnapshot {
            equity: 100_000.0,
            cash: 60_000.0,
            buying_power: 100_000.0,
            as_of_utc: now,
        });
        for pnl in [-80.0, -120.0] {
            state.closed_trades.push(crate::state::ClosedTrade {
                symbol: "QQQ".into(),
                qty: 5.0,
                entry_price: 400.0,
                exit_price: 400.0 + pnl / 5.0,
                realized_pnl: pnl,
                realized_pnl_pct: pnl / 2_000.0 * 100.0,
                opened_at: now - chrono::Duration::days(1),
                closed_at: now,
                exit_reason: ExitReason::StopLoss,
            });
        }
        state.positions.push(PositionRecord {
            symbol: "SPY".into(),
            qty: 10.0,
            avg_entry_price: 510.0,
            opened_at: now - chrono::Duration::days(1),
            stop_loss_price: Some(505.0),
            take_profit_price: Some(530.0),
            market_price: 510.0,
            unrealized_pnl_pct: 0.0,
            entry_state_key: None,
        });
        h.orchestrator.state_store.save(state).unwrap();

        let report = h.orchestrator.run().await.unwrap();
        assert_eq!(report.positions_closed, 1);
        assert_eq!(report.orders_submitted, 0);

        let state = h.orchestrator.state_store.load().unwrap();
        assert_eq!(state.closed_trades.len(), 3);
        assert_eq!(
            state.closed_trades.last().unwrap().exit_reason,
            ExitReason::StopLoss
        );
        assert_eq!(state.breaker.status, crate::breaker::BreakerStatus::Open);
        assert!(state
            .breaker
            .reason
            .as_deref()
            .unwrap()
            .starts_with("consecutive_losses"));

        // Next invocation the same day: no orders, entries blocked, clean
        // exit (the run itself completes).
        let report = h.orchestrator.run().await.unwrap();
        assert_eq!(report.orders_submitted, 0);
        assert!(report.entries_blocked);
    }

    #[tokio::test]
    async fn expired_state_refuses_to_run_with_exit_code_2() {
        let h = build_harness(spy_bars(sawtooth_bars(40)), rl_disabled(), |_| {});

        // Hand-write a state file stamped four days ago.
        let mut state = SystemState::new(PortfolioSnapshot::default());
        state.last_updated_utc = Utc::now() - chrono::Duration::days(4);
        let path = h.orchestrator.state_store.path().to_path_buf();
        std::fs::write(&path, serde_json::to_vec_pretty(&state).unwrap()).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let err = h.orchestrator.run().await.unwrap_err();
        assert!(matches!(err, EngineError::StateExpired { .. }));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn rl_filter_overrides_hold_to_buy() {
        // Flat tape: the meta consensus holds even at a low threshold.
        let bars = flat_bars(40);
        let h = build_harness(
            spy_bars(bars.clone()),
            RlConfig {
                enabled: true,
                epsilon: 1.0,
                override_threshold: 0.2,
                seed: Some(11),
                ..RlConfig::default()
            },
            |cfg| {
                cfg.buy_threshold = 0.35;
            },
        );

        // Seed the persisted Q-table at exactly the key the pipeline will
        // compute; the run restores learned parameters from state.
        let series = crate::market_data::BarSeries::from_bars("SPY", bars);
        let indicators = IndicatorSet::compute(&series);
        let regime = detect_regime(&series).regime;
        let key = StateKey::from_indicators(regime, &indicators, 500.0).encode();

        let mut state = SystemState::new(PortfolioSnapshot {
            equity: 100_000.0,
            cash: 100_000.0,
            buying_power: 100_000.0,
            as_of_utc: Utc::now(),
        });
        state.learned_params.q_table.insert(
            key.clone(),
            QRow {
                buy: 1.0,
                sell: -0.5,
                hold: 0.0,
            },
        );
        h.orchestrator.state_store.save(state).unwrap();

        let report = h.orchestrator.run().await.unwrap();
        assert_eq!(report.orders_submitted, 1, "decisions: {:?}", report.decisions);

        let overrides = h.orchestrator.audit.records_of_kind(AuditKind::Override);
        assert_eq!(overrides.len(), 1);
        assert!(overrides[0].summary.contains("override_source=rl_filter"));

        // The entry remembers its state key for the eventual reward update.
        let state = h.orchestrator.state_store.load().unwrap();
        assert_eq!(state.positions[0].entry_state_key.as_deref(), Some(key.as_str()));
    }

    #[tokio::test]
    async fn data_unavailable_skips_symbol_but_run_completes() {
        // Index symbol has data (health check passes); the watchlist symbol
        // does not.
        let mut bars = spy_bars(sawtooth_bars(40));
        bars.insert("XYZ".to_string(), Vec::new());
        let h = build_harness(bars, rl_disabled(), |cfg| {
            cfg.watchlist = vec!["XYZ".to_string()];
        });

        let report = h.orchestrator.run().await.unwrap();
        assert_eq!(report.symbols_evaluated, 1);
        assert_eq!(report.symbols_skipped, 1);
        assert_eq!(report.orders_submitted, 0);

        let vetoes = h.orchestrator.audit.records_of_kind(AuditKind::Veto);
        assert!(vetoes[0].summary.contains("market data unavailable"));
    }

    #[tokio::test]
    async fn take_profit_exit_archives_trade_and_rewards_rl() {
        let h = build_harness(spy_bars(flat_bars(40)), rl_disabled(), |cfg| {
            cfg.buy_threshold = 0.35;
        });

        let now = Utc::now();
        let mut state = SystemState::new(PortfolioSnapshot {
            equity: 100_000.0,
            cash: 60_000.0,
            buying_power: 100_000.0,
            as_of_utc: now,
        });
        // Take-profit below the flat tape's highs: guaranteed hit.
        state.positions.push(PositionRecord {
            symbol: "SPY".into(),
            qty: 10.0,
            avg_entry_price: 495.0,
            opened_at: now - chrono::Duration::days(2),
            stop_loss_price: Some(480.0),
            take_profit_price: Some(501.0),
            market_price: 495.0,
            unrealized_pnl_pct: 0.0,
            entry_state_key: Some("LOW_VOL|r5|m0|t0".into()),
        });
        h.orchestrator.state_store.save(state).unwrap();

        let report = h.orchestrator.run().await.unwrap();
        assert_eq!(report.positions_closed, 1);

        let state = h.orchestrator.state_store.load().unwrap();
        assert!(state.positions.is_empty());
        let trade = state.closed_trades.last().unwrap();
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert!(trade.realized_pnl > 0.0);

        // The profitable close raised the Q-value for the entry key.
        let q = state.learned_params.q_table.get("LOW_VOL|r5|m0|t0").unwrap();
        assert!(q.buy > 0.0, "q.buy = {}", q.buy);
    }

    #[tokio::test]
    async fn no_free_cash_fails_health_check_with_exit_code_4() {
        let h = build_harness(spy_bars(sawtooth_bars(40)), rl_disabled(), |_| {});

        // Swap in a cashless primary as the only venue.
        let broke = Arc::new(PaperBroker::new("primary", 0.0));
        broke.set_quote("SPY", 521.5);
        let orchestrator = Orchestrator {
            executor: Arc::new(MultiBrokerExecutor::new(
                vec![broke as Arc<dyn BrokerAdapter>],
                ExecutorConfig::default(),
            )),
            ..h.orchestrator
        };

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, EngineError::HealthCheckFailed { .. }));
        assert_eq!(err.exit_code(), 4);
    }
}
