// =============================================================================
// Multi-Broker Executor — priority-ordered failover with per-broker breakers
// =============================================================================
//
// Brokers are tried strictly in configured priority order; attempts against
// one broker finish before the next is touched (parallel multi-broker
// submission risks duplicate fills). Each broker sits behind its own small
// circuit breaker: N consecutive failures open it, a cooldown admits one
// half-open probe, one success closes it, one failure re-opens it. Brokers
// with an open breaker are skipped, and the skip is recorded.
//
// Idempotency: the position request's `request_id` rides through to every
// broker as the client order id, so a retry or a failover can never fill
// the same intent twice on the same venue.
//
// Stop-loss attachment: after a filled entry, the protective stop goes to
// the SAME broker. If the stop cannot be placed the executor closes the
// freshly opened position best-effort and flags the result CRITICAL.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::breaker::BreakerStatus;
use crate::broker::{BrokerAdapter, BrokerError, BrokerOrder, OrderKind, OrderRequest, OrderStatus};
use crate::errors::EngineError;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::risk::PositionRequest;
use crate::types::{Side, TimeInForce};

// ---------------------------------------------------------------------------
// Per-broker breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BrokerBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub max_consecutive_failures: u32,
    pub cooldown: Duration,
}

impl Default for BrokerBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            cooldown: Duration::from_secs(300),
        }
    }
}

struct BreakerInner {
    status: BreakerStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Same CLOSED/OPEN/HALF_OPEN machine as the portfolio breaker, scoped to
/// one broker's request stream.
pub struct BrokerBreaker {
    config: BrokerBreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl BrokerBreaker {
    fn new(config: BrokerBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(BreakerInner {
                status: BreakerStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a request may be sent right now. An OPEN breaker whose
    /// cooldown has elapsed transitions to HALF_OPEN and admits the probe.
    fn available(&self, broker: &str) -> bool {
        let mut s = self.inner.write();
        match s.status {
            BreakerStatus::Closed | BreakerStatus::HalfOpen => true,
            BreakerStatus::Open => {
                let cooled = s
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    info!(broker, "broker breaker OPEN → HALF_OPEN");
                    s.status = BreakerStatus::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self, broker: &str) {
        let mut s = self.inner.write();
        if s.status != BreakerStatus::Closed {
            info!(broker, "broker breaker → CLOSED");
        }
        s.status = BreakerStatus::Closed;
        s.consecutive_failures = 0;
        s.opened_at = None;
    }

    fn on_failure(&self, broker: &str) {
        let mut s = self.inner.write();
        s.consecutive_failures += 1;
        let open_now = s.status == BreakerStatus::HalfOpen
            || s.consecutive_failures >= self.config.max_consecutive_failures;
        if open_now && s.status != BreakerStatus::Open {
            warn!(
                broker,
                consecutive_failures = s.consecutive_failures,
                "broker breaker → OPEN"
            );
            s.status = BreakerStatus::Open;
            s.opened_at = Some(Instant::now());
        }
    }

    pub fn status(&self) -> BreakerStatus {
        self.inner.read().status
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.read().consecutive_failures
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One attempt against one broker — including skips over open breakers.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    pub broker: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// The executor's answer for one position request.
#[derive(Debug, Clone, Serialize)]
pub struct OrderResult {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub status: OrderStatus,
    pub filled_avg_price: Option<f64>,
    /// The broker that filled it.
    pub broker: String,
    pub attempts: Vec<ExecutionAttempt>,
    /// Protective stop order id, when one was requested and placed.
    pub stop_order_id: Option<String>,
    /// The stop could not be placed and the entry was closed best-effort.
    pub emergency_closed: bool,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub failover_enabled: bool,
    pub breaker: BrokerBreakerConfig,
    /// Intra-broker retry schedule for transient submit errors. Default: a
    /// single attempt; the per-broker breaker owns repeated-failure policy.
    pub submit_retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            failover_enabled: true,
            breaker: BrokerBreakerConfig::default(),
            submit_retry: RetryPolicy::none(),
        }
    }
}

struct BrokerSlot {
    adapter: Arc<dyn BrokerAdapter>,
    breaker: BrokerBreaker,
}

pub struct MultiBrokerExecutor {
    slots: Vec<BrokerSlot>,
    config: ExecutorConfig,
}

impl MultiBrokerExecutor {
    /// `brokers` in priority order: primary first.
    pub fn new(brokers: Vec<Arc<dyn BrokerAdapter>>, config: ExecutorConfig) -> Self {
        let slots = brokers
            .into_iter()
            .map(|adapter| BrokerSlot {
                breaker: BrokerBreaker::new(config.breaker.clone()),
                adapter,
            })
            .collect();
        Self { slots, config }
    }

    pub fn broker_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|s| s.adapter.name().to_string())
            .collect()
    }

    pub fn breaker_status(&self, broker: &str) -> Option<BreakerStatus> {
        self.slot(broker).map(|s| s.breaker.status())
    }

    pub fn breaker_failure_count(&self, broker: &str) -> Option<u32> {
        self.slot(broker).map(|s| s.breaker.failure_count())
    }

    fn slot(&self, broker: &str) -> Option<&BrokerSlot> {
        self.slots.iter().find(|s| s.adapter.name() == broker)
    }

    /// At least one broker answers its health endpoint.
    pub async fn any_broker_healthy(&self) -> bool {
        for slot in &self.slots {
            if slot.adapter.health_check().await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Account snapshot from the first broker that can produce one.
    pub async fn primary_account(
        &self,
    ) -> Result<crate::broker::AccountInfo, EngineError> {
        let mut last_error = "no brokers configured".to_string();
        for slot in &self.slots {
            match slot.adapter.get_account().await {
                Ok(account) => return Ok(account),
                Err(e) => last_error = format!("{}: {e}", slot.adapter.name()),
            }
        }
        Err(EngineError::ExecutionFailed { last_error })
    }

    // -------------------------------------------------------------------------
    // Submit with failover
    // -------------------------------------------------------------------------

    /// Submit a position request, failing over down the priority list.
    /// Attempts against one broker complete before the next is tried.
    pub async fn submit(&self, request: &PositionRequest) -> Result<OrderResult, EngineError> {
        let attempts: Mutex<Vec<ExecutionAttempt>> = Mutex::new(Vec::new());
        let mut last_error = "no brokers configured".to_string();

        for (priority, slot) in self.slots.iter().enumerate() {
            if priority > 0 && !self.config.failover_enabled {
                warn!(symbol = %request.symbol, "failover disabled — not trying backup brokers");
                break;
            }

            let broker = slot.adapter.name().to_string();
            if !slot.breaker.available(&broker) {
                info!(broker = %broker, "skipping broker with open breaker");
                attempts.lock().push(ExecutionAttempt {
                    broker: broker.clone(),
                    success: false,
                    error: Some("circuit breaker open".to_string()),
                    latency_ms: 0,
                });
                last_error = format!("{broker}: circuit breaker open");
                continue;
            }

            match self.try_broker(slot, request, &attempts).await {
                Ok(order) => {
                    let mut result = self.attach_protective_stop(slot, request, order).await;
                    result.attempts = attempts.into_inner();
                    return Ok(result);
                }
                Err(e) => {
                    last_error = format!("{broker}: {e}");
                }
            }
        }

        error!(
            symbol = %request.symbol,
            last_error = %last_error,
            "all brokers failed"
        );
        Err(EngineError::ExecutionFailed { last_error })
    }

    /// One broker's shot at the order: whole-share rounding when needed,
    /// submit with the configured retry schedule, breaker bookkeeping.
    async fn try_broker(
        &self,
        slot: &BrokerSlot,
        request: &PositionRequest,
        attempts: &Mutex<Vec<ExecutionAttempt>>,
    ) -> Result<BrokerOrder, BrokerError> {
        let broker = slot.adapter.name().to_string();

        // Whole-share venues get notional rounded down at the latest quote.
        let (qty, notional) = if request.notional.is_some() && !slot.adapter.supports_notional() {
            let started = Instant::now();
            let quote = match slot.adapter.latest_quote(&request.symbol).await {
                Ok(q) => q,
                Err(e) => {
                    slot.breaker.on_failure(&broker);
                    attempts.lock().push(ExecutionAttempt {
                        broker: broker.clone(),
                        success: false,
                        error: Some(format!("quote lookup failed: {e}")),
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                    return Err(e);
                }
            };
            let shares = (request.notional.unwrap_or(0.0) / quote).floor();
            if shares < 1.0 {
                let err = BrokerError::rejected(format!(
                    "notional {:.2} rounds to zero shares at {quote:.2}",
                    request.notional.unwrap_or(0.0)
                ));
                attempts.lock().push(ExecutionAttempt {
                    broker: broker.clone(),
                    success: false,
                    error: Some(err.message.clone()),
                    latency_ms: started.elapsed().as_millis() as u64,
                });
                return Err(err);
            }
            info!(
                broker = %broker,
                symbol = %request.symbol,
                shares,
                quote,
                "rounded notional to whole shares for backup venue"
            );
            (Some(shares), None)
        } else {
            (request.qty, request.notional)
        };

        let order_request = OrderRequest {
            client_order_id: request.request_id.to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            qty,
            notional,
            kind: OrderKind::Market,
            tif: request.tif,
        };

        let outcome = retry_with_backoff(
            &self.config.submit_retry,
            "broker_submit",
            None,
            |_attempt| {
                let order_request = order_request.clone();
                let broker = broker.clone();
                async move {
                    let started = Instant::now();
                    let result = slot.adapter.submit_order(&order_request).await;
                    let latency_ms = started.elapsed().as_millis() as u64;

                    let result = result.and_then(|order| {
                        if order.status == OrderStatus::Rejected {
                            Err(BrokerError::rejected(format!(
                                "order rejected by {broker}"
                            )))
                        } else {
                            Ok(order)
                        }
                    });

                    match &result {
                        Ok(order) => {
                            slot.breaker.on_success(&broker);
                            attempts.lock().push(ExecutionAttempt {
                                broker: broker.clone(),
                                success: true,
                                error: None,
                                latency_ms,
                            });
                            info!(
                                broker = %broker,
                                symbol = %order.symbol,
                                order_id = %order.id,
                                status = ?order.status,
                                "order submitted"
                            );
                        }
                        Err(e) => {
                            slot.breaker.on_failure(&broker);
                            attempts.lock().push(ExecutionAttempt {
                                broker: broker.clone(),
                                success: false,
                                error: Some(e.message.clone()),
                                latency_ms,
                            });
                            warn!(broker = %broker, error = %e, "order submit failed");
                        }
                    }
                    result
                }
            },
        )
        .await;

        outcome
    }

    /// Place the protective stop on the broker that filled the entry. A
    /// failed stop placement closes the fresh position best-effort.
    async fn attach_protective_stop(
        &self,
        slot: &BrokerSlot,
        request: &PositionRequest,
        order: BrokerOrder,
    ) -> OrderResult {
        let broker = slot.adapter.name().to_string();
        let mut result = OrderResult {
            id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            status: order.status,
            filled_avg_price: order.filled_avg_price,
            broker: broker.clone(),
            attempts: Vec::new(),
            stop_order_id: None,
            emergency_closed: false,
        };

        let Some(stop_price) = request.stop_loss_price else {
            return result;
        };

        // Whole-share venues report integral fills; fractional venues take
        // the filled quantity as-is.
        let stop_qty = if order.qty > 0.0 {
            order.qty
        } else {
            request.qty.unwrap_or(0.0)
        };
        let stop_request = OrderRequest {
            client_order_id: format!("{}:stop", request.request_id),
            symbol: request.symbol.clone(),
            side: request.side.opposite(),
            qty: Some(stop_qty),
            notional: None,
            kind: OrderKind::Stop { stop_price },
            tif: TimeInForce::Gtc,
        };

        match slot.adapter.submit_order(&stop_request).await {
            Ok(stop_order) => {
                info!(
                    broker = %broker,
                    symbol = %request.symbol,
                    stop_order_id = %stop_order.id,
                    stop_price,
                    "protective stop attached"
                );
                result.stop_order_id = Some(stop_order.id);
                result
            }
            Err(e) => {
                error!(
                    broker = %broker,
                    symbol = %request.symbol,
                    error = %e,
                    "CRITICAL: protective stop placement failed — emergency-closing position"
                );
                let close_request = OrderRequest {
                    client_order_id: format!("{}:close", request.request_id),
                    symbol: request.symbol.clone(),
                    side: request.side.opposite(),
                    qty: Some(stop_qty),
                    notional: None,
                    kind: OrderKind::Market,
                    tif: TimeInForce::Day,
                };
                if let Err(close_err) = slot.adapter.submit_order(&close_request).await {
                    error!(
                        broker = %broker,
                        symbol = %request.symbol,
                        error = %close_err,
                        "CRITICAL: emergency close also failed — position is unprotected"
                    );
                }
                result.emergency_closed = true;
                result
            }
        }
    }
}

impl std::fmt::Debug for MultiBrokerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiBrokerExecutor")
            .field("brokers", &self.broker_names())
            .field("failover_enabled", &self.config.failover_enabled)
            .finish()
    }
}
