// =============================================================================
// Paper broker — deterministic in-memory adapter
// =============================================================================
//
// The default broker set in paper-trading mode and the workhorse of the
// scenario tests. Semantics are intentionally simple and deterministic:
//
//   - Market orders fill immediately at the posted quote.
//   - Stop orders are accepted and held (never triggered spontaneously).
//   - Submission is idempotent on `client_order_id`: a duplicate submit
//     returns the original order untouched.
//   - Test hooks can script failures and change quotes.
// =============================================================================

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{
    AccountInfo, BrokerAdapter, BrokerError, BrokerOrder, BrokerPosition, OrderKind,
    OrderRequest, OrderStatus,
};
use crate::types::Side;

struct Inner {
    cash: f64,
    quotes: BTreeMap<String, f64>,
    positions: BTreeMap<String, BrokerPosition>,
    /// Keyed by client_order_id for idempotency.
    orders: BTreeMap<String, BrokerOrder>,
    /// Scripted failures: each submit consumes one entry while non-zero.
    fail_submits_remaining: u32,
    /// Reject protective stop orders (exercises the emergency-close path).
    reject_stops: bool,
    healthy: bool,
    next_order_seq: u64,
}

pub struct PaperBroker {
    name: String,
    supports_notional: bool,
    inner: RwLock<Inner>,
}

impl PaperBroker {
    pub fn new(name: impl Into<String>, starting_cash: f64) -> Self {
        Self {
            name: name.into(),
            supports_notional: true,
            inner: RwLock::new(Inner {
                cash: starting_cash,
                quotes: BTreeMap::new(),
                positions: BTreeMap::new(),
                orders: BTreeMap::new(),
                fail_submits_remaining: 0,
                reject_stops: false,
                healthy: true,
                next_order_seq: 1,
            }),
        }
    }

    /// A paper broker that only accepts whole-share quantities, standing in
    /// for backup venues without fractional support.
    pub fn whole_share(name: impl Into<String>, starting_cash: f64) -> Self {
        let mut broker = Self::new(name, starting_cash);
        broker.supports_notional = false;
        broker
    }

    pub fn set_quote(&self, symbol: &str, price: f64) {
        self.inner.write().quotes.insert(symbol.to_string(), price);
    }

    /// Script the next `n` submits to fail with a transient error.
    pub fn fail_next_submits(&self, n: u32) {
        self.inner.write().fail_submits_remaining = n;
    }

    /// Reject stop orders while leaving market orders untouched.
    pub fn reject_stop_orders(&self, reject: bool) {
        self.inner.write().reject_stops = reject;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.inner.write().healthy = healthy;
    }

    pub fn order_count(&self) -> usize {
        self.inner.read().orders.len()
    }

    pub fn filled_orders(&self) -> Vec<BrokerOrder> {
        self.inner
            .read()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Filled)
            .cloned()
            .collect()
    }

    fn quote_for(inner: &Inner, symbol: &str) -> Result<f64, BrokerError> {
        inner
            .quotes
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::rejected(format!("no quote for {symbol}")))
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_notional(&self) -> bool {
        self.supports_notional
    }

    async fn get_account(&self) -> Result<AccountInfo, BrokerError> {
        let inner = self.inner.read();
        let position_value: f64 = inner
            .positions
            .values()
            .map(|p| p.qty * p.market_price)
            .sum();
        Ok(AccountInfo {
            equity: inner.cash + position_value,
            buying_power: inner.cash,
            cash: inner.cash,
        })
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.inner.read().positions.values().cloned().collect())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder, BrokerError> {
        let mut inner = self.inner.write();

        // Idempotency: a repeated client_order_id returns the original.
        if let Some(existing) = inner.orders.get(&request.client_order_id) {
            debug!(
                broker = %self.name,
                client_order_id = %request.client_order_id,
                "duplicate submit — returning original order"
            );
            return Ok(existing.clone());
        }

        if inner.fail_submits_remaining > 0 {
            inner.fail_submits_remaining -= 1;
            return Err(BrokerError::transient("scripted failure"));
        }

        if inner.reject_stops && matches!(request.kind, OrderKind::Stop { .. }) {
            return Err(BrokerError::rejected("scripted stop rejection"));
        }

        if !self.supports_notional && request.notional.is_some() {
            return Err(BrokerError::rejected("notional orders not supported"));
        }

        let quote = Self::quote_for(&inner, &request.symbol)?;
        let qty = match (request.qty, request.notional) {
            (Some(qty), None) => qty,
            (None, Some(notional)) => notional / quote,
            _ => return Err(BrokerError::rejected("exactly one of qty/notional required")),
        };
        if qty <= 0.0 {
            return Err(BrokerError::rejected(format!("invalid quantity {qty}")));
        }

        let order_id = {
            let seq = inner.next_order_seq;
            inner.next_order_seq += 1;
            format!("{}-{}", self.name, seq)
        };

        let order = match request.kind {
            OrderKind::Market => {
                // Fill instantly at the quote and move the position.
                let signed_qty = qty * request.side.direction();
                let entry = inner
                    .positions
                    .entry(request.symbol.clone())
                    .or_insert_with(|| BrokerPosition {
                        symbol: request.symbol.clone(),
                        qty: 0.0,
                        avg_entry_price: quote,
                        market_price: quote,
                    });
                let new_qty = entry.qty + signed_qty;
                if entry.qty == 0.0 || entry.qty.signum() == signed_qty.signum() {
                    // Opening or adding: blend the average.
                    let total_cost =
                        entry.avg_entry_price * entry.qty.abs() + quote * qty;
                    entry.avg_entry_price = total_cost / (entry.qty.abs() + qty);
                }
                entry.qty = new_qty;
                entry.market_price = quote;
                if entry.qty.abs() < 1e-9 {
                    inner.positions.remove(&request.symbol);
                }
                inner.cash -= signed_qty * quote;

                BrokerOrder {
                    id: order_id,
                    client_order_id: request.client_order_id.clone(),
                    symbol: request.symbol.clone(),
                    side: request.side,
                    qty,
                    status: OrderStatus::Filled,
                    filled_avg_price: Some(quote),
                }
            }
            OrderKind::Stop { .. } => BrokerOrder {
                id: order_id,
                client_order_id: request.client_order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                qty,
                status: OrderStatus::Accepted,
                filled_avg_price: None,
            },
        };

        info!(
            broker = %self.name,
            symbol = %request.symbol,
            side = %request.side,
            qty,
            status = ?order.status,
            "paper order processed"
        );
        inner
            .orders
            .insert(request.client_order_id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.write();
        for order in inner.orders.values_mut() {
            if order.id == order_id {
                order.status = OrderStatus::Canceled;
                return Ok(());
            }
        }
        Err(BrokerError::rejected(format!("unknown order {order_id}")))
    }

    async fn list_open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(self
            .inner
            .read()
            .orders
            .values()
            .filter(|o| matches!(o.status, OrderStatus::Accepted | OrderStatus::PartiallyFilled))
            .cloned()
            .collect())
    }

    async fn latest_quote(&self, symbol: &str) -> Result<f64, BrokerError> {
        Self::quote_for(&self.inner.read(), symbol)
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        if self.inner.read().healthy {
            Ok(())
        } else {
            Err(BrokerError::transient("scripted unhealthy"))
        }
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PaperBroker")
            .field("name", &self.name)
            .field("cash", &inner.cash)
            .field("orders", &inner.orders.len())
            .field("positions", &inner.positions.len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeInForce;

    fn market_order(client_id: &str, notional: f64) -> OrderRequest {
        OrderRequest {
            client_order_id: client_id.to_string(),
            symbol: "SPY".into(),
            side: Side::Buy,
            qty: None,
            notional: Some(notional),
            kind: OrderKind::Market,
            tif: TimeInForce::Day,
        }
    }

    #[tokio::test]
    async fn market_order_fills_at_quote() {
        let broker = PaperBroker::new("paper", 100_000.0);
        broker.set_quote("SPY", 500.0);

        let order = broker.submit_order(&market_order("req-1", 1_000.0)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_avg_price, Some(500.0));
        assert!((order.qty - 2.0).abs() < 1e-9);

        let positions = broker.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].qty - 2.0).abs() < 1e-9);

        let account = broker.get_account().await.unwrap();
        assert!((account.cash - 99_000.0).abs() < 1e-6);
        assert!((account.equity - 100_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn duplicate_client_order_id_fills_at_most_once() {
        let broker = PaperBroker::new("paper", 100_000.0);
        broker.set_quote("SPY", 500.0);

        let first = broker.submit_order(&market_order("req-1", 1_000.0)).await.unwrap();
        let second = broker.submit_order(&market_order("req-1", 1_000.0)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(broker.filled_orders().len(), 1);
        // Cash moved exactly once.
        let account = broker.get_account().await.unwrap();
        assert!((account.cash - 99_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn sell_closes_position_and_returns_cash() {
        let broker = PaperBroker::new("paper", 100_000.0);
        broker.set_quote("SPY", 500.0);
        broker.submit_order(&market_order("open", 1_000.0)).await.unwrap();

        broker.set_quote("SPY", 510.0);
        let close = OrderRequest {
            client_order_id: "close".into(),
            symbol: "SPY".into(),
            side: Side::Sell,
            qty: Some(2.0),
            notional: None,
            kind: OrderKind::Market,
            tif: TimeInForce::Day,
        };
        broker.submit_order(&close).await.unwrap();

        assert!(broker.list_positions().await.unwrap().is_empty());
        let account = broker.get_account().await.unwrap();
        assert!((account.cash - 100_020.0).abs() < 1e-6, "cash {}", account.cash);
    }

    #[tokio::test]
    async fn stop_orders_are_held_open() {
        let broker = PaperBroker::new("paper", 100_000.0);
        broker.set_quote("SPY", 500.0);

        let stop = OrderRequest {
            client_order_id: "stop-1".into(),
            symbol: "SPY".into(),
            side: Side::Sell,
            qty: Some(2.0),
            notional: None,
            kind: OrderKind::Stop { stop_price: 490.0 },
            tif: TimeInForce::Gtc,
        };
        let order = broker.submit_order(&stop).await.unwrap();
        assert_eq!(order.status, OrderStatus::Accepted);
        assert_eq!(broker.list_open_orders().await.unwrap().len(), 1);

        broker.cancel_order(&order.id).await.unwrap();
        assert!(broker.list_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_then_recovery() {
        let broker = PaperBroker::new("paper", 100_000.0);
        broker.set_quote("SPY", 500.0);
        broker.fail_next_submits(2);

        assert!(broker.submit_order(&market_order("a", 100.0)).await.is_err());
        assert!(broker.submit_order(&market_order("b", 100.0)).await.is_err());
        assert!(broker.submit_order(&market_order("c", 100.0)).await.is_ok());
    }

    #[tokio::test]
    async fn whole_share_broker_rejects_notional() {
        let broker = PaperBroker::whole_share("backup", 100_000.0);
        broker.set_quote("SPY", 500.0);
        assert!(!broker.supports_notional());

        let err = broker.submit_order(&market_order("a", 1_000.0)).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn unknown_symbol_is_rejected() {
        let broker = PaperBroker::new("paper", 100_000.0);
        let err = broker.submit_order(&market_order("a", 1_000.0)).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn health_check_scripting() {
        let broker = PaperBroker::new("paper", 100_000.0);
        assert!(broker.health_check().await.is_ok());
        broker.set_healthy(false);
        assert!(broker.health_check().await.is_err());
    }
}
