// =============================================================================
// Broker adapters — the transport-agnostic order interface
// =============================================================================
//
// The executor only ever sees this contract. Adapters own their transport
// (REST shapes, auth schemes, error taxonomies) and normalise everything
// into `BrokerOrder` / `BrokerError`. The primary broker supports
// fractional notional orders; backups may be whole-share only, which the
// executor handles by rounding at the latest quote.
// =============================================================================

pub mod alpaca;
pub mod gateway;
pub mod paper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::retry::Retryable;
use crate::types::{Side, TimeInForce};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Account snapshot from `get_account`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub equity: f64,
    pub buying_power: f64,
    pub cash: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Accepted,
    Filled,
    PartiallyFilled,
    Canceled,
    Rejected,
}

/// Order kind the executor submits: plain market entries/exits and
/// protective stops.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OrderKind {
    Market,
    Stop { stop_price: f64 },
}

/// Normalised order request handed to an adapter.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    /// Client-generated idempotency key; adapters MUST pass it to the
    /// underlying broker as the client order id.
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    /// Exactly one of `qty` / `notional` is set (mirrors PositionRequest).
    pub qty: Option<f64>,
    pub notional: Option<f64>,
    pub kind: OrderKind,
    pub tif: TimeInForce,
}

/// Normalised order state returned by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub status: OrderStatus,
    pub filled_avg_price: Option<f64>,
}

/// A position as the broker reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub avg_entry_price: f64,
    pub market_price: f64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BrokerError {
    pub message: String,
    /// 5xx / transport trouble retries; 4xx rejections do not.
    pub retryable: bool,
}

impl BrokerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body_hint: &str) -> Self {
        if status.is_server_error() || status.as_u16() == 429 {
            Self::transient(format!("HTTP {status}: {body_hint}"))
        } else {
            Self::rejected(format!("HTTP {status}: {body_hint}"))
        }
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BrokerError {}

impl Retryable for BrokerError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

// ---------------------------------------------------------------------------
// The adapter contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Stable identifier used in logs, breakers, and order results.
    fn name(&self) -> &str;

    /// Whether notional (fractional-share) orders are accepted. When false
    /// the executor rounds notional to whole shares at the latest quote.
    fn supports_notional(&self) -> bool;

    async fn get_account(&self) -> Result<AccountInfo, BrokerError>;

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn list_open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    /// Latest trade price for a symbol; used for whole-share rounding.
    async fn latest_quote(&self, symbol: &str) -> Result<f64, BrokerError>;

    async fn health_check(&self) -> Result<(), BrokerError>;
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(BrokerError::from_status(reqwest::StatusCode::BAD_GATEWAY, "x").retryable);
        assert!(BrokerError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "x").retryable);
        assert!(!BrokerError::from_status(reqwest::StatusCode::UNPROCESSABLE_ENTITY, "x").retryable);
        assert!(!BrokerError::from_status(reqwest::StatusCode::FORBIDDEN, "x").retryable);
    }

    #[test]
    fn order_kind_serialises_with_tag() {
        let json = serde_json::to_value(OrderKind::Stop { stop_price: 490.0 }).unwrap();
        assert_eq!(json["type"], "stop");
        assert_eq!(json["stop_price"], 490.0);
    }
}
