// =============================================================================
// Gateway broker adapter — HMAC-SHA256 signed backup venue, whole shares
// =============================================================================
//
// Backup venue behind a generic brokerage gateway REST API. Every request
// carries the API key as a header and an HMAC-SHA256 signature over the
// query string (timestamp included, 5s recv-window server side). The venue
// only accepts whole-share quantities — the executor rounds notional down
// using the latest quote before the request reaches this adapter.
//
// SECURITY: the secret is used exclusively for signing and never logged or
// serialized.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

use super::{
    AccountInfo, BrokerAdapter, BrokerError, BrokerOrder, BrokerPosition, OrderKind,
    OrderRequest, OrderStatus,
};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

pub struct GatewayBroker {
    name: String,
    base_url: String,
    api_key: String,
    secret: String,
    client: reqwest::Client,
}

impl GatewayBroker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            name: "gateway".to_string(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            secret: secret.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    /// HMAC-SHA256 hex signature over `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Append timestamp and signature to a query string.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn signed_call(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, BrokerError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method, &url)
            .header("X-GW-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| BrokerError::transient(format!("{path} request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::transient(format!("{path} parse failed: {e}")))?;
        if !status.is_success() {
            return Err(BrokerError::from_status(status, &format!("{path}: {body}")));
        }
        Ok(body)
    }

    fn parse_order(body: &serde_json::Value) -> BrokerOrder {
        let status = match body["status"].as_str().unwrap_or("") {
            "FILLED" => OrderStatus::Filled,
            "PARTIAL" => OrderStatus::PartiallyFilled,
            "CANCELED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Accepted,
        };
        let side = match body["side"].as_str().unwrap_or("BUY") {
            "SELL" => Side::Sell,
            _ => Side::Buy,
        };
        BrokerOrder {
            id: body["orderId"]
                .as_u64()
                .map(|v| v.to_string())
                .or_else(|| body["orderId"].as_str().map(String::from))
                .unwrap_or_default(),
            client_order_id: body["clientOrderId"].as_str().unwrap_or_default().to_string(),
            symbol: body["symbol"].as_str().unwrap_or_default().to_string(),
            side,
            qty: body["executedQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| body["executedQty"].as_f64())
                .or_else(|| body["qty"].as_f64())
                .unwrap_or(0.0),
            status,
            filled_avg_price: body["avgPrice"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| body["avgPrice"].as_f64())
                .filter(|p| *p > 0.0),
        }
    }
}

#[async_trait]
impl BrokerAdapter for GatewayBroker {
    fn name(&self) -> &str {
        &self.name
    }

    /// Whole-share venue; the executor must round notional before calling.
    fn supports_notional(&self) -> bool {
        false
    }

    #[instrument(skip(self), name = "gateway::get_account")]
    async fn get_account(&self) -> Result<AccountInfo, BrokerError> {
        let body = self
            .signed_call(reqwest::Method::GET, "/v1/account", "")
            .await?;
        Ok(AccountInfo {
            equity: body["equity"].as_f64().unwrap_or(0.0),
            buying_power: body["buyingPower"].as_f64().unwrap_or(0.0),
            cash: body["cash"].as_f64().unwrap_or(0.0),
        })
    }

    #[instrument(skip(self), name = "gateway::list_positions")]
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let body = self
            .signed_call(reqwest::Method::GET, "/v1/positions", "")
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| BrokerError::transient("positions response is not an array"))?;
        Ok(raw
            .iter()
            .map(|entry| BrokerPosition {
                symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                qty: entry["qty"].as_f64().unwrap_or(0.0),
                avg_entry_price: entry["avgPrice"].as_f64().unwrap_or(0.0),
                market_price: entry["markPrice"].as_f64().unwrap_or(0.0),
            })
            .collect())
    }

    #[instrument(skip(self, request), name = "gateway::submit_order", fields(symbol = %request.symbol))]
    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder, BrokerError> {
        let Some(qty) = request.qty else {
            return Err(BrokerError::rejected(
                "gateway requires whole-share quantities",
            ));
        };
        if qty.fract() != 0.0 || qty <= 0.0 {
            return Err(BrokerError::rejected(format!(
                "gateway requires positive whole-share qty, got {qty}"
            )));
        }

        let side = request.side.to_string().to_uppercase();
        let mut params = format!(
            "symbol={}&side={}&qty={}&clientOrderId={}",
            request.symbol, side, qty, request.client_order_id
        );
        match request.kind {
            OrderKind::Market => params.push_str("&type=MARKET"),
            OrderKind::Stop { stop_price } => {
                params.push_str(&format!("&type=STOP&stopPrice={stop_price:.2}"));
            }
        }

        debug!(qty, "submitting gateway order");
        let body = self
            .signed_call(reqwest::Method::POST, "/v1/orders", &params)
            .await?;
        Ok(Self::parse_order(&body))
    }

    #[instrument(skip(self), name = "gateway::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.signed_call(
            reqwest::Method::DELETE,
            "/v1/orders",
            &format!("orderId={order_id}"),
        )
        .await
        .map(|_| ())
    }

    #[instrument(skip(self), name = "gateway::list_open_orders")]
    async fn list_open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let body = self
            .signed_call(reqwest::Method::GET, "/v1/openOrders", "")
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| BrokerError::transient("openOrders response is not an array"))?;
        Ok(raw.iter().map(Self::parse_order).collect())
    }

    #[instrument(skip(self), name = "gateway::latest_quote")]
    async fn latest_quote(&self, symbol: &str) -> Result<f64, BrokerError> {
        // Quote endpoint is public; no signature required.
        let url = format!("{}/v1/quote?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::transient(format!("quote request failed: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::transient(format!("quote parse failed: {e}")))?;
        if !status.is_success() {
            return Err(BrokerError::from_status(status, "quote"));
        }
        body["price"]
            .as_f64()
            .filter(|p| *p > 0.0)
            .ok_or_else(|| BrokerError::transient(format!("no usable quote for {symbol}")))
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        self.signed_call(reqwest::Method::GET, "/v1/ping", "")
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for GatewayBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayBroker")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> GatewayBroker {
        GatewayBroker::new("https://gw.example.com", "key", "secret")
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let b = broker();
        let sig1 = b.sign("symbol=SPY&side=BUY&qty=2");
        let sig2 = b.sign("symbol=SPY&side=BUY&qty=2");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));

        // Different payloads must not collide.
        let sig3 = b.sign("symbol=SPY&side=SELL&qty=2");
        assert_ne!(sig1, sig3);
    }

    #[test]
    fn signed_query_appends_timestamp_and_signature() {
        let b = broker();
        let qs = b.signed_query("symbol=SPY");
        assert!(qs.starts_with("symbol=SPY&timestamp="));
        assert!(qs.contains("&signature="));
    }

    #[tokio::test]
    async fn fractional_quantities_are_rejected_client_side() {
        let b = broker();
        let request = OrderRequest {
            client_order_id: "req-1".into(),
            symbol: "SPY".into(),
            side: Side::Buy,
            qty: Some(1.5),
            notional: None,
            kind: OrderKind::Market,
            tif: crate::types::TimeInForce::Day,
        };
        let err = b.submit_order(&request).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("whole-share"));
    }

    #[tokio::test]
    async fn notional_orders_are_rejected_client_side() {
        let b = broker();
        let request = OrderRequest {
            client_order_id: "req-1".into(),
            symbol: "SPY".into(),
            side: Side::Buy,
            qty: None,
            notional: Some(1_000.0),
            kind: OrderKind::Market,
            tif: crate::types::TimeInForce::Day,
        };
        assert!(b.submit_order(&request).await.is_err());
    }

    #[test]
    fn parse_gateway_order() {
        let body = serde_json::json!({
            "orderId": 991,
            "clientOrderId": "req-7",
            "symbol": "SPY",
            "side": "SELL",
            "executedQty": "3",
            "avgPrice": "501.10",
            "status": "FILLED",
        });
        let order = GatewayBroker::parse_order(&body);
        assert_eq!(order.id, "991");
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_avg_price, Some(501.10));
    }
}
