// =============================================================================
// Alpaca broker adapter — primary venue, fractional shares by notional
// =============================================================================
//
// Auth is key + secret headers on every request; no request signing. The
// paper and live environments differ only by base URL. Quotes come from the
// separate market-data host.
// =============================================================================

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::{
    AccountInfo, BrokerAdapter, BrokerError, BrokerOrder, BrokerPosition, OrderKind,
    OrderRequest, OrderStatus,
};
use crate::types::Side;

pub struct AlpacaBroker {
    name: String,
    trading_url: String,
    data_url: String,
    api_key: String,
    api_secret: String,
    client: reqwest::Client,
}

impl AlpacaBroker {
    pub fn new(
        trading_url: impl Into<String>,
        data_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            name: "alpaca".to_string(),
            trading_url: trading_url.into(),
            data_url: data_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    pub fn paper(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self::new(
            "https://paper-api.alpaca.markets",
            "https://data.alpaca.markets",
            api_key,
            api_secret,
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
    }

    async fn read_json(
        resp: reqwest::Response,
        context: &str,
    ) -> Result<serde_json::Value, BrokerError> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::transient(format!("{context}: parse failed: {e}")))?;
        if !status.is_success() {
            return Err(BrokerError::from_status(status, &format!("{context}: {body}")));
        }
        Ok(body)
    }

    fn parse_order(body: &serde_json::Value) -> Result<BrokerOrder, BrokerError> {
        let field = |k: &str| body[k].as_str().unwrap_or_default().to_string();
        let num = |k: &str| {
            body[k]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .or_else(|| body[k].as_f64())
        };

        let status = match body["status"].as_str().unwrap_or("") {
            "filled" => OrderStatus::Filled,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "canceled" | "expired" => OrderStatus::Canceled,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Accepted,
        };
        let side = match body["side"].as_str().unwrap_or("buy") {
            "sell" => Side::Sell,
            _ => Side::Buy,
        };

        Ok(BrokerOrder {
            id: field("id"),
            client_order_id: field("client_order_id"),
            symbol: field("symbol"),
            side,
            qty: num("filled_qty").or_else(|| num("qty")).unwrap_or(0.0),
            status,
            filled_avg_price: num("filled_avg_price"),
        })
    }
}

#[async_trait]
impl BrokerAdapter for AlpacaBroker {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_notional(&self) -> bool {
        true
    }

    #[instrument(skip(self), name = "alpaca::get_account")]
    async fn get_account(&self) -> Result<AccountInfo, BrokerError> {
        let resp = self
            .request(reqwest::Method::GET, format!("{}/v2/account", self.trading_url))
            .send()
            .await
            .map_err(|e| BrokerError::transient(format!("account request failed: {e}")))?;
        let body = Self::read_json(resp, "GET /v2/account").await?;

        let num = |k: &str| {
            body[k]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .or_else(|| body[k].as_f64())
                .unwrap_or(0.0)
        };
        Ok(AccountInfo {
            equity: num("equity"),
            buying_power: num("buying_power"),
            cash: num("cash"),
        })
    }

    #[instrument(skip(self), name = "alpaca::list_positions")]
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let resp = self
            .request(reqwest::Method::GET, format!("{}/v2/positions", self.trading_url))
            .send()
            .await
            .map_err(|e| BrokerError::transient(format!("positions request failed: {e}")))?;
        let body = Self::read_json(resp, "GET /v2/positions").await?;

        let raw = body
            .as_array()
            .ok_or_else(|| BrokerError::transient("positions response is not an array"))?;

        let mut positions = Vec::with_capacity(raw.len());
        for entry in raw {
            let num = |k: &str| {
                entry[k]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .or_else(|| entry[k].as_f64())
                    .unwrap_or(0.0)
            };
            positions.push(BrokerPosition {
                symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                qty: num("qty"),
                avg_entry_price: num("avg_entry_price"),
                market_price: num("current_price"),
            });
        }
        debug!(count = positions.len(), "alpaca positions listed");
        Ok(positions)
    }

    #[instrument(skip(self, request), name = "alpaca::submit_order", fields(symbol = %request.symbol))]
    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder, BrokerError> {
        let mut payload = json!({
            "symbol": request.symbol,
            "side": request.side.to_string(),
            "time_in_force": request.tif.to_string(),
            "client_order_id": request.client_order_id,
        });

        match request.kind {
            OrderKind::Market => {
                payload["type"] = json!("market");
            }
            OrderKind::Stop { stop_price } => {
                payload["type"] = json!("stop");
                payload["stop_price"] = json!(format!("{stop_price:.2}"));
            }
        }
        match (request.qty, request.notional) {
            (Some(qty), None) => payload["qty"] = json!(qty.to_string()),
            (None, Some(notional)) => payload["notional"] = json!(format!("{notional:.2}")),
            _ => {
                return Err(BrokerError::rejected(
                    "exactly one of qty/notional required",
                ))
            }
        }

        debug!(payload = %payload, "submitting alpaca order");
        let resp = self
            .request(reqwest::Method::POST, format!("{}/v2/orders", self.trading_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrokerError::transient(format!("order request failed: {e}")))?;
        let body = Self::read_json(resp, "POST /v2/orders").await?;
        Self::parse_order(&body)
    }

    #[instrument(skip(self), name = "alpaca::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/v2/orders/{}", self.trading_url, order_id),
            )
            .send()
            .await
            .map_err(|e| BrokerError::transient(format!("cancel request failed: {e}")))?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            warn!(order_id, %status, "alpaca cancel failed");
            Err(BrokerError::from_status(status, &body))
        }
    }

    #[instrument(skip(self), name = "alpaca::list_open_orders")]
    async fn list_open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                format!("{}/v2/orders?status=open", self.trading_url),
            )
            .send()
            .await
            .map_err(|e| BrokerError::transient(format!("open orders request failed: {e}")))?;
        let body = Self::read_json(resp, "GET /v2/orders").await?;

        body.as_array()
            .ok_or_else(|| BrokerError::transient("orders response is not an array"))?
            .iter()
            .map(Self::parse_order)
            .collect()
    }

    #[instrument(skip(self), name = "alpaca::latest_quote")]
    async fn latest_quote(&self, symbol: &str) -> Result<f64, BrokerError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                format!("{}/v2/stocks/{}/trades/latest", self.data_url, symbol),
            )
            .send()
            .await
            .map_err(|e| BrokerError::transient(format!("quote request failed: {e}")))?;
        let body = Self::read_json(resp, "GET trades/latest").await?;

        body["trade"]["p"]
            .as_f64()
            .filter(|p| *p > 0.0)
            .ok_or_else(|| BrokerError::transient(format!("no usable quote for {symbol}")))
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        self.get_account().await.map(|_| ())
    }
}

impl std::fmt::Debug for AlpacaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaBroker")
            .field("trading_url", &self.trading_url)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_filled_order() {
        let body = json!({
            "id": "ord-1",
            "client_order_id": "req-1",
            "symbol": "SPY",
            "side": "buy",
            "qty": "2",
            "filled_qty": "2",
            "filled_avg_price": "500.25",
            "status": "filled",
        });
        let order = AlpacaBroker::parse_order(&body).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.client_order_id, "req-1");
        assert!((order.qty - 2.0).abs() < 1e-9);
        assert_eq!(order.filled_avg_price, Some(500.25));
    }

    #[test]
    fn parse_accepted_order_without_fill() {
        let body = json!({
            "id": "ord-2",
            "client_order_id": "req-2",
            "symbol": "SPY",
            "side": "sell",
            "qty": "3",
            "status": "new",
        });
        let order = AlpacaBroker::parse_order(&body).unwrap();
        assert_eq!(order.status, OrderStatus::Accepted);
        assert_eq!(order.side, Side::Sell);
        assert!(order.filled_avg_price.is_none());
    }

    #[test]
    fn parse_rejected_order() {
        let body = json!({
            "id": "ord-3",
            "client_order_id": "req-3",
            "symbol": "SPY",
            "side": "buy",
            "status": "rejected",
        });
        let order = AlpacaBroker::parse_order(&body).unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
    }
}
