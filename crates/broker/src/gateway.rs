use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use common::{
    AccountSnapshot, Error, ExecutionEnv, Order, OrderKind, OrderSide, Result,
};

use crate::transport::{BracketOrder, BrokerTransport};

/// REST transport for the order gateway. Every request is signed with
/// HMAC-SHA256 over the query string plus a millisecond timestamp.
pub struct GatewayTransport {
    base_url: String,
    api_key: String,
    secret: String,
    http: Client,
}

impl GatewayTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            secret: secret.into(),
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_millis() as u64
    }

    fn sign(&self, payload: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<serde_json::Value>,
    ) -> Result<String> {
        let ts = Self::timestamp_ms();
        let canonical = format!("{query}&timestamp={ts}");
        let signature = self.sign(&canonical);
        let url = format!("{}{path}?{canonical}&signature={signature}", self.base_url);

        let mut request = self
            .http
            .request(method, &url)
            .header("X-API-KEY", &self.api_key);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request.send().await.map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if status.is_success() {
            Ok(text)
        } else if status.is_server_error() {
            Err(Error::BrokerTransient(format!("gateway HTTP {status}: {text}")))
        } else {
            Err(Error::BrokerPermanent(format!("gateway HTTP {status}: {text}")))
        }
    }
}

#[async_trait]
impl BrokerTransport for GatewayTransport {
    async fn submit_bracket(
        &self,
        bracket: &BracketOrder,
        env: &ExecutionEnv,
    ) -> Result<Vec<Order>> {
        debug!(
            symbol = %bracket.symbol,
            bracket = %bracket.bracket_id,
            "submitting bracket to gateway"
        );
        let body = serde_json::json!({
            "client_bracket_id": bracket.bracket_id,
            "symbol": bracket.symbol,
            "side": bracket.side.to_string(),
            "qty": bracket.qty,
            "entry": bracket.entry_price,
            "take_profit": bracket.take_profit,
            "stop_loss": bracket.stop_loss,
        });
        let text = self
            .signed_request(
                reqwest::Method::POST,
                "/v1/brackets",
                &format!("account={}", env.account_id),
                Some(body),
            )
            .await?;

        let resp: BracketResponse =
            serde_json::from_str(&text).map_err(|e| Error::BrokerPermanent(e.to_string()))?;
        Ok(resp
            .orders
            .into_iter()
            .map(|o| o.into_order(&bracket.symbol))
            .collect())
    }

    async fn submit_market(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        env: &ExecutionEnv,
    ) -> Result<Order> {
        let body = serde_json::json!({
            "symbol": symbol,
            "side": side.to_string(),
            "qty": qty,
            "type": "market",
        });
        let text = self
            .signed_request(
                reqwest::Method::POST,
                "/v1/orders",
                &format!("account={}", env.account_id),
                Some(body),
            )
            .await?;
        let resp: OrderPayload =
            serde_json::from_str(&text).map_err(|e| Error::BrokerPermanent(e.to_string()))?;
        Ok(resp.into_order(symbol))
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order_id: &str,
        env: &ExecutionEnv,
    ) -> Result<()> {
        self.signed_request(
            reqwest::Method::DELETE,
            &format!("/v1/orders/{order_id}"),
            &format!("account={}", env.account_id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn open_orders(&self, symbol: &str, env: &ExecutionEnv) -> Result<Vec<Order>> {
        let text = self
            .signed_request(
                reqwest::Method::GET,
                "/v1/orders",
                &format!("account={}&symbol={symbol}&status=open", env.account_id),
                None,
            )
            .await?;
        let resp: OrdersResponse =
            serde_json::from_str(&text).map_err(|e| Error::BrokerPermanent(e.to_string()))?;
        Ok(resp
            .orders
            .into_iter()
            .map(|o| o.into_order(symbol))
            .collect())
    }

    async fn account_state(&self, env: &ExecutionEnv) -> Result<AccountSnapshot> {
        let text = self
            .signed_request(
                reqwest::Method::GET,
                "/v1/account",
                &format!("account={}", env.account_id),
                None,
            )
            .await?;
        let resp: AccountResponse =
            serde_json::from_str(&text).map_err(|e| Error::BrokerPermanent(e.to_string()))?;
        Ok(AccountSnapshot {
            buying_power: resp.buying_power,
            equity: resp.equity,
        })
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct BracketResponse {
    #[serde(default)]
    orders: Vec<OrderPayload>,
}

#[derive(Deserialize)]
struct OrdersResponse {
    #[serde(default)]
    orders: Vec<OrderPayload>,
}

#[derive(Deserialize)]
struct OrderPayload {
    id: String,
    side: String,
    qty: f64,
    #[serde(default)]
    limit_price: Option<f64>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    bracket_id: Option<String>,
}

impl OrderPayload {
    fn into_order(self, symbol: &str) -> Order {
        Order {
            id: self.id,
            symbol: symbol.to_string(),
            side: if self.side.eq_ignore_ascii_case("sell") {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            qty: self.qty,
            limit_price: self.limit_price,
            kind: match self.kind.as_deref() {
                Some("take_profit") => OrderKind::TakeProfit,
                Some("stop_loss") => OrderKind::StopLoss,
                _ => OrderKind::Entry,
            },
            bracket_id: self.bracket_id,
        }
    }
}

#[derive(Deserialize)]
struct AccountResponse {
    buying_power: f64,
    equity: f64,
}
