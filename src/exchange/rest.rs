//! Signed REST client: HMAC-SHA256 over the encoded query string,
//! `X-MBX-APIKEY` header, `timestamp`/`recvWindow` query params.
//!
//! The message signed is the encoded query string itself, and the signature
//! travels as a query parameter rather than a header.

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::debug;

use crate::error::ExchangeError;
use crate::exchange::ExchangeResult;
use crate::models::{Order, OrderTrade, OrderType, PositionSide, PositionSnapshot, Side};

type HmacSha256 = Hmac<Sha256>;

fn map_transport_err(e: reqwest::Error) -> ExchangeError {
    ExchangeError::Transient(e.to_string())
}

async fn check_status(resp: reqwest::Response) -> ExchangeResult<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16() as i32;
    let body = resp.text().await.unwrap_or_default();
    let (code, message) = parse_binance_error(&body).unwrap_or((status, body));
    Err(ExchangeError::Rejected { code, message })
}

fn parse_binance_error(body: &str) -> Option<(i32, String)> {
    #[derive(serde::Deserialize)]
    struct BinanceErr {
        code: i32,
        msg: String,
    }
    serde_json::from_str::<BinanceErr>(body).ok().map(|e| (e.code, e.msg))
}

/// Signed Binance USDT-M Futures REST client: order placement/cancellation,
/// account/position reads, leverage, listen-key lifecycle.
#[derive(Debug)]
pub struct SignedRestClient {
    http: Client,
    base_rest_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
}

impl SignedRestClient {
    pub fn new(
        base_rest_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        recv_window_ms: u64,
    ) -> Self {
        Self {
            http: Client::new(),
            base_rest_url: base_rest_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            recv_window_ms,
        }
    }

    /// Appends `timestamp`/`recvWindow`, signs the resulting query string,
    /// and returns the final query string with `signature` appended.
    fn sign(&self, mut query: String) -> String {
        let timestamp = Utc::now().timestamp_millis();
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}&recvWindow={}", timestamp, self.recv_window_ms));

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        debug!(query = %query, "signing request");
        format!("{query}&signature={signature}")
    }

    async fn signed_get(&self, path: &str, query: String) -> ExchangeResult<reqwest::Response> {
        let signed = self.sign(query);
        let url = format!("{}{}?{}", self.base_rest_url, path, signed);
        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport_err)?;
        check_status(resp).await
    }

    async fn signed_post(&self, path: &str, query: String) -> ExchangeResult<reqwest::Response> {
        let signed = self.sign(query);
        let url = format!("{}{}?{}", self.base_rest_url, path, signed);
        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport_err)?;
        check_status(resp).await
    }

    async fn signed_delete(&self, path: &str, query: String) -> ExchangeResult<reqwest::Response> {
        let signed = self.sign(query);
        let url = format!("{}{}?{}", self.base_rest_url, path, signed);
        let resp = self
            .http
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport_err)?;
        check_status(resp).await
    }

    pub async fn get_balance(&self) -> ExchangeResult<Decimal> {
        #[derive(serde::Deserialize)]
        struct BalanceEntry {
            asset: String,
            #[serde(rename = "availableBalance")]
            available_balance: Decimal,
        }
        let resp = self.signed_get("/fapi/v2/balance", String::new()).await?;
        let entries: Vec<BalanceEntry> = resp.json().await.map_err(map_transport_err)?;
        Ok(entries
            .into_iter()
            .find(|e| e.asset == "USDT")
            .map(|e| e.available_balance)
            .unwrap_or_default())
    }

    pub async fn get_position(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> ExchangeResult<Option<PositionSnapshot>> {
        #[derive(serde::Deserialize)]
        struct PositionRiskEntry {
            symbol: String,
            #[serde(rename = "positionAmt")]
            position_amt: Decimal,
            #[serde(rename = "entryPrice")]
            entry_price: Decimal,
            #[serde(rename = "positionSide")]
            position_side: String,
        }
        let query = format!("symbol={symbol}");
        let resp = self.signed_get("/fapi/v2/positionRisk", query).await?;
        let entries: Vec<PositionRiskEntry> = resp.json().await.map_err(map_transport_err)?;

        let wanted = match side {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        };
        Ok(entries
            .into_iter()
            .find(|e| e.symbol == symbol && e.position_side == wanted && !e.position_amt.is_zero())
            .map(|e| PositionSnapshot {
                direction: side,
                quantity: e.position_amt.abs(),
                entry_price: e.entry_price,
            }))
    }

    pub async fn get_order_trades(&self, symbol: &str, order_id: &str) -> ExchangeResult<Vec<OrderTrade>> {
        #[derive(serde::Deserialize)]
        struct UserTrade {
            #[serde(rename = "orderId")]
            order_id: i64,
            price: Decimal,
            qty: Decimal,
            commission: Decimal,
            #[serde(rename = "realizedPnl")]
            realized_pnl: Decimal,
        }
        let query = format!("symbol={symbol}");
        let resp = self.signed_get("/fapi/v1/userTrades", query).await?;
        let trades: Vec<UserTrade> = resp.json().await.map_err(map_transport_err)?;
        Ok(trades
            .into_iter()
            .filter(|t| t.order_id.to_string() == order_id)
            .map(|t| OrderTrade {
                order_id: t.order_id.to_string(),
                price: t.price,
                quantity: t.qty,
                commission: t.commission,
                realized_pnl: t.realized_pnl,
            })
            .collect())
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let query = format!("symbol={symbol}&leverage={leverage}");
        self.signed_post("/fapi/v1/leverage", query).await?;
        Ok(())
    }

    /// Routes to `/fapi/v1/order` for plain types, `/fapi/v1/algoOrder` for
    /// conditional types — the plain-vs-algo split clients of
    /// `ExchangeAdapter` must never observe.
    pub async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        position_side: PositionSide,
        quantity: Decimal,
        price: Option<Decimal>,
        stop_price: Option<Decimal>,
        reduce_only: bool,
        client_order_id: &str,
    ) -> ExchangeResult<String> {
        let side_str = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let position_side_str = match position_side {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        };
        let type_str = match order_type {
            OrderType::Limit => "LIMIT",
            OrderType::StopLimit => "STOP",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::Market => "MARKET",
        };

        let mut query = format!(
            "symbol={symbol}&side={side_str}&type={type_str}&positionSide={position_side_str}\
             &quantity={quantity}&reduceOnly={reduce_only}&newClientOrderId={client_order_id}"
        );
        if let Some(p) = price {
            query.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if let Some(sp) = stop_price {
            query.push_str(&format!("&stopPrice={sp}"));
        }

        let path = if order_type.is_algo() {
            "/fapi/v1/algoOrder"
        } else {
            "/fapi/v1/order"
        };

        #[derive(serde::Deserialize)]
        struct OrderAck {
            #[serde(rename = "orderId")]
            order_id: Option<i64>,
            #[serde(rename = "algoId")]
            algo_id: Option<i64>,
            #[serde(rename = "clientOrderId")]
            client_order_id: Option<String>,
        }
        let resp = self.signed_post(path, query).await?;
        let ack: OrderAck = resp.json().await.map_err(map_transport_err)?;

        Ok(ack
            .order_id
            .map(|id| id.to_string())
            .or(ack.algo_id.map(|id| id.to_string()))
            .or(ack.client_order_id)
            .unwrap_or_else(|| client_order_id.to_string()))
    }

    /// `-2011` (unknown order) is translated to `CancelStatus::Unknown`, not
    /// an error.
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<Order> {
        let query = format!("symbol={symbol}&orderId={order_id}");
        match self.signed_delete("/fapi/v1/order", query).await {
            Ok(_) => Ok(placeholder_cancelled_order(symbol, order_id)),
            Err(e) if e.is_unknown_order() => Ok(placeholder_cancelled_order(symbol, order_id)),
            Err(e) => Err(e),
        }
    }

    pub async fn cancel_all_open_orders(&self, symbol: &str) -> ExchangeResult<()> {
        let query = format!("symbol={symbol}");
        match self.signed_delete("/fapi/v1/allOpenOrders", query).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_unknown_order() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn start_user_data_stream(&self) -> ExchangeResult<String> {
        #[derive(serde::Deserialize)]
        struct ListenKeyResp {
            #[serde(rename = "listenKey")]
            listen_key: String,
        }
        let resp = self
            .http
            .post(format!("{}/fapi/v1/listenKey", self.base_rest_url))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport_err)?;
        let resp = check_status(resp).await?;
        let parsed: ListenKeyResp = resp.json().await.map_err(map_transport_err)?;
        Ok(parsed.listen_key)
    }

    pub async fn keepalive_user_data_stream(&self) -> ExchangeResult<()> {
        let resp = self
            .http
            .put(format!("{}/fapi/v1/listenKey", self.base_rest_url))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport_err)?;
        check_status(resp).await?;
        Ok(())
    }
}

/// cancel_order's only contract is {orderId, status}; the returned `Order`
/// is a stub the caller wraps with the actual `CancelStatus` it observed.
fn placeholder_cancelled_order(symbol: &str, order_id: &str) -> Order {
    Order {
        order_id: order_id.to_string(),
        symbol: symbol.to_string(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        quantity: Decimal::ZERO,
        price: None,
        stop_price: None,
        reduce_only: true,
        position_side: PositionSide::Long,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_fixed_query_and_secret() {
        let client = SignedRestClient::new("https://fapi.binance.com", "key", "secret", 5000);
        let signed_a = client.sign("symbol=BTCUSDT".to_string());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let signed_b = client.sign("symbol=BTCUSDT".to_string());
        // timestamps differ, so the signed strings differ, but both carry a
        // well-formed trailing signature of fixed hex length (sha256 = 64 hex chars).
        let sig_a = signed_a.rsplit("signature=").next().unwrap();
        let sig_b = signed_b.rsplit("signature=").next().unwrap();
        assert_eq!(sig_a.len(), 64);
        assert_eq!(sig_b.len(), 64);
    }

    #[test]
    fn market_order_through_algo_endpoint_is_a_programmer_error() {
        assert!(!OrderType::Market.is_algo());
    }
}
