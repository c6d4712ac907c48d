//! Live Exchange Adapter: real signed REST + two websocket sessions,
//! composed over the shared [`MarketDataClient`] and [`SignedRestClient`].
//!
//! Every algo order is assigned a bot-originated `clientAlgoId` of the form
//! `BOT-<timestamp>-<rand>` before submission, and an `algoId → clientAlgoId`
//! map resolves user-data events back to it. The emitted `orderId` prefers,
//! in order: a `BOT-`-prefixed client id, the mapped client id for an algo
//! id, else the numeric order id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::error::ExchangeError;
use crate::exchange::market_data::MarketDataClient;
use crate::exchange::rest::SignedRestClient;
use crate::exchange::rounding::floor_to_step;
use crate::exchange::session::{SessionState, SessionWatchdog, TransitionReason, RECONNECT_DELAY, WATCHDOG_INTERVAL};
use crate::exchange::{CancelOutcome, ExchangeAdapter, ExchangeResult, MarketEvent, NewOrderRequest};
use crate::models::{
    CancelStatus, Depth, Kline, LotFilters, Order, OrderTrade, PositionSide, PositionSnapshot,
    Side, Symbol, Ticker24h,
};

fn new_client_algo_id() -> String {
    let rand_suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("BOT-{}-{}", chrono::Utc::now().timestamp_millis(), rand_suffix)
}

pub struct LiveExchangeAdapter {
    market_data: Arc<MarketDataClient>,
    rest: Arc<SignedRestClient>,
    base_ws_url: String,

    symbols: RwLock<HashSet<Symbol>>,
    algo_id_map: RwLock<HashMap<String, String>>,

    events_tx: broadcast::Sender<MarketEvent>,
    market_watchdog: Arc<SessionWatchdog>,
    user_watchdog: Arc<SessionWatchdog>,

    /// Lets trait methods (`&self`) spawn background tasks that need their
    /// own `Arc` handle, without exposing construction-order requirements to
    /// callers. Set once, immediately, via `Arc::new_cyclic`.
    self_ref: Weak<Self>,
}

impl LiveExchangeAdapter {
    pub fn new(
        base_rest_url: impl Into<String>,
        base_ws_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        recv_window_ms: u64,
    ) -> Arc<Self> {
        let base_rest_url = base_rest_url.into();
        let (events_tx, _) = broadcast::channel(4096);
        Arc::new_cyclic(|weak| Self {
            market_data: Arc::new(MarketDataClient::new(base_rest_url.clone())),
            rest: Arc::new(SignedRestClient::new(base_rest_url, api_key, api_secret, recv_window_ms)),
            base_ws_url: base_ws_url.into(),
            symbols: RwLock::new(HashSet::new()),
            algo_id_map: RwLock::new(HashMap::new()),
            events_tx,
            market_watchdog: Arc::new(SessionWatchdog::new("market")),
            user_watchdog: Arc::new(SessionWatchdog::new("user")),
            self_ref: weak.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.events_tx.subscribe()
    }

    fn combined_stream_url(&self, symbols: &HashSet<Symbol>) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                vec![format!("{lower}@markPrice@1s"), format!("{lower}@bookTicker")]
            })
            .collect();
        format!("{}/stream?streams={}", self.base_ws_url, streams.join("/"))
    }

    /// Tears down and reconnects the combined market websocket for the
    /// current symbol set. Spawns a background task that owns the socket
    /// for the lifetime of its reconnect generation.
    async fn reconnect_market_stream(self: &Arc<Self>) {
        let token = self.market_watchdog.begin_reconnect();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            if !this.market_watchdog.is_current_generation(token) {
                return; // superseded by a newer reconnect attempt
            }
            this.run_market_stream(token).await;
        });
    }

    async fn run_market_stream(self: Arc<Self>, token: u64) {
        let symbols = self.symbols.read().clone();
        if symbols.is_empty() {
            self.market_watchdog
                .transition(SessionState::Shutdown, TransitionReason::ShutdownRequested);
            return;
        }

        let url = self.combined_stream_url(&symbols);
        self.market_watchdog
            .transition(SessionState::Connecting, TransitionReason::Started);

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "market stream connect failed");
                self.spawn_reconnect_after_failure(token).await;
                return;
            }
        };
        self.market_watchdog
            .transition(SessionState::Streaming, TransitionReason::ConnectSuccess);

        let (mut write, mut read) = ws_stream.split();
        let mut watchdog_ticker = interval(WATCHDOG_INTERVAL);

        loop {
            if !self.market_watchdog.is_current_generation(token) {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.market_watchdog.record_message();
                            self.handle_combined_stream_message(&text);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            self.market_watchdog.record_message();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            self.spawn_reconnect_after_failure(token).await;
                            return;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "market stream error");
                            self.spawn_reconnect_after_failure(token).await;
                            return;
                        }
                        _ => {}
                    }
                }
                _ = watchdog_ticker.tick() => {
                    if self.market_watchdog.is_stale() {
                        warn!("market stream stale, forcing reconnect");
                        self.spawn_reconnect_after_failure(token).await;
                        return;
                    }
                }
            }
        }
    }

    async fn spawn_reconnect_after_failure(self: &Arc<Self>, _prior_token: u64) {
        self.reconnect_market_stream().await;
    }

    fn handle_combined_stream_message(&self, text: &str) {
        #[derive(serde::Deserialize)]
        struct Envelope {
            stream: String,
            data: serde_json::Value,
        }
        let Ok(env) = serde_json::from_str::<Envelope>(text) else {
            return;
        };

        if env.stream.ends_with("@markPrice@1s") {
            if let (Some(symbol), Some(price)) = (
                env.data.get("s").and_then(|v| v.as_str()),
                env.data.get("p").and_then(|v| v.as_str()),
            ) {
                if let Ok(price) = price.parse::<Decimal>() {
                    let _ = self.events_tx.send(MarketEvent::MarkPrice {
                        symbol: symbol.to_string(),
                        price,
                    });
                }
            }
        } else if env.stream.ends_with("@bookTicker") {
            if let (Some(symbol), Some(bid), Some(ask)) = (
                env.data.get("s").and_then(|v| v.as_str()),
                env.data.get("b").and_then(|v| v.as_str()),
                env.data.get("a").and_then(|v| v.as_str()),
            ) {
                if let (Ok(bid), Ok(ask)) = (bid.parse::<Decimal>(), ask.parse::<Decimal>()) {
                    let _ = self.events_tx.send(MarketEvent::BookTicker {
                        symbol: symbol.to_string(),
                        bid,
                        ask,
                    });
                }
            }
        }
    }

    /// Normalises a user-data `ORDER_TRADE_UPDATE` payload's id per spec
    /// §4.1/§9: a `BOT-`-prefixed client id wins, then the mapped client id
    /// for an algo id, else the raw numeric order id.
    fn normalize_order_id(&self, numeric_order_id: i64, client_order_id: &str, algo_id: Option<i64>) -> String {
        if client_order_id.starts_with("BOT-") {
            return client_order_id.to_string();
        }
        if let Some(algo_id) = algo_id {
            if let Some(mapped) = self.algo_id_map.read().get(&algo_id.to_string()) {
                return mapped.clone();
            }
        }
        numeric_order_id.to_string()
    }

    /// Spawns the user-data websocket: a 3s-fixed-delay reconnect loop plus
    /// a 25-minute listen-key keepalive, mirroring `run_market_stream`'s
    /// shape but against `ws/<listenKey>`
    /// instead of the combined stream.
    fn spawn_user_data_stream(self: Arc<Self>, listen_key: String) {
        let keepalive_rest = Arc::clone(&self.rest);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(25 * 60));
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if let Err(e) = keepalive_rest.keepalive_user_data_stream().await {
                    warn!(error = %e, "listen key keepalive failed");
                }
            }
        });

        let token = self.user_watchdog.begin_reconnect();
        tokio::spawn(async move {
            self.run_user_data_stream(listen_key, token).await;
        });
    }

    async fn run_user_data_stream(self: Arc<Self>, listen_key: String, token: u64) {
        if !self.user_watchdog.is_current_generation(token) {
            return;
        }
        let url = format!("{}/ws/{}", self.base_ws_url, listen_key);
        self.user_watchdog
            .transition(SessionState::Connecting, TransitionReason::Started);

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "user data stream connect failed");
                self.spawn_user_reconnect();
                return;
            }
        };
        self.user_watchdog
            .transition(SessionState::Streaming, TransitionReason::ConnectSuccess);

        let (mut write, mut read) = ws_stream.split();
        let mut watchdog_ticker = interval(WATCHDOG_INTERVAL);

        loop {
            if !self.user_watchdog.is_current_generation(token) {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.user_watchdog.record_message();
                            self.handle_user_data_message(&text);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            self.user_watchdog.record_message();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            self.spawn_user_reconnect();
                            return;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "user data stream error");
                            self.spawn_user_reconnect();
                            return;
                        }
                        _ => {}
                    }
                }
                _ = watchdog_ticker.tick() => {
                    if self.user_watchdog.is_stale() {
                        warn!("user data stream stale, forcing reconnect");
                        self.spawn_user_reconnect();
                        return;
                    }
                }
            }
        }
    }

    /// `listenKeyExpired` (or any drop) forces re-issue of a fresh listen
    /// key, then reconnects — a distinct path from the market stream's
    /// reconnect because the url itself changes.
    fn spawn_user_reconnect(self: &Arc<Self>) {
        let token = self.user_watchdog.begin_reconnect();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            if !this.user_watchdog.is_current_generation(token) {
                return;
            }
            let listen_key = match this.rest.start_user_data_stream().await {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "failed to re-issue listen key, retrying later");
                    this.spawn_user_reconnect();
                    return;
                }
            };
            this.run_user_data_stream(listen_key, token).await;
        });
    }

    /// Parses an `ORDER_TRADE_UPDATE` user-data event and fans out
    /// `OrderFilled`/`OrderCancelled` with the normalised id.
    fn handle_user_data_message(&self, text: &str) {
        #[derive(serde::Deserialize)]
        struct OrderUpdateEnvelope {
            e: String,
            o: Option<OrderUpdatePayload>,
        }
        #[derive(serde::Deserialize)]
        struct OrderUpdatePayload {
            s: String,
            #[serde(rename = "i")]
            order_id: i64,
            #[serde(rename = "c")]
            client_order_id: String,
            #[serde(rename = "algoId")]
            algo_id: Option<i64>,
            #[serde(rename = "S")]
            side: String,
            #[serde(rename = "o")]
            order_type: String,
            #[serde(rename = "X")]
            status: String,
            #[serde(rename = "L")]
            last_fill_price: String,
            #[serde(rename = "l")]
            last_fill_qty: String,
        }

        let Ok(env) = serde_json::from_str::<OrderUpdateEnvelope>(text) else {
            return;
        };
        if env.e == "listenKeyExpired" {
            warn!("listen key expired, forcing user stream reconnect");
            self.user_watchdog
                .transition(SessionState::Reconnecting, TransitionReason::ListenKeyExpired);
            if let Some(this) = self.self_ref.upgrade() {
                this.spawn_user_reconnect();
            }
            return;
        }
        let Some(o) = env.o else { return };
        let order_id = self.normalize_order_id(o.order_id, &o.client_order_id, o.algo_id);
        let side = if o.side == "BUY" { Side::Buy } else { Side::Sell };

        match o.status.as_str() {
            "FILLED" | "PARTIALLY_FILLED" => {
                let (Ok(price), Ok(qty)) = (
                    o.last_fill_price.parse::<Decimal>(),
                    o.last_fill_qty.parse::<Decimal>(),
                ) else {
                    return;
                };
                let _ = self.events_tx.send(MarketEvent::OrderFilled {
                    symbol: o.s,
                    order_id,
                    price,
                    quantity: qty,
                    side,
                });
            }
            "CANCELED" | "EXPIRED" | "REJECTED" => {
                let order_type = match o.order_type.as_str() {
                    "STOP" | "STOP_LIMIT" => crate::models::OrderType::StopLimit,
                    "STOP_MARKET" => crate::models::OrderType::StopMarket,
                    "MARKET" => crate::models::OrderType::Market,
                    _ => crate::models::OrderType::Limit,
                };
                let _ = self.events_tx.send(MarketEvent::OrderCancelled {
                    symbol: o.s,
                    order_id,
                    status: CancelStatus::Cancelled,
                    side,
                    order_type,
                });
            }
            _ => {}
        }
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for LiveExchangeAdapter {
    async fn start_market_streams(&self, symbols: &[Symbol]) -> ExchangeResult<()> {
        self.update_symbols(symbols).await
    }

    async fn update_symbols(&self, symbols: &[Symbol]) -> ExchangeResult<()> {
        let new_set: HashSet<Symbol> = symbols.iter().cloned().collect();
        let changed = {
            let current = self.symbols.read();
            *current != new_set
        };
        if !changed {
            return Ok(());
        }
        *self.symbols.write() = new_set;
        info!(count = symbols.len(), "market stream membership changed, reconnecting");
        if let Some(this) = self.self_ref.upgrade() {
            this.reconnect_market_stream().await;
        }
        Ok(())
    }

    async fn start_user_data_stream(&self) -> ExchangeResult<()> {
        let listen_key = self.rest.start_user_data_stream().await?;
        info!(listen_key_len = listen_key.len(), "user data stream started");
        if let Some(this) = self.self_ref.upgrade() {
            this.spawn_user_data_stream(listen_key);
        }
        Ok(())
    }

    async fn get_mark_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.market_data.get_mark_price(symbol).await
    }

    async fn get_ticker_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.market_data.get_ticker_price(symbol).await
    }

    async fn get_24h_tickers(&self) -> ExchangeResult<Vec<Ticker24h>> {
        self.market_data.get_24h_tickers().await
    }

    async fn get_lot_filters(&self, symbol: &str) -> ExchangeResult<LotFilters> {
        self.market_data.get_lot_filters(symbol).await
    }

    async fn get_klines(&self, symbol: &str, limit: u32) -> ExchangeResult<Vec<Kline>> {
        self.market_data.get_klines(symbol, limit).await
    }

    async fn get_depth(&self, symbol: &str, limit: u32) -> ExchangeResult<Depth> {
        self.market_data.get_depth(symbol, limit).await
    }

    async fn get_balance(&self) -> ExchangeResult<Decimal> {
        self.rest.get_balance().await
    }

    async fn get_position(&self, symbol: &str, side: PositionSide) -> ExchangeResult<Option<PositionSnapshot>> {
        self.rest.get_position(symbol, side).await
    }

    async fn get_order_trades(&self, symbol: &str, order_id: &str) -> ExchangeResult<Vec<OrderTrade>> {
        self.rest.get_order_trades(symbol, order_id).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.rest.set_leverage(symbol, leverage).await
    }

    async fn place_order(&self, request: NewOrderRequest) -> ExchangeResult<Order> {
        let lot = self.market_data.get_lot_filters(&request.symbol).await?;
        let quantity = floor_to_step(request.quantity, lot.step_size);
        let price = request.price.map(|p| floor_to_step(p, lot.tick_size));
        let stop_price = request.stop_price.map(|p| floor_to_step(p, lot.tick_size));

        let client_order_id = if request.order_type.is_algo() {
            new_client_algo_id()
        } else {
            format!("bot-{}", uuid::Uuid::new_v4())
        };

        let order_id = self
            .rest
            .place_order(
                &request.symbol,
                request.side,
                request.order_type,
                request.position_side,
                quantity,
                price,
                stop_price,
                request.reduce_only,
                &client_order_id,
            )
            .await?;

        if request.order_type.is_algo() {
            self.algo_id_map.write().insert(order_id.clone(), client_order_id.clone());
        }

        Ok(Order {
            order_id: if request.order_type.is_algo() { client_order_id } else { order_id },
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            quantity,
            price,
            stop_price,
            reduce_only: request.reduce_only,
            position_side: request.position_side,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<CancelOutcome> {
        match self.rest.cancel_order(symbol, order_id).await {
            Ok(_) => Ok(CancelOutcome {
                order_id: order_id.to_string(),
                status: CancelStatus::Cancelled,
            }),
            Err(e) if e.is_unknown_order() => Ok(CancelOutcome {
                order_id: order_id.to_string(),
                status: CancelStatus::Unknown,
            }),
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> ExchangeResult<()> {
        self.rest.cancel_all_open_orders(symbol).await
    }

    async fn close_position_market(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: Decimal,
    ) -> ExchangeResult<Order> {
        let exit_side = position_side.exit_side();
        self.place_order(NewOrderRequest::market(symbol, exit_side, position_side, quantity, true))
            .await
    }

    fn is_connected(&self) -> bool {
        self.market_watchdog.state() == SessionState::Streaming
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MarketEvent> {
        self.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_algo_ids_are_always_bot_prefixed() {
        let id = new_client_algo_id();
        assert!(id.starts_with("BOT-"));
    }

    #[test]
    fn normalize_order_id_prefers_bot_prefixed_client_id() {
        let adapter = LiveExchangeAdapter::new(
            "https://fapi.binance.com",
            "wss://fstream.binance.com",
            "key",
            "secret",
            5000,
        );
        let id = adapter.normalize_order_id(123, "BOT-999-1", Some(456));
        assert_eq!(id, "BOT-999-1");
    }

    #[test]
    fn normalize_order_id_falls_back_to_mapped_algo_id() {
        let adapter = LiveExchangeAdapter::new(
            "https://fapi.binance.com",
            "wss://fstream.binance.com",
            "key",
            "secret",
            5000,
        );
        adapter
            .algo_id_map
            .write()
            .insert("456".to_string(), "BOT-1-1".to_string());
        let id = adapter.normalize_order_id(123, "exchange-generated", Some(456));
        assert_eq!(id, "BOT-1-1");
    }

    #[test]
    fn normalize_order_id_falls_back_to_numeric_id() {
        let adapter = LiveExchangeAdapter::new(
            "https://fapi.binance.com",
            "wss://fstream.binance.com",
            "key",
            "secret",
            5000,
        );
        let id = adapter.normalize_order_id(123, "exchange-generated", None);
        assert_eq!(id, "123");
    }
}
