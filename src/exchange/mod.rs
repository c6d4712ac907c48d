//! Exchange Adapter abstraction: market-data subscription, signed REST order
//! operations, and an order-event stream, with a deterministic simulator
//! transparently substituted in `TEST` mode.
//!
//! Concrete wire types follow Binance USDM futures request/response shapes.

pub mod live;
pub mod market_data;
pub mod rest;
pub mod rounding;
pub mod session;
pub mod simulator;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ExchangeError;
use crate::models::{
    CancelStatus, Depth, Kline, LotFilters, Order, OrderTrade, OrderType, PositionSide,
    PositionSnapshot, Side, Symbol, Ticker24h,
};

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// An event fanned out to every subscribed Trader, modelled as a typed enum
/// rather than a loosely-typed emitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    MarkPrice {
        symbol: Symbol,
        price: Decimal,
    },
    BookTicker {
        symbol: Symbol,
        bid: Decimal,
        ask: Decimal,
    },
    OrderFilled {
        symbol: Symbol,
        order_id: String,
        price: Decimal,
        quantity: Decimal,
        side: Side,
    },
    OrderCancelled {
        symbol: Symbol,
        order_id: String,
        status: CancelStatus,
        side: Side,
        order_type: OrderType,
    },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::MarkPrice { symbol, .. }
            | MarketEvent::BookTicker { symbol, .. }
            | MarketEvent::OrderFilled { symbol, .. }
            | MarketEvent::OrderCancelled { symbol, .. } => symbol,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewOrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub position_side: PositionSide,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
}

impl NewOrderRequest {
    pub fn limit(
        symbol: impl Into<Symbol>,
        side: Side,
        position_side: PositionSide,
        quantity: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            position_side,
            quantity,
            price: Some(price),
            stop_price: None,
            reduce_only,
        }
    }

    pub fn stop_limit(
        symbol: impl Into<Symbol>,
        side: Side,
        position_side: PositionSide,
        quantity: Decimal,
        stop_price: Decimal,
        reduce_only: bool,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::StopLimit,
            position_side,
            quantity,
            price: Some(stop_price),
            stop_price: Some(stop_price),
            reduce_only,
        }
    }

    pub fn market(
        symbol: impl Into<Symbol>,
        side: Side,
        position_side: PositionSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            position_side,
            quantity,
            price: None,
            stop_price: None,
            reduce_only,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub order_id: String,
    pub status: CancelStatus,
}

/// The symbol-agnostic trading interface both strategies drive.
/// `LiveExchangeAdapter` and `SimulatorExchangeAdapter` are the two
/// implementations; the Supervisor wires up whichever `EngineConfig::mode`
/// selects and strategies never see the difference.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn start_market_streams(&self, symbols: &[Symbol]) -> ExchangeResult<()>;
    async fn update_symbols(&self, symbols: &[Symbol]) -> ExchangeResult<()>;
    async fn start_user_data_stream(&self) -> ExchangeResult<()>;

    async fn get_mark_price(&self, symbol: &str) -> ExchangeResult<Decimal>;
    async fn get_ticker_price(&self, symbol: &str) -> ExchangeResult<Decimal>;
    async fn get_24h_tickers(&self) -> ExchangeResult<Vec<Ticker24h>>;
    async fn get_lot_filters(&self, symbol: &str) -> ExchangeResult<LotFilters>;
    async fn get_klines(&self, symbol: &str, limit: u32) -> ExchangeResult<Vec<Kline>>;
    async fn get_depth(&self, symbol: &str, limit: u32) -> ExchangeResult<Depth>;
    async fn get_balance(&self) -> ExchangeResult<Decimal>;
    async fn get_position(&self, symbol: &str, side: PositionSide) -> ExchangeResult<Option<PositionSnapshot>>;
    async fn get_order_trades(&self, symbol: &str, order_id: &str) -> ExchangeResult<Vec<OrderTrade>>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    async fn place_order(&self, request: NewOrderRequest) -> ExchangeResult<Order>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<CancelOutcome>;
    async fn cancel_all_open_orders(&self, symbol: &str) -> ExchangeResult<()>;
    async fn close_position_market(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: Decimal,
    ) -> ExchangeResult<Order>;

    /// `true` once a `markPrice`/`bookTicker` event has been observed for
    /// `symbol` after the most recent `start_market_streams`/`update_symbols`
    /// call — used by `getMarkPrice` on startup.
    fn is_connected(&self) -> bool;

    /// Subscribes to the adapter's fanned-out [`MarketEvent`] stream. Every
    /// Trader and the Supervisor's dispatch loop hold their own receiver;
    /// the Adapter never routes by symbol itself.
    fn subscribe_events(&self) -> broadcast::Receiver<MarketEvent>;
}
