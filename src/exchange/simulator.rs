//! Deterministic order/position simulator substituted when `mode = TEST`:
//! fee/slippage-adjusted fills matched against locally tracked orders and
//! positions, with no network round-trip.
//!
//! Shares a [`MarketDataClient`] with [`super::live::LiveExchangeAdapter`]
//! for price/kline/depth/ticker reads (`mode = TEST` still trades against
//! real market data; only order routing is simulated).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::exchange::market_data::MarketDataClient;
use crate::exchange::rounding::floor_to_step;
use crate::exchange::{CancelOutcome, ExchangeAdapter, ExchangeResult, MarketEvent, NewOrderRequest};
use crate::models::{
    CancelStatus, Depth, Kline, LotFilters, Order, OrderTrade, OrderType, PositionSide,
    PositionSnapshot, Side, Symbol, Ticker24h,
};

#[derive(Debug, Clone)]
struct SimOrder {
    order: Order,
}

#[derive(Debug, Clone, Copy)]
struct SimPosition {
    quantity: Decimal,
    entry_price: Decimal,
}

pub struct SimulatorExchangeAdapter {
    market_data: Arc<MarketDataClient>,
    fee_rate: Decimal,
    slippage_rate: Decimal,

    test_orders: RwLock<HashMap<String, SimOrder>>,
    test_positions: RwLock<HashMap<(Symbol, PositionSide), SimPosition>>,
    test_balance: RwLock<Decimal>,
    last_sim_price: RwLock<HashMap<Symbol, Decimal>>,
    subscribed: RwLock<Vec<Symbol>>,

    events_tx: broadcast::Sender<MarketEvent>,
}

impl SimulatorExchangeAdapter {
    pub fn new(market_data: Arc<MarketDataClient>, starting_balance: Decimal, fee_rate: f64, slippage_rate: f64) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(4096);
        Arc::new(Self {
            market_data,
            fee_rate: Decimal::try_from(fee_rate).unwrap_or_default(),
            slippage_rate: Decimal::try_from(slippage_rate).unwrap_or_default(),
            test_orders: RwLock::new(HashMap::new()),
            test_positions: RwLock::new(HashMap::new()),
            test_balance: RwLock::new(starting_balance),
            last_sim_price: RwLock::new(HashMap::new()),
            subscribed: RwLock::new(Vec::new()),
            events_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.events_tx.subscribe()
    }

    pub fn balance(&self) -> Decimal {
        *self.test_balance.read()
    }

    /// Feeds a mark-price tick: broadcasts it as a `MarkPrice` event and
    /// replays every NEW order for `symbol` against it.
    pub fn feed_mark_price(&self, symbol: &str, price: Decimal) {
        let _ = self.events_tx.send(MarketEvent::MarkPrice {
            symbol: symbol.to_string(),
            price,
        });
        self.replay_orders(symbol, price);
        self.last_sim_price.write().insert(symbol.to_string(), price);
    }

    pub fn feed_book_ticker(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let _ = self.events_tx.send(MarketEvent::BookTicker {
            symbol: symbol.to_string(),
            bid,
            ask,
        });
        let mid = (bid + ask) / Decimal::TWO;
        self.replay_orders(symbol, mid);
        self.last_sim_price.write().insert(symbol.to_string(), mid);
    }

    fn triggers(order: &Order, price: Decimal) -> bool {
        match order.order_type {
            OrderType::Limit => match order.side {
                Side::Buy => price <= order.price.unwrap_or(Decimal::MAX),
                Side::Sell => price >= order.price.unwrap_or(Decimal::ZERO),
            },
            OrderType::StopLimit | OrderType::StopMarket => {
                let stop = order.stop_price.unwrap_or(Decimal::ZERO);
                match order.side {
                    Side::Buy => price >= stop,
                    Side::Sell => price <= stop,
                }
            }
            OrderType::Market => true,
        }
    }

    fn fill_price(order: &Order) -> Decimal {
        order.price.or(order.stop_price).unwrap_or_default()
    }

    fn replay_orders(&self, symbol: &str, price: Decimal) {
        let last = self.last_sim_price.read().get(symbol).copied();
        let candidates: Vec<Order> = {
            let orders = self.test_orders.read();
            orders
                .values()
                .filter(|o| o.order.symbol == symbol)
                .map(|o| o.order.clone())
                .collect()
        };

        for order in candidates {
            if !Self::triggers(&order, price) {
                continue;
            }
            let fill_price = Self::fill_price(&order);
            if let Some(last) = last {
                if last != price && fill_price != price {
                    debug!(order_id = %order.order_id, symbol, "order already passed, filling at trigger price");
                }
            }
            self.fill_order(&order, fill_price);
        }
    }

    fn fill_order(&self, order: &Order, fill_price: Decimal) {
        self.test_orders.write().remove(&order.order_id);

        let fees = self.fee_rate * (order.quantity * fill_price).abs();
        *self.test_balance.write() -= fees;

        let key = (order.symbol.clone(), order.position_side);
        let signed_qty = match order.side {
            Side::Buy => order.quantity,
            Side::Sell => -order.quantity,
        };

        let mut positions = self.test_positions.write();
        match positions.get_mut(&key) {
            Some(pos) if order.reduce_only => {
                let closing_qty = order.quantity.min(pos.quantity);
                let pnl = (fill_price - pos.entry_price) * closing_qty * order.position_side.sign_decimal();
                *self.test_balance.write() += pnl;
                pos.quantity -= closing_qty;
                if pos.quantity.is_zero() {
                    positions.remove(&key);
                }
            }
            Some(pos) => {
                let new_qty = pos.quantity + signed_qty.abs();
                pos.entry_price =
                    (pos.entry_price * pos.quantity + fill_price * signed_qty.abs()) / new_qty;
                pos.quantity = new_qty;
            }
            None => {
                positions.insert(
                    key,
                    SimPosition {
                        quantity: signed_qty.abs(),
                        entry_price: fill_price,
                    },
                );
            }
        }
        drop(positions);

        let _ = self.events_tx.send(MarketEvent::OrderFilled {
            symbol: order.symbol.clone(),
            order_id: order.order_id.clone(),
            price: fill_price,
            quantity: order.quantity,
            side: order.side,
        });
    }
}

impl PositionSide {
    fn sign_decimal(self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => -Decimal::ONE,
        }
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for SimulatorExchangeAdapter {
    async fn start_market_streams(&self, symbols: &[Symbol]) -> ExchangeResult<()> {
        *self.subscribed.write() = symbols.to_vec();
        Ok(())
    }

    async fn update_symbols(&self, symbols: &[Symbol]) -> ExchangeResult<()> {
        *self.subscribed.write() = symbols.to_vec();
        Ok(())
    }

    async fn start_user_data_stream(&self) -> ExchangeResult<()> {
        Ok(())
    }

    async fn get_mark_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        if let Some(p) = self.last_sim_price.read().get(symbol) {
            return Ok(*p);
        }
        self.market_data.get_mark_price(symbol).await
    }

    async fn get_ticker_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.get_mark_price(symbol).await
    }

    async fn get_24h_tickers(&self) -> ExchangeResult<Vec<Ticker24h>> {
        self.market_data.get_24h_tickers().await
    }

    async fn get_lot_filters(&self, symbol: &str) -> ExchangeResult<LotFilters> {
        self.market_data
            .get_lot_filters(symbol)
            .await
            .or_else(|_| Ok(LotFilters::default()))
    }

    async fn get_klines(&self, symbol: &str, limit: u32) -> ExchangeResult<Vec<Kline>> {
        self.market_data.get_klines(symbol, limit).await
    }

    async fn get_depth(&self, symbol: &str, limit: u32) -> ExchangeResult<Depth> {
        self.market_data.get_depth(symbol, limit).await
    }

    async fn get_balance(&self) -> ExchangeResult<Decimal> {
        Ok(self.balance())
    }

    async fn get_position(&self, symbol: &str, side: PositionSide) -> ExchangeResult<Option<PositionSnapshot>> {
        Ok(self
            .test_positions
            .read()
            .get(&(symbol.to_string(), side))
            .map(|p| PositionSnapshot {
                direction: side,
                quantity: p.quantity,
                entry_price: p.entry_price,
            }))
    }

    async fn get_order_trades(&self, _symbol: &str, _order_id: &str) -> ExchangeResult<Vec<OrderTrade>> {
        // The simulator has no separate trade-report reconciliation path;
        // finalizeClose always falls back to its own P&L estimate in TEST mode.
        Ok(Vec::new())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> ExchangeResult<()> {
        Ok(())
    }

    async fn place_order(&self, request: NewOrderRequest) -> ExchangeResult<Order> {
        let lot = self.get_lot_filters(&request.symbol).await?;
        let quantity = floor_to_step(request.quantity, lot.step_size);
        let price = request.price.map(|p| floor_to_step(p, lot.tick_size));
        let stop_price = request.stop_price.map(|p| floor_to_step(p, lot.tick_size));

        let order = Order {
            order_id: format!("sim-{}", Uuid::new_v4()),
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            quantity,
            price,
            stop_price,
            reduce_only: request.reduce_only,
            position_side: request.position_side,
        };

        if order.order_type == OrderType::Market {
            let fill_price = match self.last_sim_price.read().get(&order.symbol).copied() {
                Some(p) => p,
                None => self.market_data.get_mark_price(&order.symbol).await?,
            };
            let slip = fill_price * self.slippage_rate;
            let adjusted = match order.side {
                Side::Buy => fill_price + slip,
                Side::Sell => fill_price - slip,
            };
            self.fill_order(&order, adjusted);
            return Ok(order);
        }

        self.test_orders
            .write()
            .insert(order.order_id.clone(), SimOrder { order: order.clone() });

        if let Some(last) = self.last_sim_price.read().get(&order.symbol).copied() {
            if Self::triggers(&order, last) {
                let fill_price = Self::fill_price(&order);
                self.fill_order(&order, fill_price);
            }
        }

        Ok(order)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> ExchangeResult<CancelOutcome> {
        let existed = self.test_orders.write().remove(order_id).is_some();
        Ok(CancelOutcome {
            order_id: order_id.to_string(),
            status: if existed { CancelStatus::Cancelled } else { CancelStatus::Unknown },
        })
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> ExchangeResult<()> {
        self.test_orders.write().retain(|_, o| o.order.symbol != symbol);
        Ok(())
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
        true
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MarketEvent> {
        self.subscribe()
    }
}

#[allow(dead_code)]
fn unknown_order_error(order_id: &str) -> ExchangeError {
    ExchangeError::Rejected {
        code: -2011,
        message: format!("unknown order {order_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn adapter() -> Arc<SimulatorExchangeAdapter> {
        let market_data = Arc::new(MarketDataClient::new("https://fapi.binance.com"));
        SimulatorExchangeAdapter::new(market_data, dec("1000"), 0.0, 0.0)
    }

    #[tokio::test]
    async fn limit_buy_fills_when_price_at_or_below_limit() {
        let sim = adapter();
        sim.place_order(NewOrderRequest::limit(
            "BTCUSDT",
            Side::Buy,
            PositionSide::Long,
            dec("1"),
            dec("99"),
            false,
        ))
        .await
        .unwrap();

        let mut rx = sim.subscribe();
        sim.feed_mark_price("BTCUSDT", dec("99"));

        let evt = rx.try_recv().unwrap();
        assert!(matches!(evt, MarketEvent::MarkPrice { .. }));
        let evt = rx.try_recv().unwrap();
        match evt {
            MarketEvent::OrderFilled { price, .. } => assert_eq!(price, dec("99")),
            other => panic!("expected OrderFilled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_buy_already_passed_fills_at_stop_price() {
        let sim = adapter();
        sim.place_order(NewOrderRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::StopMarket,
            position_side: PositionSide::Long,
            quantity: dec("1"),
            price: None,
            stop_price: Some(dec("99")),
            reduce_only: false,
        })
        .await
        .unwrap();

        sim.feed_mark_price("BTCUSDT", dec("98"));
        let mut rx = sim.subscribe();
        sim.feed_mark_price("BTCUSDT", dec("100"));

        let evt = rx.try_recv().unwrap();
        assert!(matches!(evt, MarketEvent::MarkPrice { .. }));
        let evt = rx.try_recv().unwrap();
        match evt {
            MarketEvent::OrderFilled { price, .. } => assert_eq!(price, dec("99")),
            other => panic!("expected OrderFilled at stop price, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reduce_only_fill_realizes_pnl_and_closes_position() {
        let sim = adapter();
        sim.place_order(NewOrderRequest::market(
            "BTCUSDT",
            Side::Buy,
            PositionSide::Long,
            dec("1"),
            false,
        ))
        .await
        .unwrap();
        sim.feed_mark_price("BTCUSDT", dec("100"));

        let balance_before = sim.balance();
        sim.place_order(NewOrderRequest::market(
            "BTCUSDT",
            Side::Sell,
            PositionSide::Long,
            dec("1"),
            true,
        ))
        .await
        .unwrap();

        assert!(sim.balance() >= balance_before);
        assert!(sim
            .get_position("BTCUSDT", PositionSide::Long)
            .await
            .unwrap()
            .is_none());
    }
}
