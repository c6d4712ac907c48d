//! Integration tests for the Trader lifecycle.
//!
//! Drives `TraderHandle` end to end against a hand-written fake
//! `ExchangeAdapter` — no real network, no simulator order-matching — to
//! exercise the full init → fill → attach-exits → finalize path for both
//! strategies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use tradehand_backend::config::{EngineConfig, RunMode};
use tradehand_backend::error::ExchangeError;
use tradehand_backend::exchange::{CancelOutcome, ExchangeAdapter, ExchangeResult, MarketEvent, NewOrderRequest};
use tradehand_backend::ledger::Ledger;
use tradehand_backend::models::{
    CancelStatus, Depth, Kline, LotFilters, Order, OrderTrade, OrderType, PositionSide,
    PositionSnapshot, Side, StrategyKind, Ticker24h,
};
use tradehand_backend::strategy::grid::GridStrategy;
use tradehand_backend::strategy::volatility::VolatilityStrategy;
use tradehand_backend::strategy::{Trader, TraderHandle};

/// A minimal `ExchangeAdapter` that fills every order it's asked to place,
/// optionally rejecting the next stop-limit placement with a given exchange
/// error code (used to exercise the `-2021` SL pre-check path).
struct FakeAdapter {
    mark_price: Decimal,
    next_id: AtomicU64,
    reject_next_stop_limit: std::sync::Mutex<Option<i32>>,
}

impl FakeAdapter {
    fn new(mark_price: Decimal) -> Self {
        Self {
            mark_price,
            next_id: AtomicU64::new(1),
            reject_next_stop_limit: std::sync::Mutex::new(None),
        }
    }

    fn reject_next_stop_limit_with(&self, code: i32) {
        *self.reject_next_stop_limit.lock().unwrap() = Some(code);
    }
}

#[async_trait]
impl ExchangeAdapter for FakeAdapter {
    async fn start_market_streams(&self, _symbols: &[String]) -> ExchangeResult<()> {
        Ok(())
    }
    async fn update_symbols(&self, _symbols: &[String]) -> ExchangeResult<()> {
        Ok(())
    }
    async fn start_user_data_stream(&self) -> ExchangeResult<()> {
        Ok(())
    }
    async fn get_mark_price(&self, _symbol: &str) -> ExchangeResult<Decimal> {
        Ok(self.mark_price)
    }
    async fn get_ticker_price(&self, _symbol: &str) -> ExchangeResult<Decimal> {
        Ok(self.mark_price)
    }
    async fn get_24h_tickers(&self) -> ExchangeResult<Vec<Ticker24h>> {
        Ok(Vec::new())
    }
    async fn get_lot_filters(&self, _symbol: &str) -> ExchangeResult<LotFilters> {
        Ok(LotFilters::default())
    }
    async fn get_klines(&self, _symbol: &str, _limit: u32) -> ExchangeResult<Vec<Kline>> {
        Ok(Vec::new())
    }
    async fn get_depth(&self, _symbol: &str, _limit: u32) -> ExchangeResult<Depth> {
        Ok(Depth { bids: vec![], asks: vec![] })
    }
    async fn get_balance(&self) -> ExchangeResult<Decimal> {
        Ok(Decimal::from(1000))
    }
    async fn get_position(&self, _symbol: &str, _side: PositionSide) -> ExchangeResult<Option<PositionSnapshot>> {
        Ok(None)
    }
    async fn get_order_trades(&self, _symbol: &str, _order_id: &str) -> ExchangeResult<Vec<OrderTrade>> {
        Ok(Vec::new())
    }
    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> ExchangeResult<()> {
        Ok(())
    }
    async fn place_order(&self, request: NewOrderRequest) -> ExchangeResult<Order> {
        if request.order_type == OrderType::StopLimit {
            if let Some(code) = self.reject_next_stop_limit.lock().unwrap().take() {
                return Err(ExchangeError::Rejected { code, message: "would immediately trigger".into() });
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Order {
            order_id: format!("o{id}"),
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            stop_price: request.stop_price,
            reduce_only: request.reduce_only,
            position_side: request.position_side,
        })
    }
    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> ExchangeResult<CancelOutcome> {
        Ok(CancelOutcome { order_id: order_id.to_string(), status: CancelStatus::Cancelled })
    }
    async fn cancel_all_open_orders(&self, _symbol: &str) -> ExchangeResult<()> {
        Ok(())
    }
    async fn close_position_market(&self, symbol: &str, position_side: PositionSide, quantity: Decimal) -> ExchangeResult<Order> {
        Ok(Order {
            order_id: "close".into(),
            symbol: symbol.to_string(),
            side: position_side.exit_side(),
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            reduce_only: true,
            position_side,
        })
    }
    fn is_connected(&self) -> bool {
        true
    }
    fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<MarketEvent> {
        tokio::sync::broadcast::channel(1).1
    }
}

/// `max_traders=1, leverage=1, equity_fraction=1.0` makes
/// `entry_quantity = equity / (2 * price)`, with `equity = 200` giving a
/// notional of 100 per leg — easy to check by hand.
fn test_config() -> EngineConfig {
    let mut config = EngineConfig::from_env();
    config.mode = RunMode::Test;
    config.max_traders = 1;
    config.leverage = 1;
    config.equity_fraction = 1.0;
    config.level_spacing_percent = 1.0;
    config.take_profit_percent = 1.0;
    config.stop_loss_percent = 1.0;
    config.volatility_take_profit_percent = 3.0;
    config.volatility_stop_loss_percent = 6.0;
    config.volatility_position_notional_usdt = 300.0;
    config.fee_rate = 0.0;
    config
}

#[tokio::test]
async fn grid_trader_enters_attaches_exits_and_closes_on_take_profit() {
    let config = test_config();
    let ledger = Ledger::new(Decimal::from(200));
    let adapter = FakeAdapter::new(Decimal::from(100));

    let trader = Trader::new("t-grid".into(), "BTCUSDT".into(), StrategyKind::Grid);
    let handle = TraderHandle::new(trader, Arc::new(GridStrategy));

    handle.init(&adapter, &config, &ledger).await.expect("grid init");

    let (long_order_id, long_qty) = {
        let trader = handle.trader.lock().await;
        assert_eq!(trader.pending_entries.len(), 2, "grid places both LONG and SHORT entries on init");
        let long = trader
            .pending_entries
            .iter()
            .find(|e| e.direction == PositionSide::Long)
            .expect("long entry present");
        let short = trader
            .pending_entries
            .iter()
            .find(|e| e.direction == PositionSide::Short)
            .expect("short entry present");
        assert_eq!(long.price, Decimal::new(99, 0), "LONG enters 1% below base");
        assert_eq!(short.price, Decimal::new(101, 0), "SHORT enters 1% above base");
        (long.order_id.clone(), long.quantity)
    };

    // Fill the LONG entry: this should open a position and immediately
    // attach a paired reduce-only TP + SL.
    handle
        .handle_event(
            &MarketEvent::OrderFilled {
                symbol: "BTCUSDT".into(),
                order_id: long_order_id,
                price: Decimal::new(99, 0),
                quantity: long_qty,
                side: Side::Buy,
            },
            &adapter,
            &config,
            &ledger,
        )
        .await;

    let tp_order_id = {
        let trader = handle.trader.lock().await;
        assert_eq!(trader.positions.len(), 1);
        let pos = &trader.positions[0];
        assert_eq!(pos.take_profit_price, Decimal::new(9999, 2), "LONG TP = entry * 1.01");
        assert_eq!(pos.stop_loss_price, Decimal::new(9801, 2), "LONG SL = entry * 0.99");
        assert!(pos.has_both_exits(), "a non-closing position carries exactly one live TP and SL");
        pos.tp_order_id.clone().expect("tp order recorded")
    };

    // Fill the TP: the position closes, the Trader terminates (its one
    // position is gone), and the Ledger records a winning trade.
    handle
        .handle_event(
            &MarketEvent::OrderFilled {
                symbol: "BTCUSDT".into(),
                order_id: tp_order_id,
                price: Decimal::new(9999, 2),
                quantity: long_qty,
                side: Side::Sell,
            },
            &adapter,
            &config,
            &ledger,
        )
        .await;

    assert!(handle.is_terminal().await, "grid trader is destroyed once its TP/SL fires");
    let perf = ledger.get_performance();
    assert_eq!(perf.total_trades, 1);
    assert_eq!(perf.wins, 1);
    assert!(perf.net_profit > Decimal::ZERO, "TP fill should be profitable");
}

#[tokio::test]
async fn grid_trader_closes_at_market_when_sl_placement_is_rejected() {
    let config = test_config();
    let ledger = Ledger::new(Decimal::from(200));
    let adapter = FakeAdapter::new(Decimal::from(100));
    // The SL leg of the first position opened will hit the exchange's
    // "would immediately trigger" rejection (-2021).
    adapter.reject_next_stop_limit_with(-2021);

    let trader = Trader::new("t-grid-sl".into(), "BTCUSDT".into(), StrategyKind::Grid);
    let handle = TraderHandle::new(trader, Arc::new(GridStrategy));
    handle.init(&adapter, &config, &ledger).await.expect("grid init");

    let (long_order_id, long_qty) = {
        let trader = handle.trader.lock().await;
        let long = trader
            .pending_entries
            .iter()
            .find(|e| e.direction == PositionSide::Long)
            .unwrap();
        (long.order_id.clone(), long.quantity)
    };

    handle
        .handle_event(
            &MarketEvent::OrderFilled {
                symbol: "BTCUSDT".into(),
                order_id: long_order_id,
                price: Decimal::new(99, 0),
                quantity: long_qty,
                side: Side::Buy,
            },
            &adapter,
            &config,
            &ledger,
        )
        .await;

    // The SL placement failed with -2021, so the position must have been
    // closed at market immediately rather than left unprotected.
    assert!(handle.is_terminal().await, "SL rejection closes the trader rather than leaving the position bare");
    let trader = handle.trader.lock().await;
    assert!(trader.positions.is_empty());
    assert_eq!(trader.trade_history.len(), 1);
    assert_eq!(trader.trade_history[0].reason, tradehand_backend::models::ExitReason::StopLoss);
}

#[tokio::test]
async fn volatility_trader_rewrites_survivor_tp_to_base_price_after_first_leg_closes() {
    let config = test_config();
    let ledger = Ledger::new(Decimal::from(1000));
    let adapter = FakeAdapter::new(Decimal::from(100));

    let trader = Trader::new("t-vol".into(), "ETHUSDT".into(), StrategyKind::Volatility);
    let handle = TraderHandle::new(trader, Arc::new(VolatilityStrategy));
    handle.init(&adapter, &config, &ledger).await.expect("volatility init");

    let (long_entry_id, short_entry_id, leg_qty) = {
        let trader = handle.trader.lock().await;
        assert_eq!(trader.pending_entries.len(), 2, "volatility opens both legs simultaneously");
        let long = trader.pending_entries.iter().find(|e| e.direction == PositionSide::Long).unwrap();
        let short = trader.pending_entries.iter().find(|e| e.direction == PositionSide::Short).unwrap();
        assert_eq!(long.price, Decimal::from(100), "both legs enter at basePrice, not an offset level");
        (long.order_id.clone(), short.order_id.clone(), long.quantity)
    };

    // Fill both legs at basePrice.
    for (order_id, side) in [(long_entry_id, Side::Buy), (short_entry_id, Side::Sell)] {
        handle
            .handle_event(
                &MarketEvent::OrderFilled {
                    symbol: "ETHUSDT".into(),
                    order_id,
                    price: Decimal::from(100),
                    quantity: leg_qty,
                    side,
                },
                &adapter,
                &config,
                &ledger,
            )
            .await;
    }

    let long_tp_id = {
        let trader = handle.trader.lock().await;
        assert_eq!(trader.positions.len(), 2);
        let long_pos = trader.positions.iter().find(|p| p.direction == PositionSide::Long).unwrap();
        let short_pos = trader.positions.iter().find(|p| p.direction == PositionSide::Short).unwrap();
        assert_eq!(long_pos.take_profit_price, Decimal::from(103), "TP/SL reference basePrice, not entry");
        assert_eq!(short_pos.take_profit_price, Decimal::from(97));
        long_pos.tp_order_id.clone().unwrap()
    };

    // LONG's TP fills at 103 first. last_price (set by this same fill's
    // price) has not yet reached base (100) against the SHORT survivor, so
    // its TP must be rewritten to basePrice rather than closed immediately.
    handle
        .trader
        .lock()
        .await
        .last_price = Decimal::from(103);
    handle
        .handle_event(
            &MarketEvent::OrderFilled {
                symbol: "ETHUSDT".into(),
                order_id: long_tp_id,
                price: Decimal::from(103),
                quantity: leg_qty,
                side: Side::Sell,
            },
            &adapter,
            &config,
            &ledger,
        )
        .await;

    let short_new_tp_id = {
        let trader = handle.trader.lock().await;
        assert_eq!(trader.positions.len(), 1, "the LONG leg closed, the SHORT leg survives");
        let survivor = &trader.positions[0];
        assert_eq!(survivor.direction, PositionSide::Short);
        assert_eq!(survivor.take_profit_price, Decimal::from(100), "survivor's TP rewritten to basePrice");
        assert_eq!(survivor.stop_loss_price, Decimal::from(106), "survivor's SL is untouched by the rewrite");
        assert!(!survivor.is_closing);
        survivor.tp_order_id.clone().expect("rewritten TP order recorded")
    };
    assert!(!handle.is_terminal().await, "trader stays active while the survivor is still open");

    // Price returns to basePrice: the survivor's rewritten TP fills and the
    // trader terminates for a net-zero (break-even, pre-fee) base-close.
    handle
        .handle_event(
            &MarketEvent::OrderFilled {
                symbol: "ETHUSDT".into(),
                order_id: short_new_tp_id,
                price: Decimal::from(100),
                quantity: leg_qty,
                side: Side::Buy,
            },
            &adapter,
            &config,
            &ledger,
        )
        .await;

    assert!(handle.is_terminal().await);
    let trader = handle.trader.lock().await;
    assert_eq!(trader.trade_history.len(), 2);
    assert_eq!(trader.trade_history[1].reason, tradehand_backend::models::ExitReason::BaseClose);
}
