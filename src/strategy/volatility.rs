//! Volatility strategy: dual-leg market entries with a TP-then-rewrite
//! break-even exit protocol.
//!
//! Shares its exit-pricing shape with [`super::grid::GridStrategy`] but opens
//! both legs simultaneously instead of a single directional bet, and rewrites
//! the surviving leg's exit to base price once the first leg's TP fires.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StrategyError;
use crate::exchange::{MarketEvent, NewOrderRequest};
use crate::models::{ExitKind, ExitReason, PendingEntry, PendingExit, Position, PositionSide, StrategyKind, TraderState};
use crate::strategy::{TraderContext, TraderStrategy};

pub struct VolatilityStrategy;

impl VolatilityStrategy {
    fn entry_quantity(ctx: &TraderContext<'_>, base_price: Decimal) -> Decimal {
        if base_price.is_zero() {
            return Decimal::ZERO;
        }
        let notional = Decimal::try_from(ctx.config.volatility_position_notional_usdt).unwrap_or_default();
        let leverage = Decimal::from(ctx.config.leverage);
        notional * leverage / base_price
    }

    /// TP/SL are referenced from `basePrice`, not per-leg entry.
    fn tp_sl_from_base(ctx: &TraderContext<'_>, direction: PositionSide) -> (Decimal, Decimal) {
        let base = ctx.trader.base_price;
        let tp_frac = Decimal::try_from(ctx.config.volatility_take_profit_percent / 100.0).unwrap_or_default();
        let sl_frac = Decimal::try_from(ctx.config.volatility_stop_loss_percent / 100.0).unwrap_or_default();
        let dir = Decimal::from(direction.sign());
        let tp = base * (Decimal::ONE + dir * tp_frac);
        let sl = base * (Decimal::ONE - dir * sl_frac);
        (tp, sl)
    }

    async fn place_entry(
        ctx: &mut TraderContext<'_>,
        direction: PositionSide,
    ) -> Result<(), StrategyError> {
        let quantity = Self::entry_quantity(ctx, ctx.trader.base_price);
        let side = direction.entry_side();
        let order = ctx
            .adapter
            .place_order(NewOrderRequest::market(ctx.trader.symbol.clone(), side, direction, quantity, false))
            .await
            .map_err(StrategyError::Exchange)?;
        ctx.trader.pending_entries.push(PendingEntry {
            order_id: order.order_id,
            direction,
            price: ctx.trader.base_price,
            quantity,
            level_index: 0,
        });
        Ok(())
    }

    async fn attach_exits(
        ctx: &mut TraderContext<'_>,
        pos_id: &str,
        tp_reason: ExitKind,
        tp_price: Decimal,
    ) -> Result<(), StrategyError> {
        let (direction, quantity, sl_price) = {
            let pos = ctx.trader.find_position_mut(pos_id).expect("position just inserted");
            (pos.direction, pos.quantity, pos.stop_loss_price)
        };

        let tp_order = ctx
            .adapter
            .place_order(NewOrderRequest::limit(
                ctx.trader.symbol.clone(),
                direction.exit_side(),
                direction,
                quantity,
                tp_price,
                true,
            ))
            .await
            .map_err(StrategyError::Exchange)?;
        if let Some(pos) = ctx.trader.find_position_mut(pos_id) {
            pos.tp_order_id = Some(tp_order.order_id.clone());
        }
        ctx.trader.pending_exits.push(PendingExit {
            order_id: tp_order.order_id,
            position_id: pos_id.to_string(),
            reason: tp_reason,
            price: tp_price,
        });

        let sl_order = ctx
            .adapter
            .place_order(NewOrderRequest::stop_limit(
                ctx.trader.symbol.clone(),
                direction.exit_side(),
                direction,
                quantity,
                sl_price,
                true,
            ))
            .await
            .map_err(StrategyError::Exchange)?;
        if let Some(pos) = ctx.trader.find_position_mut(pos_id) {
            pos.sl_order_id = Some(sl_order.order_id.clone());
        }
        ctx.trader.pending_exits.push(PendingExit {
            order_id: sl_order.order_id,
            position_id: pos_id.to_string(),
            reason: ExitKind::StopLoss,
            price: sl_price,
        });

        Ok(())
    }

    /// Executes the TP-then-rewrite protocol once `tp_hit_side` has just
    /// been recorded for the first time.
    async fn rewrite_survivor(ctx: &mut TraderContext<'_>, tpd_pos_id: &str) -> Result<(), StrategyError> {
        let base_price = ctx.trader.base_price;
        let last_price = ctx.trader.last_price;

        let Some(survivor_id) = ctx
            .trader
            .positions
            .iter()
            .find(|p| p.pos_id != tpd_pos_id)
            .map(|p| p.pos_id.clone())
        else {
            return Ok(()); // no surviving leg (already closed independently)
        };

        let (direction, original_sl) = {
            let pos = ctx.trader.find_position_mut(&survivor_id).unwrap();
            (pos.direction, pos.stop_loss_price)
        };

        if let Some(tp) = ctx.trader.find_position_mut(&survivor_id).and_then(|p| p.tp_order_id.take()) {
            let _ = ctx.adapter.cancel_order(&ctx.trader.symbol, &tp).await;
        }
        if let Some(sl) = ctx.trader.find_position_mut(&survivor_id).and_then(|p| p.sl_order_id.take()) {
            let _ = ctx.adapter.cancel_order(&ctx.trader.symbol, &sl).await;
        }
        ctx.trader.pending_exits.retain(|e| e.position_id != survivor_id);

        // The rewritten TP is a reduce-only limit at `base_price`; skip placing
        // it only if it would trigger the instant it hits the book, i.e. price
        // has already reached the survivor's exit side of base.
        let already_passed = match direction {
            PositionSide::Long => last_price >= base_price,
            PositionSide::Short => last_price <= base_price,
        };
        if already_passed {
            warn!(pos_id = %survivor_id, "price already past base, closing survivor at market");
            ctx.finalize_close(&survivor_id, last_price, ExitReason::BaseClose).await?;
            return Ok(());
        }

        match Self::attach_exits(ctx, &survivor_id, ExitKind::BaseClose, base_price).await {
            Ok(()) => {
                if let Some(pos) = ctx.trader.find_position_mut(&survivor_id) {
                    pos.take_profit_price = base_price;
                    pos.stop_loss_price = original_sl;
                }
                Ok(())
            }
            Err(_) => {
                warn!(pos_id = %survivor_id, "base-price TP placement failed, closing survivor at market");
                ctx.finalize_close(&survivor_id, last_price, ExitReason::BaseClose).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TraderStrategy for VolatilityStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Volatility
    }

    async fn init(&self, ctx: &mut TraderContext<'_>) -> Result<(), StrategyError> {
        let base_price = ctx
            .adapter
            .get_mark_price(&ctx.trader.symbol)
            .await
            .map_err(StrategyError::Exchange)?;
        ctx.trader.base_price = base_price;
        ctx.trader.last_price = base_price;

        Self::place_entry(ctx, PositionSide::Long).await?;
        Self::place_entry(ctx, PositionSide::Short).await?;

        ctx.trader.state = TraderState::Active;
        info!(trader_id = %ctx.trader.id, symbol = %ctx.trader.symbol, base_price = %base_price, "volatility trader initialised");
        Ok(())
    }

    async fn on_event(&self, ctx: &mut TraderContext<'_>, event: &MarketEvent) -> Result<(), StrategyError> {
        match event {
            MarketEvent::OrderFilled { order_id, price, .. } => {
                if let Some(entry) = ctx.trader.take_pending_entry(order_id) {
                    let (tp, sl) = Self::tp_sl_from_base(ctx, entry.direction);
                    let pos_id = Uuid::new_v4().to_string();
                    ctx.trader.positions.push(Position {
                        pos_id: pos_id.clone(),
                        direction: entry.direction,
                        entry_price: *price,
                        quantity: entry.quantity,
                        take_profit_price: tp,
                        stop_loss_price: sl,
                        tp_order_id: None,
                        sl_order_id: None,
                        level_index: 0,
                        is_closing: false,
                    });
                    Self::attach_exits(ctx, &pos_id, ExitKind::TakeProfit, tp).await?;
                    return Ok(());
                }

                if let Some(exit) = ctx.trader.take_pending_exit(order_id) {
                    let pos_id = exit.position_id.clone();
                    let reason: ExitReason = exit.reason.into();
                    let is_first_tp = exit.reason == ExitKind::TakeProfit && ctx.trader.tp_hit_side.is_none();

                    if is_first_tp {
                        let direction = ctx
                            .trader
                            .find_position_mut(&pos_id)
                            .map(|p| p.direction)
                            .unwrap_or(PositionSide::Long);
                        ctx.trader.tp_hit_side = Some(direction);
                        ctx.finalize_close(&pos_id, *price, reason).await?;
                        Self::rewrite_survivor(ctx, &pos_id).await?;
                    } else {
                        ctx.finalize_close(&pos_id, *price, reason).await?;
                    }

                    if ctx.trader.positions.is_empty() {
                        ctx.trader.state = TraderState::Terminal;
                    }
                }
                Ok(())
            }
            MarketEvent::OrderCancelled { order_id, .. } => {
                if let Some(exit) = ctx.trader.take_pending_exit(order_id) {
                    if exit.reason == ExitKind::StopLoss {
                        let is_closing = ctx
                            .trader
                            .find_position_mut(&exit.position_id)
                            .map(|p| p.is_closing)
                            .unwrap_or(true);
                        if !is_closing {
                            let last_price = ctx.trader.last_price;
                            ctx.finalize_close(&exit.position_id, last_price, ExitReason::SlRejected)
                                .await?;
                            if ctx.trader.positions.is_empty() {
                                ctx.trader.state = TraderState::Terminal;
                            }
                        }
                    }
                }
                Ok(())
            }
            MarketEvent::MarkPrice { .. } | MarketEvent::BookTicker { .. } => {
                if ctx.config.is_live() {
                    return Ok(());
                }
                let last_price = ctx.trader.last_price;
                let crossed: Vec<(String, Decimal, ExitReason)> = ctx
                    .trader
                    .positions
                    .iter()
                    .filter(|p| !p.is_closing)
                    .filter_map(|p| {
                        let hit_tp = match p.direction {
                            PositionSide::Long => last_price >= p.take_profit_price,
                            PositionSide::Short => last_price <= p.take_profit_price,
                        };
                        let hit_sl = match p.direction {
                            PositionSide::Long => last_price <= p.stop_loss_price,
                            PositionSide::Short => last_price >= p.stop_loss_price,
                        };
                        if hit_tp {
                            Some((p.pos_id.clone(), p.take_profit_price, ExitReason::TakeProfit))
                        } else if hit_sl {
                            Some((p.pos_id.clone(), p.stop_loss_price, ExitReason::StopLoss))
                        } else {
                            None
                        }
                    })
                    .collect();

                for (pos_id, price, reason) in crossed {
                    let is_first_tp = reason == ExitReason::TakeProfit && ctx.trader.tp_hit_side.is_none();
                    if is_first_tp {
                        let direction = ctx
                            .trader
                            .find_position_mut(&pos_id)
                            .map(|p| p.direction)
                            .unwrap_or(PositionSide::Long);
                        ctx.trader.tp_hit_side = Some(direction);
                        ctx.finalize_close(&pos_id, price, reason).await?;
                        Self::rewrite_survivor(ctx, &pos_id).await?;
                    } else {
                        ctx.finalize_close(&pos_id, price, reason).await?;
                    }
                    if ctx.trader.positions.is_empty() {
                        ctx.trader.state = TraderState::Terminal;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tp_and_sl_reference_base_price_not_entry() {
        let config = crate::config::EngineConfig::from_env();
        let ledger = crate::ledger::Ledger::new(Decimal::from(1000));
        let mut trader = crate::strategy::Trader::new("t1".into(), "BTCUSDT".into(), StrategyKind::Volatility);
        trader.base_price = Decimal::from(100);
        let adapter = TestAdapterStub;
        let ctx = TraderContext {
            trader: &mut trader,
            adapter: &adapter,
            config: &config,
            ledger: &ledger,
        };
        let (tp, sl) = VolatilityStrategy::tp_sl_from_base(&ctx, PositionSide::Long);
        assert_eq!(tp, Decimal::new(103, 0));
        assert_eq!(sl, Decimal::new(94, 0));
    }

    struct TestAdapterStub;

    #[async_trait::async_trait]
    impl crate::exchange::ExchangeAdapter for TestAdapterStub {
        async fn start_market_streams(&self, _symbols: &[String]) -> crate::exchange::ExchangeResult<()> {
            Ok(())
        }
        async fn update_symbols(&self, _symbols: &[String]) -> crate::exchange::ExchangeResult<()> {
            Ok(())
        }
        async fn start_user_data_stream(&self) -> crate::exchange::ExchangeResult<()> {
            Ok(())
        }
        async fn get_mark_price(&self, _symbol: &str) -> crate::exchange::ExchangeResult<Decimal> {
            Ok(Decimal::from(100))
        }
        async fn get_ticker_price(&self, _symbol: &str) -> crate::exchange::ExchangeResult<Decimal> {
            Ok(Decimal::from(100))
        }
        async fn get_24h_tickers(&self) -> crate::exchange::ExchangeResult<Vec<crate::models::Ticker24h>> {
            Ok(Vec::new())
        }
        async fn get_lot_filters(&self, _symbol: &str) -> crate::exchange::ExchangeResult<crate::models::LotFilters> {
            Ok(crate::models::LotFilters::default())
        }
        async fn get_klines(&self, _symbol: &str, _limit: u32) -> crate::exchange::ExchangeResult<Vec<crate::models::Kline>> {
            Ok(Vec::new())
        }
        async fn get_depth(&self, _symbol: &str, _limit: u32) -> crate::exchange::ExchangeResult<crate::models::Depth> {
            Ok(crate::models::Depth { bids: vec![], asks: vec![] })
        }
        async fn get_balance(&self) -> crate::exchange::ExchangeResult<Decimal> {
            Ok(Decimal::from(1000))
        }
        async fn get_position(
            &self,
            _symbol: &str,
            _side: PositionSide,
        ) -> crate::exchange::ExchangeResult<Option<crate::models::PositionSnapshot>> {
            Ok(None)
        }
        async fn get_order_trades(&self, _symbol: &str, _order_id: &str) -> crate::exchange::ExchangeResult<Vec<crate::models::OrderTrade>> {
            Ok(Vec::new())
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> crate::exchange::ExchangeResult<()> {
            Ok(())
        }
        async fn place_order(&self, _request: crate::exchange::NewOrderRequest) -> crate::exchange::ExchangeResult<crate::models::Order> {
            unreachable!("not exercised by this test")
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> crate::exchange::ExchangeResult<crate::exchange::CancelOutcome> {
            unreachable!("not exercised by this test")
        }
        async fn cancel_all_open_orders(&self, _symbol: &str) -> crate::exchange::ExchangeResult<()> {
            Ok(())
        }
        async fn close_position_market(
            &self,
            _symbol: &str,
            _position_side: PositionSide,
            _quantity: Decimal,
        ) -> crate::exchange::ExchangeResult<crate::models::Order> {
            unreachable!("not exercised by this test")
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<crate::exchange::MarketEvent> {
            tokio::sync::broadcast::channel(1).1
        }
    }

    /// A stub whose `place_order`/`cancel_order` actually succeed, for
    /// exercising `rewrite_survivor`'s order-placement path.
    struct FillingAdapterStub;

    #[async_trait::async_trait]
    impl crate::exchange::ExchangeAdapter for FillingAdapterStub {
        async fn start_market_streams(&self, _symbols: &[String]) -> crate::exchange::ExchangeResult<()> { Ok(()) }
        async fn update_symbols(&self, _symbols: &[String]) -> crate::exchange::ExchangeResult<()> { Ok(()) }
        async fn start_user_data_stream(&self) -> crate::exchange::ExchangeResult<()> { Ok(()) }
        async fn get_mark_price(&self, _symbol: &str) -> crate::exchange::ExchangeResult<Decimal> { Ok(Decimal::from(100)) }
        async fn get_ticker_price(&self, _symbol: &str) -> crate::exchange::ExchangeResult<Decimal> { Ok(Decimal::from(100)) }
        async fn get_24h_tickers(&self) -> crate::exchange::ExchangeResult<Vec<crate::models::Ticker24h>> { Ok(Vec::new()) }
        async fn get_lot_filters(&self, _symbol: &str) -> crate::exchange::ExchangeResult<crate::models::LotFilters> {
            Ok(crate::models::LotFilters::default())
        }
        async fn get_klines(&self, _symbol: &str, _limit: u32) -> crate::exchange::ExchangeResult<Vec<crate::models::Kline>> { Ok(Vec::new()) }
        async fn get_depth(&self, _symbol: &str, _limit: u32) -> crate::exchange::ExchangeResult<crate::models::Depth> {
            Ok(crate::models::Depth { bids: vec![], asks: vec![] })
        }
        async fn get_balance(&self) -> crate::exchange::ExchangeResult<Decimal> { Ok(Decimal::from(1000)) }
        async fn get_position(&self, _symbol: &str, _side: PositionSide) -> crate::exchange::ExchangeResult<Option<crate::models::PositionSnapshot>> { Ok(None) }
        async fn get_order_trades(&self, _symbol: &str, _order_id: &str) -> crate::exchange::ExchangeResult<Vec<crate::models::OrderTrade>> { Ok(Vec::new()) }
        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> crate::exchange::ExchangeResult<()> { Ok(()) }
        async fn place_order(&self, request: crate::exchange::NewOrderRequest) -> crate::exchange::ExchangeResult<crate::models::Order> {
            Ok(crate::models::Order {
                order_id: format!("sim-{}", Uuid::new_v4()),
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
        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> crate::exchange::ExchangeResult<crate::exchange::CancelOutcome> {
            Ok(crate::exchange::CancelOutcome { order_id: order_id.to_string(), status: crate::models::CancelStatus::Cancelled })
        }
        async fn cancel_all_open_orders(&self, _symbol: &str) -> crate::exchange::ExchangeResult<()> { Ok(()) }
        async fn close_position_market(&self, symbol: &str, position_side: PositionSide, quantity: Decimal) -> crate::exchange::ExchangeResult<crate::models::Order> {
            Ok(crate::models::Order {
                order_id: format!("sim-close-{}", Uuid::new_v4()),
                symbol: symbol.to_string(),
                side: position_side.exit_side(),
                order_type: crate::models::OrderType::Market,
                quantity,
                price: None,
                stop_price: None,
                reduce_only: true,
                position_side,
            })
        }
        fn is_connected(&self) -> bool { true }
        fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<crate::exchange::MarketEvent> {
            tokio::sync::broadcast::channel(1).1
        }
    }

    fn survivor_fixture(direction: PositionSide) -> Position {
        Position {
            pos_id: "survivor".into(),
            direction,
            entry_price: Decimal::from(100),
            quantity: Decimal::ONE,
            take_profit_price: if direction == PositionSide::Long { Decimal::from(97) } else { Decimal::from(103) },
            stop_loss_price: if direction == PositionSide::Long { Decimal::from(94) } else { Decimal::from(106) },
            tp_order_id: Some("tp-old".into()),
            sl_order_id: Some("sl-old".into()),
            level_index: 0,
            is_closing: false,
        }
    }

    /// Regression test for the TP-then-rewrite protocol: when the surviving
    /// leg's rewritten TP has NOT yet been reached by the current price,
    /// `rewrite_survivor` must place a new order and leave the position
    /// open — not short-circuit-close it.
    #[tokio::test]
    async fn rewrite_survivor_places_new_tp_when_not_already_passed() {
        let config = crate::config::EngineConfig::from_env();
        let ledger = crate::ledger::Ledger::new(Decimal::from(1000));
        let mut trader = crate::strategy::Trader::new("t1".into(), "BTCUSDT".into(), StrategyKind::Volatility);
        trader.base_price = Decimal::from(100);
        // LONG's TP just fired at 103; SHORT survives and has NOT yet
        // crossed back down through base (103 > 100), so its break-even
        // buy-limit at 100 would not trigger immediately.
        trader.last_price = Decimal::from(103);
        trader.positions.push(survivor_fixture(PositionSide::Short));

        let adapter = FillingAdapterStub;
        let mut ctx = TraderContext { trader: &mut trader, adapter: &adapter, config: &config, ledger: &ledger };
        VolatilityStrategy::rewrite_survivor(&mut ctx, "tpd-leg").await.unwrap();

        let pos = ctx.trader.find_position_mut("survivor").expect("survivor stays open");
        assert_eq!(pos.take_profit_price, Decimal::from(100));
        assert_eq!(pos.stop_loss_price, Decimal::from(106));
        assert!(!pos.is_closing);
    }

    /// Symmetric case: SHORT's TP fires first at 97; LONG survives. Price
    /// has not yet risen back to base (97 < 100), so LONG's rewritten
    /// sell-limit at 100 would not trigger immediately either.
    #[tokio::test]
    async fn rewrite_survivor_places_new_tp_for_long_survivor() {
        let config = crate::config::EngineConfig::from_env();
        let ledger = crate::ledger::Ledger::new(Decimal::from(1000));
        let mut trader = crate::strategy::Trader::new("t1".into(), "BTCUSDT".into(), StrategyKind::Volatility);
        trader.base_price = Decimal::from(100);
        trader.last_price = Decimal::from(97);
        trader.positions.push(survivor_fixture(PositionSide::Long));

        let adapter = FillingAdapterStub;
        let mut ctx = TraderContext { trader: &mut trader, adapter: &adapter, config: &config, ledger: &ledger };
        VolatilityStrategy::rewrite_survivor(&mut ctx, "tpd-leg").await.unwrap();

        let pos = ctx.trader.find_position_mut("survivor").expect("survivor stays open");
        assert_eq!(pos.take_profit_price, Decimal::from(100));
        assert_eq!(pos.stop_loss_price, Decimal::from(94));
        assert!(!pos.is_closing);
    }

    /// When the survivor's break-even TP condition is already satisfied at
    /// rewrite time, it should market-close immediately rather than place
    /// an order that would just instant-fill.
    #[tokio::test]
    async fn rewrite_survivor_closes_immediately_when_already_passed() {
        let config = crate::config::EngineConfig::from_env();
        let ledger = crate::ledger::Ledger::new(Decimal::from(1000));
        let mut trader = crate::strategy::Trader::new("t1".into(), "BTCUSDT".into(), StrategyKind::Volatility);
        trader.base_price = Decimal::from(100);
        // SHORT survivor, price already at/below base: its buy-limit TP at
        // base would trigger the instant it's placed.
        trader.last_price = Decimal::from(99);
        trader.positions.push(survivor_fixture(PositionSide::Short));

        let adapter = FillingAdapterStub;
        let mut ctx = TraderContext { trader: &mut trader, adapter: &adapter, config: &config, ledger: &ledger };
        VolatilityStrategy::rewrite_survivor(&mut ctx, "tpd-leg").await.unwrap();

        assert!(ctx.trader.find_position_mut("survivor").is_none());
        assert_eq!(ctx.trader.trade_history.len(), 1);
        assert_eq!(ctx.trader.trade_history[0].reason, ExitReason::BaseClose);
    }
}
