//! Grid strategy: symmetric limit entries offset from a base price, each
//! fill paired with a reduce-only TP/SL exit.
//!
//! Uses the **limit** entry variant (not stop-limit): it is the one
//! consistent with the LONG-below/SHORT-above boundary scenario. See
//! DESIGN.md for the rationale.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StrategyError;
use crate::exchange::{MarketEvent, NewOrderRequest};
use crate::models::{ExitKind, ExitReason, PendingEntry, PendingExit, Position, PositionSide, Side, StrategyKind};
use crate::strategy::{TraderContext, TraderStrategy};

/// 0.02%, expressed as a fraction: the "already crossed" tolerance band
/// applied around the stop-loss price.
const SL_PROXIMITY_TOLERANCE: &str = "0.0002";

pub struct GridStrategy;

impl GridStrategy {
    fn entry_quantity(ctx: &TraderContext<'_>, price: Decimal) -> Decimal {
        let equity = ctx.ledger.equity();
        let equity_fraction = Decimal::try_from(ctx.config.equity_fraction).unwrap_or_default();
        let leverage = Decimal::from(ctx.config.leverage);
        let denom = Decimal::from(ctx.config.max_traders) * Decimal::TWO * price;
        if denom.is_zero() || price.is_zero() {
            return Decimal::ZERO;
        }
        equity * equity_fraction * leverage / denom
    }

    fn tp_sl_for(direction: PositionSide, entry: Decimal, tp_pct: f64, sl_pct: f64) -> (Decimal, Decimal) {
        let tp_frac = Decimal::try_from(tp_pct / 100.0).unwrap_or_default();
        let sl_frac = Decimal::try_from(sl_pct / 100.0).unwrap_or_default();
        let dir = Decimal::from(direction.sign());
        let tp = entry * (Decimal::ONE + dir * tp_frac);
        let sl = entry * (Decimal::ONE - dir * sl_frac);
        (tp, sl)
    }

    /// Within 0.02% of the SL counts as already crossed.
    fn sl_already_crossed(direction: PositionSide, last_price: Decimal, sl_price: Decimal) -> bool {
        let tolerance: Decimal = SL_PROXIMITY_TOLERANCE.parse().unwrap();
        let band = sl_price * tolerance;
        match direction {
            PositionSide::Long => last_price <= sl_price + band,
            PositionSide::Short => last_price >= sl_price - band,
        }
    }

    async fn attach_exits(ctx: &mut TraderContext<'_>, pos_id: &str) -> Result<(), StrategyError> {
        let (direction, entry, quantity, tp_price, sl_price, last_price) = {
            let pos = ctx
                .trader
                .find_position_mut(pos_id)
                .expect("position just inserted");
            (
                pos.direction,
                pos.entry_price,
                pos.quantity,
                pos.take_profit_price,
                pos.stop_loss_price,
                ctx.trader.last_price,
            )
        };

        if Self::sl_already_crossed(direction, last_price, sl_price) {
            warn!(pos_id, "SL already crossed at entry, closing immediately");
            ctx.finalize_close(pos_id, last_price, ExitReason::StopLoss).await?;
            ctx.trader.state = crate::models::TraderState::Terminal;
            return Ok(());
        }

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
            .await?;
        if let Some(pos) = ctx.trader.find_position_mut(pos_id) {
            pos.tp_order_id = Some(tp_order.order_id.clone());
        }
        ctx.trader.pending_exits.push(PendingExit {
            order_id: tp_order.order_id,
            position_id: pos_id.to_string(),
            reason: ExitKind::TakeProfit,
            price: tp_price,
        });

        match ctx
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
        {
            Ok(sl_order) => {
                if let Some(pos) = ctx.trader.find_position_mut(pos_id) {
                    pos.sl_order_id = Some(sl_order.order_id.clone());
                }
                ctx.trader.pending_exits.push(PendingExit {
                    order_id: sl_order.order_id,
                    position_id: pos_id.to_string(),
                    reason: ExitKind::StopLoss,
                    price: sl_price,
                });
            }
            Err(e) if e.is_would_immediately_trigger() => {
                warn!(pos_id, "SL rejected (-2021), closing at market");
                ctx.finalize_close(pos_id, entry, ExitReason::StopLoss).await?;
                ctx.trader.state = crate::models::TraderState::Terminal;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    /// Test-mode "force close": on each price event, synchronously finalizes
    /// any position whose TP/SL level has already been crossed.
    /// Complements the simulator so isolated Adapter fakes still observe
    /// closures.
    async fn force_close_crossed(ctx: &mut TraderContext<'_>) -> Result<(), StrategyError> {
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
            ctx.finalize_close(&pos_id, price, reason).await?;
            if reason.destroys_grid_trader() {
                ctx.trader.state = crate::models::TraderState::Terminal;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TraderStrategy for GridStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Grid
    }

    async fn init(&self, ctx: &mut TraderContext<'_>) -> Result<(), StrategyError> {
        let base_price = ctx
            .adapter
            .get_mark_price(&ctx.trader.symbol)
            .await
            .map_err(StrategyError::Exchange)?;
        ctx.trader.base_price = base_price;
        ctx.trader.last_price = base_price;

        let spacing = Decimal::try_from(ctx.config.level_spacing_percent / 100.0).unwrap_or_default();
        let long_price = base_price * (Decimal::ONE - spacing);
        let short_price = base_price * (Decimal::ONE + spacing);

        let long_qty = Self::entry_quantity(ctx, long_price);
        let long_order = ctx
            .adapter
            .place_order(NewOrderRequest::limit(
                ctx.trader.symbol.clone(),
                Side::Buy,
                PositionSide::Long,
                long_qty,
                long_price,
                false,
            ))
            .await
            .map_err(StrategyError::Exchange)?;
        ctx.trader.pending_entries.push(PendingEntry {
            order_id: long_order.order_id,
            direction: PositionSide::Long,
            price: long_price,
            quantity: long_qty,
            level_index: -1,
        });

        let short_qty = Self::entry_quantity(ctx, short_price);
        let short_order = ctx
            .adapter
            .place_order(NewOrderRequest::limit(
                ctx.trader.symbol.clone(),
                Side::Sell,
                PositionSide::Short,
                short_qty,
                short_price,
                false,
            ))
            .await
            .map_err(StrategyError::Exchange)?;
        ctx.trader.pending_entries.push(PendingEntry {
            order_id: short_order.order_id,
            direction: PositionSide::Short,
            price: short_price,
            quantity: short_qty,
            level_index: 1,
        });

        ctx.trader.state = crate::models::TraderState::Active;
        info!(trader_id = %ctx.trader.id, symbol = %ctx.trader.symbol, base_price = %base_price, "grid trader initialised");
        Ok(())
    }

    async fn on_event(&self, ctx: &mut TraderContext<'_>, event: &MarketEvent) -> Result<(), StrategyError> {
        match event {
            MarketEvent::OrderFilled { order_id, price, .. } => {
                if let Some(entry) = ctx.trader.take_pending_entry(order_id) {
                    let (tp, sl) = Self::tp_sl_for(
                        entry.direction,
                        *price,
                        ctx.config.take_profit_percent,
                        ctx.config.stop_loss_percent,
                    );
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
                        level_index: entry.level_index,
                        is_closing: false,
                    });
                    Self::attach_exits(ctx, &pos_id).await?;
                    return Ok(());
                }

                if let Some(exit) = ctx.trader.take_pending_exit(order_id) {
                    ctx.finalize_close(&exit.position_id, *price, exit.reason.into()).await?;
                    if ExitReason::from(exit.reason).destroys_grid_trader() {
                        ctx.trader.state = crate::models::TraderState::Terminal;
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
                            ctx.trader.state = crate::models::TraderState::Terminal;
                        }
                    }
                }
                Ok(())
            }
            MarketEvent::MarkPrice { .. } | MarketEvent::BookTicker { .. } => {
                Self::force_close_crossed(ctx).await
            }
        }
    }
}
