//! Trader state machine scaffolding.
//!
//! A `TraderStrategy` trait shared by [`grid::GridStrategy`] and
//! [`volatility::VolatilityStrategy`], operating on a common `Trader` record
//! through a borrowed [`TraderContext`]. Each `Trader` is driven by its own
//! task holding a `tokio::sync::Mutex`: events for one Trader are never
//! processed concurrently, so a placement RPC always completes (and the
//! resulting id is recorded in `pendingExits`) before the next event for that
//! Trader is handled.

pub mod grid;
pub mod volatility;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::StrategyError;
use crate::exchange::{ExchangeAdapter, MarketEvent};
use crate::config::EngineConfig;
use crate::ledger::Ledger;
use crate::models::{
    PendingEntry, PendingExit, Position, PositionSide, StrategyKind, Symbol, TradeRecord,
    TraderSnapshot, TraderState,
};

/// Mutable per-symbol state a `TraderStrategy` advances. Lifecycle fields
/// (`pendingEntries`, `pendingExits`, `positions`, `tradeHistory`) are
/// exclusively owned by the Trader.
pub struct Trader {
    pub id: String,
    pub symbol: Symbol,
    pub strategy_kind: StrategyKind,
    pub state: TraderState,
    pub base_price: Decimal,
    pub last_price: Decimal,
    pub created_at: chrono::DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub pending_entries: Vec<PendingEntry>,
    pub pending_exits: Vec<PendingExit>,
    pub positions: Vec<Position>,
    pub trade_history: Vec<TradeRecord>,
    /// Volatility-only: the direction whose TP fired first.
    pub tp_hit_side: Option<PositionSide>,
}

impl Trader {
    pub fn new(id: String, symbol: Symbol, strategy_kind: StrategyKind) -> Self {
        Self {
            id,
            symbol,
            strategy_kind,
            state: TraderState::Init,
            base_price: Decimal::ZERO,
            last_price: Decimal::ZERO,
            created_at: Utc::now(),
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            pending_entries: Vec::new(),
            pending_exits: Vec::new(),
            positions: Vec::new(),
            trade_history: Vec::new(),
            tp_hit_side: None,
        }
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions
            .iter()
            .map(|p| (self.last_price - p.entry_price) * p.quantity * Decimal::from(p.direction.sign()))
            .sum()
    }

    pub fn snapshot(&self) -> TraderSnapshot {
        TraderSnapshot {
            id: self.id.clone(),
            symbol: self.symbol.clone(),
            strategy: self.strategy_kind,
            base_price: self.base_price,
            last_price: self.last_price,
            realized_pnl: self.realized_pnl,
            fees_paid: self.fees_paid,
            unrealized_pnl: self.unrealized_pnl(),
            open_positions: self.positions.len(),
            created_at: self.created_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == TraderState::Terminal
    }

    pub fn find_position_mut(&mut self, pos_id: &str) -> Option<&mut Position> {
        self.positions.iter_mut().find(|p| p.pos_id == pos_id)
    }

    pub fn take_pending_entry(&mut self, order_id: &str) -> Option<PendingEntry> {
        let idx = self.pending_entries.iter().position(|e| e.order_id == order_id)?;
        Some(self.pending_entries.remove(idx))
    }

    pub fn take_pending_exit(&mut self, order_id: &str) -> Option<PendingExit> {
        let idx = self.pending_exits.iter().position(|e| e.order_id == order_id)?;
        Some(self.pending_exits.remove(idx))
    }

    pub fn pending_exit_for_position(&self, pos_id: &str) -> Option<&PendingExit> {
        self.pending_exits.iter().find(|e| e.position_id == pos_id)
    }
}

/// Bundles everything a `TraderStrategy` needs to advance one `Trader`.
pub struct TraderContext<'a> {
    pub trader: &'a mut Trader,
    pub adapter: &'a dyn ExchangeAdapter,
    pub config: &'a EngineConfig,
    pub ledger: &'a Ledger,
}

impl<'a> TraderContext<'a> {
    /// Shared close path for both strategies: marks the position closing,
    /// cancels its sibling exit, computes P&L/fees, records trade history,
    /// and updates the Ledger.
    pub async fn finalize_close(
        &mut self,
        pos_id: &str,
        exit_price: Decimal,
        reason: crate::models::ExitReason,
    ) -> Result<(), StrategyError> {
        let Some(pos_idx) = self.trader.positions.iter().position(|p| p.pos_id == pos_id) else {
            return Ok(()); // already closed; idempotent
        };
        let mut pos = self.trader.positions.remove(pos_idx);
        pos.is_closing = true;

        let filled_order_id = match reason {
            crate::models::ExitReason::TakeProfit => pos.tp_order_id.clone(),
            crate::models::ExitReason::StopLoss => pos.sl_order_id.clone(),
            _ => None,
        };

        if let Some(tp) = pos.tp_order_id.take() {
            let _ = self.adapter.cancel_order(&self.trader.symbol, &tp).await;
        }
        if let Some(sl) = pos.sl_order_id.take() {
            let _ = self.adapter.cancel_order(&self.trader.symbol, &sl).await;
        }
        self.trader.pending_exits.retain(|e| e.position_id != pos_id);

        let dir = Decimal::from(pos.direction.sign());
        let mut pnl = (exit_price - pos.entry_price) * pos.quantity * dir;
        let mut fees = (pos.entry_price + exit_price) * pos.quantity * Decimal::try_from(self.config.fee_rate).unwrap_or_default();

        if self.config.is_live() {
            if let Ok(trades) = self
                .adapter
                .get_order_trades(&self.trader.symbol, filled_order_id.as_deref().unwrap_or(pos_id))
                .await
            {
                if !trades.is_empty() {
                    let realized: Decimal = trades.iter().map(|t| t.realized_pnl).sum();
                    let commission: Decimal = trades.iter().map(|t| t.commission).sum();
                    pnl = realized;
                    fees = commission;
                }
            }
        }

        self.trader.realized_pnl += pnl;
        self.trader.fees_paid += fees;
        self.trader.trade_history.push(TradeRecord {
            pos_id: pos.pos_id.clone(),
            symbol: self.trader.symbol.clone(),
            direction: pos.direction,
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            pnl,
            fees,
            reason,
            closed_at: Utc::now(),
        });
        self.ledger.record_trade(pnl, fees);

        info!(
            trader_id = %self.trader.id,
            symbol = %self.trader.symbol,
            pos_id,
            reason = reason.as_str(),
            pnl = %pnl,
            "position finalized"
        );

        Ok(())
    }
}

/// Strategy-specific behaviour shared by Grid and Volatility behind one
/// interface.
#[async_trait]
pub trait TraderStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Reads the base price, computes and places the initial order(s), and
    /// transitions the Trader to `ACTIVE`.
    async fn init(&self, ctx: &mut TraderContext<'_>) -> Result<(), StrategyError>;

    /// Advances the Trader's state machine for one market/order event.
    async fn on_event(&self, ctx: &mut TraderContext<'_>, event: &MarketEvent) -> Result<(), StrategyError>;
}

/// Owns one Trader plus its strategy and drives it from a dedicated task
/// subscribed to the Adapter's broadcast channel, filtering by symbol —
/// giving each Trader its own serial event queue.
pub struct TraderHandle {
    pub symbol: Symbol,
    pub trader: Arc<Mutex<Trader>>,
    strategy: Arc<dyn TraderStrategy>,
}

impl TraderHandle {
    pub fn new(trader: Trader, strategy: Arc<dyn TraderStrategy>) -> Self {
        Self {
            symbol: trader.symbol.clone(),
            trader: Arc::new(Mutex::new(trader)),
            strategy,
        }
    }

    pub async fn snapshot(&self) -> TraderSnapshot {
        self.trader.lock().await.snapshot()
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub async fn is_terminal(&self) -> bool {
        self.trader.lock().await.is_terminal()
    }

    pub async fn init(
        &self,
        adapter: &dyn ExchangeAdapter,
        config: &EngineConfig,
        ledger: &Ledger,
    ) -> Result<(), StrategyError> {
        let mut trader = self.trader.lock().await;
        let mut ctx = TraderContext {
            trader: &mut trader,
            adapter,
            config,
            ledger,
        };
        self.strategy.init(&mut ctx).await
    }

    /// Dispatches one event to this Trader if it's addressed to its symbol.
    /// Locking the Trader mutex for the duration of the call is what
    /// serialises event handling.
    pub async fn handle_event(
        &self,
        event: &MarketEvent,
        adapter: &dyn ExchangeAdapter,
        config: &EngineConfig,
        ledger: &Ledger,
    ) {
        if event.symbol() != self.symbol {
            return;
        }
        let mut trader = self.trader.lock().await;
        if trader.is_terminal() {
            return;
        }
        trader.last_price = match event {
            MarketEvent::MarkPrice { price, .. } => *price,
            MarketEvent::BookTicker { bid, ask, .. } => (*bid + *ask) / Decimal::TWO,
            _ => trader.last_price,
        };
        let mut ctx = TraderContext {
            trader: &mut trader,
            adapter,
            config,
            ledger,
        };
        if let Err(e) = self.strategy.on_event(&mut ctx, event).await {
            warn!(trader_id = %ctx.trader.id, error = %e, "trader event handling failed");
        }
        ledger.upsert_trader(ctx.trader.snapshot());
    }
}
