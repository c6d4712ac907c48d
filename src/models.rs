//! Core data model: Symbol, Order, Position, PendingEntry, PendingExit, and
//! the Trader/Ledger snapshot types shared across modules.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Opaque routing key for market events. Real symbols look like `BTCUSDT`.
pub type Symbol = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for LONG, -1 for SHORT — the `dir` multiplier used throughout P&L
    /// and TP/SL math.
    pub fn sign(self) -> i32 {
        match self {
            PositionSide::Long => 1,
            PositionSide::Short => -1,
        }
    }

    pub fn entry_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// The side of a reduce-only order that closes a position of this side.
    pub fn exit_side(self) -> Side {
        self.entry_side().opposite()
    }

    pub fn opposite(self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    StopLimit,
    StopMarket,
    Market,
}

impl OrderType {
    /// Conditional (`STOP_*`) orders travel over the algo-order endpoint in
    /// live mode; clients of the adapter must not observe the split (§4.1).
    pub fn is_algo(self) -> bool {
        matches!(self, OrderType::StopLimit | OrderType::StopMarket)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub position_side: PositionSide,
}

/// Why a position's exit order fired, or why it was force-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    /// Volatility break-even close of the surviving leg (§4.3).
    BaseClose,
    /// SL order was cancelled/rejected while the position was still open;
    /// the position was closed defensively (§4.2 "On exit cancellation").
    SlRejected,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take-profit",
            ExitReason::StopLoss => "stop-loss",
            ExitReason::BaseClose => "base-close",
            ExitReason::SlRejected => "sl-rejected",
        }
    }

    /// Grid destroys the Trader after a TP or SL close (§4.2 "Finalize
    /// close"); other reasons (sl-rejected, base-close) follow their own
    /// strategy-specific lifecycle rules.
    pub fn destroys_grid_trader(self) -> bool {
        matches!(self, ExitReason::TakeProfit | ExitReason::StopLoss)
    }
}

/// What kind of exit a [`PendingExit`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    TakeProfit,
    StopLoss,
    BaseClose,
}

impl From<ExitKind> for ExitReason {
    fn from(k: ExitKind) -> Self {
        match k {
            ExitKind::TakeProfit => ExitReason::TakeProfit,
            ExitKind::StopLoss => ExitReason::StopLoss,
            ExitKind::BaseClose => ExitReason::BaseClose,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub pos_id: String,
    pub direction: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub level_index: i32,
    pub is_closing: bool,
}

impl Position {
    /// While not closing, the position carries exactly one live TP and one
    /// live SL order, or is in the transient window between entry-fill and
    /// exit-orders-ack (both ids still `None`).
    pub fn has_both_exits(&self) -> bool {
        self.tp_order_id.is_some() && self.sl_order_id.is_some()
    }

    pub fn in_transient_window(&self) -> bool {
        !self.is_closing && self.tp_order_id.is_none() && self.sl_order_id.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub order_id: String,
    pub direction: PositionSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub level_index: i32,
}

#[derive(Debug, Clone)]
pub struct PendingExit {
    pub order_id: String,
    pub position_id: String,
    pub reason: ExitKind,
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub pos_id: String,
    pub symbol: Symbol,
    pub direction: PositionSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub fees: Decimal,
    pub reason: ExitReason,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyKind {
    Grid,
    Volatility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraderState {
    Init,
    Active,
    Terminal,
}

/// A read-only snapshot of a Trader for the Ledger/dashboard. The live
/// `Trader` struct (strategy::Trader) is mutable and owns orders/positions
/// directly; this is what gets published out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderSnapshot {
    pub id: String,
    pub symbol: Symbol,
    pub strategy: StrategyKind,
    pub base_price: Decimal,
    pub last_price: Decimal,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub unrealized_pnl: Decimal,
    pub open_positions: usize,
    pub created_at: DateTime<Utc>,
}

/// Per-symbol lot filters from `getExchangeInfo` (tickSize/stepSize), cached
/// with a 10-minute TTL by the adapter (§4.1).
#[derive(Debug, Clone, Copy)]
pub struct LotFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
}

impl Default for LotFilters {
    fn default() -> Self {
        Self {
            tick_size: Decimal::new(1, 4),
            step_size: Decimal::new(1, 3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ticker24h {
    pub symbol: Symbol,
    pub price_change_percent: f64,
    pub quote_volume: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone)]
pub struct Depth {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

impl Depth {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|(p, _)| *p)
    }

    /// Sum of notional within `within_pct` of mid, both sides — used by the
    /// scanner's depth filter (§6).
    pub fn notional_within(&self, mid: Decimal, within_pct: Decimal) -> Decimal {
        let band = mid * within_pct / Decimal::ONE_HUNDRED;
        let lo = mid - band;
        let hi = mid + band;
        let bid_sum: Decimal = self
            .bids
            .iter()
            .filter(|(p, _)| *p >= lo)
            .map(|(p, q)| *p * *q)
            .sum();
        let ask_sum: Decimal = self
            .asks
            .iter()
            .filter(|(p, _)| *p <= hi)
            .map(|(p, q)| *p * *q)
            .sum();
        bid_sum + ask_sum
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrderTrade {
    pub order_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    Cancelled,
    /// `-2011` unknown order — treated as success per §4.1.
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct PositionSnapshot {
    pub direction: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}
