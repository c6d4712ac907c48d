//! Performance & Equity Ledger.
//!
//! Tracks balance, equity, drawdown, and per-trade P&L across every Trader.
//! Shared by the Supervisor (balance/equity) and every Trader
//! (`record_trade`) — mutation is guarded by a single `parking_lot` mutex so
//! `get_dashboard_update` reads never tear.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::TraderSnapshot;

const EQUITY_SERIES_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquitySample {
    pub time: DateTime<Utc>,
    pub equity: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Performance {
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub fees_paid: Decimal,
    pub net_profit: Decimal,
    pub max_drawdown: Decimal,
}

/// `getPerformance`'s live variants, folding in current unrealised P&L across
/// active traders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LivePerformance {
    pub gross_profit_live: Decimal,
    pub gross_loss_live: Decimal,
    pub net_profit_live: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketStatus {
    pub api_ok: bool,
    pub ws_ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardUpdate {
    pub balance: Decimal,
    pub equity: Decimal,
    pub peak_equity: Decimal,
    pub pnl_today: Decimal,
    pub performance: Performance,
    pub live_performance: LivePerformance,
    pub traders: Vec<TraderSnapshot>,
    pub market_status: MarketStatus,
}

#[derive(Debug, Default)]
struct LedgerInner {
    balance: Decimal,
    equity: Decimal,
    peak_equity: Decimal,
    pnl_today: Decimal,
    performance: Performance,
    equity_series: std::collections::VecDeque<EquitySample>,
    traders: HashMap<String, TraderSnapshot>,
    market_status: MarketStatus,
}

/// Process-wide equity/P&L resource constructed once at startup and shared
/// by handle (an `Arc<Ledger>`).
#[derive(Debug, Default)]
pub struct Ledger {
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    pub fn new(starting_balance: Decimal) -> Arc<Self> {
        let ledger = Self {
            inner: Mutex::new(LedgerInner {
                balance: starting_balance,
                equity: starting_balance,
                peak_equity: starting_balance,
                ..Default::default()
            }),
        };
        Arc::new(ledger)
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.inner.lock().balance = balance;
    }

    pub fn balance(&self) -> Decimal {
        self.inner.lock().balance
    }

    /// Pushes a `{time, equity}` sample onto the bounded ring (evicting the
    /// oldest past 500 entries) and updates `peakEquity`/`maxDrawdown`
    /// (both monotonic).
    pub fn set_equity(&self, equity: Decimal) {
        let mut inner = self.inner.lock();
        inner.equity = equity;
        inner.peak_equity = inner.peak_equity.max(equity);

        let series = &mut inner.equity_series;
        series.push_back(EquitySample {
            time: Utc::now(),
            equity,
        });
        while series.len() > EQUITY_SERIES_CAPACITY {
            series.pop_front();
        }

        if inner.peak_equity > Decimal::ZERO {
            let drawdown =
                (inner.peak_equity - equity) / inner.peak_equity * Decimal::ONE_HUNDRED;
            inner.performance.max_drawdown = inner.performance.max_drawdown.max(drawdown);
        }
    }

    pub fn equity(&self) -> Decimal {
        self.inner.lock().equity
    }

    pub fn peak_equity(&self) -> Decimal {
        self.inner.lock().peak_equity
    }

    pub fn equity_series(&self) -> Vec<EquitySample> {
        self.inner.lock().equity_series.iter().copied().collect()
    }

    /// Records a closed trade's P&L and fees. Only Traders call this.
    pub fn record_trade(&self, pnl: Decimal, fees: Decimal) {
        let mut inner = self.inner.lock();
        inner.performance.total_trades += 1;
        if pnl >= Decimal::ZERO {
            inner.performance.wins += 1;
            inner.performance.gross_profit += pnl;
        } else {
            inner.performance.losses += 1;
            inner.performance.gross_loss += pnl.abs();
        }
        inner.performance.fees_paid += fees;
        inner.performance.net_profit =
            inner.performance.gross_profit - inner.performance.gross_loss - inner.performance.fees_paid;
        inner.pnl_today += pnl - fees;
    }

    pub fn upsert_trader(&self, snapshot: TraderSnapshot) {
        self.inner.lock().traders.insert(snapshot.id.clone(), snapshot);
    }

    pub fn remove_trader(&self, id: &str) {
        self.inner.lock().traders.remove(id);
    }

    pub fn get_traders(&self) -> Vec<TraderSnapshot> {
        self.inner.lock().traders.values().cloned().collect()
    }

    pub fn get_trader(&self, id: &str) -> Option<TraderSnapshot> {
        self.inner.lock().traders.get(id).cloned()
    }

    pub fn set_market_status(&self, api_ok: bool, ws_ok: bool) {
        let mut inner = self.inner.lock();
        inner.market_status.api_ok = api_ok;
        inner.market_status.ws_ok = ws_ok;
    }

    pub fn get_performance(&self) -> Performance {
        self.inner.lock().performance.clone()
    }

    /// `getPerformance`'s live variants: folds in current unrealised P&L
    /// summed across active traders.
    pub fn get_live_performance(&self) -> LivePerformance {
        let inner = self.inner.lock();
        let unrealized: Decimal = inner
            .traders
            .values()
            .map(|t| t.unrealized_pnl)
            .sum();
        let gross_profit_live = inner.performance.gross_profit + unrealized.max(Decimal::ZERO);
        let gross_loss_live = inner.performance.gross_loss + (-unrealized).max(Decimal::ZERO);
        LivePerformance {
            gross_profit_live,
            gross_loss_live,
            net_profit_live: gross_profit_live - gross_loss_live - inner.performance.fees_paid,
        }
    }

    pub fn get_status(&self) -> (Decimal, Decimal, Decimal, Decimal) {
        let inner = self.inner.lock();
        (inner.balance, inner.equity, inner.peak_equity, inner.pnl_today)
    }

    /// Internally synchronised full snapshot for the dashboard websocket's
    /// 2s `dashboardUpdate` tick.
    pub fn get_dashboard_update(&self) -> DashboardUpdate {
        let inner = self.inner.lock();
        let unrealized: Decimal = inner.traders.values().map(|t| t.unrealized_pnl).sum();
        let gross_profit_live = inner.performance.gross_profit + unrealized.max(Decimal::ZERO);
        let gross_loss_live = inner.performance.gross_loss + (-unrealized).max(Decimal::ZERO);
        DashboardUpdate {
            balance: inner.balance,
            equity: inner.equity,
            peak_equity: inner.peak_equity,
            pnl_today: inner.pnl_today,
            performance: inner.performance.clone(),
            live_performance: LivePerformance {
                gross_profit_live,
                gross_loss_live,
                net_profit_live: gross_profit_live - gross_loss_live - inner.performance.fees_paid,
            },
            traders: inner.traders.values().cloned().collect(),
            market_status: inner.market_status.clone(),
        }
    }
}
