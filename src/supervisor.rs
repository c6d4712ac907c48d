//! Supervisor: schedules per-symbol Traders within global slots, enforces
//! cooldowns/blacklists and the daily trading window.
//!
//! A `Mutex`-guarded map of owned Trader handles plus two periodic background
//! tasks (account sync, scan-and-launch) and an event dispatch loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Timelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::exchange::{ExchangeAdapter, MarketEvent};
use crate::ledger::Ledger;
use crate::models::{Kline, StrategyKind, Symbol};
use crate::scanner::{CandidateInput, RankedScanner, Scanner};
use crate::strategy::grid::GridStrategy;
use crate::strategy::volatility::VolatilityStrategy;
use crate::strategy::{Trader, TraderHandle, TraderStrategy};

/// Per-symbol start-failure cooldown bookkeeping.
struct FailureRecord {
    count: u32,
    until: chrono::DateTime<Utc>,
}

struct SupervisorInner {
    traders: HashMap<Symbol, Arc<TraderHandle>>,
    leverage_set: std::collections::HashSet<Symbol>,
    leverage_blacklist: std::collections::HashSet<Symbol>,
    failed_symbols: HashMap<Symbol, FailureRecord>,
    consecutive_losses: u32,
    loss_cooldown_until: chrono::DateTime<Utc>,
}

/// Owns the set of active Traders (keyed by symbol) and the two periodic
/// tasks (`accountSync`, `scanAndLaunch`) that drive the engine.
pub struct Supervisor {
    config: EngineConfig,
    adapter: Arc<dyn ExchangeAdapter>,
    ledger: Arc<Ledger>,
    scanner: RankedScanner,
    inner: Mutex<SupervisorInner>,
}

impl Supervisor {
    pub fn new(config: EngineConfig, adapter: Arc<dyn ExchangeAdapter>, ledger: Arc<Ledger>) -> Arc<Self> {
        Arc::new(Self {
            config,
            adapter,
            ledger,
            scanner: RankedScanner,
            inner: Mutex::new(SupervisorInner {
                traders: HashMap::new(),
                leverage_set: std::collections::HashSet::new(),
                leverage_blacklist: std::collections::HashSet::new(),
                failed_symbols: HashMap::new(),
                consecutive_losses: 0,
                loss_cooldown_until: Utc::now(),
            }),
        })
    }

    /// Starts the user-data stream (live only), connects market streams for
    /// an empty symbol set, syncs the account once, then spawns the three
    /// background loops: `accountSync` (10s), `scanAndLaunch`
    /// (`scannerIntervalMs`), and the event-dispatch loop.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.config.is_live() {
            self.adapter
                .start_user_data_stream()
                .await
                .map_err(|e| anyhow::anyhow!("user data stream failed to start: {e}"))?;
        }
        self.adapter
            .update_symbols(&[])
            .await
            .map_err(|e| anyhow::anyhow!("market stream failed to start: {e}"))?;
        self.account_sync().await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(std::time::Duration::from_secs(10));
            loop {
                ticker.tick().await;
                this.account_sync().await;
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(std::time::Duration::from_millis(this.config.scanner_interval_ms));
            loop {
                ticker.tick().await;
                this.scan_and_launch().await;
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.dispatch_events().await;
        });

        Ok(())
    }

    /// `accountSync`: refresh balance, fold in unrealized P&L for equity,
    /// and update market status.
    async fn account_sync(&self) {
        let unrealized: Decimal = self
            .ledger
            .get_traders()
            .iter()
            .map(|t| t.unrealized_pnl)
            .sum();

        let balance = if self.config.is_live() {
            match self.adapter.get_balance().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "account sync: balance fetch failed");
                    self.ledger.set_market_status(false, self.adapter.is_connected());
                    return;
                }
            }
        } else {
            let starting = Decimal::try_from(self.config.starting_balance_usdt).unwrap_or_default();
            starting + self.ledger.get_performance().net_profit
        };

        self.ledger.set_balance(balance);
        self.ledger.set_equity(balance + unrealized);
        self.ledger.set_market_status(true, self.adapter.is_connected());
    }

    /// The `scanAndLaunch` algorithm: slot/cooldown checks, candidate
    /// ranking, and per-candidate launch attempts.
    async fn scan_and_launch(self: &Arc<Self>) {
        {
            let inner = self.inner.lock().await;
            if inner.traders.len() >= self.config.max_traders {
                return;
            }
            if inner.loss_cooldown_until > Utc::now() {
                let remaining = (inner.loss_cooldown_until - Utc::now()).num_minutes();
                info!(remaining_minutes = remaining, "loss cooldown active, skipping scan");
                return;
            }
        }

        let candidates = match self.gather_candidates().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "scan: candidate gathering failed");
                return;
            }
        };

        if self.config.enable_trading_window {
            let hour = Utc::now().hour();
            if !self.config.is_within_trading_window(hour) {
                info!(hour, "trading window closed, skipping scan");
                return;
            }
        }

        let volatility_slots = self.config.volatility_slots();
        let grid_slots = self.config.grid_slots();

        let mut volatility_started = 0usize;
        let mut grid_started = 0usize;
        let mut volatility_failures = 0u32;
        let mut grid_failures = 0u32;

        for candidate in &candidates {
            let symbol = candidate.symbol.clone();

            {
                let inner = self.inner.lock().await;
                if inner.traders.contains_key(&symbol) {
                    continue;
                }
                if inner.leverage_blacklist.contains(&symbol) {
                    continue;
                }
                if let Some(rec) = inner.failed_symbols.get(&symbol) {
                    if rec.until > Utc::now() {
                        continue;
                    }
                }
            }

            let (current_volatility, current_grid) = {
                let inner = self.inner.lock().await;
                self.count_by_kind(&inner)
            };

            if current_volatility >= volatility_slots && current_grid >= grid_slots {
                break;
            }

            if self.config.is_live() {
                let already_set = self.inner.lock().await.leverage_set.contains(&symbol);
                if !already_set {
                    match self.adapter.set_leverage(&symbol, self.config.leverage).await {
                        Ok(()) => {
                            self.inner.lock().await.leverage_set.insert(symbol.clone());
                        }
                        Err(e) => {
                            warn!(symbol = %symbol, error = %e, "set_leverage failed, blacklisting");
                            self.inner.lock().await.leverage_blacklist.insert(symbol.clone());
                            continue;
                        }
                    }
                }
            }

            let prefer_volatility = current_volatility < volatility_slots;
            let kind = if prefer_volatility && volatility_failures < 3 {
                StrategyKind::Volatility
            } else if current_grid < grid_slots && grid_failures < 3 {
                StrategyKind::Grid
            } else {
                continue;
            };

            match self.start_trader(&symbol, kind).await {
                Ok(()) => match kind {
                    StrategyKind::Volatility => volatility_started += 1,
                    StrategyKind::Grid => grid_started += 1,
                },
                Err(e) => {
                    warn!(symbol = %symbol, strategy = ?kind, error = %e, "trader start failed");
                    match kind {
                        StrategyKind::Volatility => volatility_failures += 1,
                        StrategyKind::Grid => grid_failures += 1,
                    }
                    self.record_start_failure(&symbol).await;
                }
            }
        }

        if volatility_started + grid_started > 0 {
            info!(volatility_started, grid_started, "scan: launched new traders");
        }

        self.refresh_market_streams().await;
    }

    fn count_by_kind(&self, inner: &SupervisorInner) -> (usize, usize) {
        let volatility = inner
            .traders
            .values()
            .filter(|h| h.kind() == StrategyKind::Volatility)
            .count();
        let grid = inner.traders.len() - volatility;
        (volatility, grid)
    }

    async fn gather_candidates(&self) -> anyhow::Result<Vec<crate::scanner::ScanCandidate>> {
        let tickers = self
            .adapter
            .get_24h_tickers()
            .await
            .map_err(|e| anyhow::anyhow!("get_24h_tickers: {e}"))?;

        let blacklist = self.inner.lock().await.leverage_blacklist.clone();
        let mut inputs = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            let depth = self.adapter.get_depth(&ticker.symbol, 20).await.ok();
            let blacklisted = blacklist.contains(&ticker.symbol);
            // 16 x 15m candles = 4h of history: the tail 4 give 1h volume,
            // the high/low across all 16 give the 4h range.
            let klines = self.adapter.get_klines(&ticker.symbol, 16).await.unwrap_or_default();
            let volume_ratio = klines_volume_ratio(&klines, ticker.volume);
            let range_percent = klines_range_percent(&klines);
            inputs.push(CandidateInput {
                ticker,
                depth,
                volume_ratio,
                range_percent,
                blacklisted,
            });
        }

        let mut ranked = self.scanner.rank(&inputs, &self.config);
        ranked.truncate(self.config.max_traders);
        Ok(ranked)
    }

    async fn start_trader(self: &Arc<Self>, symbol: &str, kind: StrategyKind) -> Result<(), crate::error::StrategyError> {
        let id = format!("{}-{}-{}", kind_label(kind), symbol, Utc::now().timestamp_millis());
        let trader = Trader::new(id, symbol.to_string(), kind);
        let strategy: Arc<dyn TraderStrategy> = match kind {
            StrategyKind::Grid => Arc::new(GridStrategy),
            StrategyKind::Volatility => Arc::new(VolatilityStrategy),
        };
        let handle = Arc::new(TraderHandle::new(trader, strategy));
        handle.init(self.adapter.as_ref(), &self.config, &self.ledger).await?;

        self.inner.lock().await.traders.insert(symbol.to_string(), handle);
        info!(symbol, strategy = ?kind, "trader started");
        Ok(())
    }

    async fn record_start_failure(&self, symbol: &str) {
        let mut inner = self.inner.lock().await;
        let rec = inner.failed_symbols.entry(symbol.to_string()).or_insert(FailureRecord {
            count: 0,
            until: Utc::now(),
        });
        rec.count += 1;
        let minutes = match rec.count {
            1 => 5,
            2 => 15,
            _ => 60,
        };
        rec.until = Utc::now() + chrono::Duration::minutes(minutes);
    }

    async fn refresh_market_streams(&self) {
        let symbols: Vec<Symbol> = self.inner.lock().await.traders.keys().cloned().collect();
        if let Err(e) = self.adapter.update_symbols(&symbols).await {
            warn!(error = %e, "failed to refresh market stream subscription");
        }
    }

    /// Removes a terminated Trader, applies the global consecutive-loss
    /// cooldown, and refreshes the market-stream subscription.
    async fn destroy_trader(&self, symbol: &str, realized_pnl: Decimal) {
        {
            let mut inner = self.inner.lock().await;
            inner.traders.remove(symbol);

            if realized_pnl < Decimal::ZERO {
                inner.consecutive_losses += 1;
                let minutes = match inner.consecutive_losses {
                    0 | 1 => 0,
                    2 => 15,
                    3 => 30,
                    _ => 60,
                };
                if minutes > 0 {
                    inner.loss_cooldown_until = Utc::now() + chrono::Duration::minutes(minutes);
                }
            } else {
                inner.consecutive_losses = 0;
                inner.loss_cooldown_until = Utc::now();
            }
        }
        self.ledger.remove_trader(symbol);
        self.refresh_market_streams().await;
        info!(symbol, pnl = %realized_pnl, "trader terminated");
    }

    /// Subscribes to the Adapter's fanned-out event stream and dispatches
    /// every event to the owning Trader, reclaiming its slot and applying
    /// cooldowns once it goes terminal.
    async fn dispatch_events(self: Arc<Self>) {
        let mut rx = self.adapter.subscribe_events();
        loop {
            let event = match rx.recv().await {
                Ok(e) => e,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "supervisor event dispatch lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            self.dispatch_one(&event).await;
        }
    }

    async fn dispatch_one(&self, event: &MarketEvent) {
        let symbol = event.symbol().to_string();
        let handle = self.inner.lock().await.traders.get(&symbol).cloned();
        let Some(handle) = handle else { return };

        handle.handle_event(event, self.adapter.as_ref(), &self.config, &self.ledger).await;

        if handle.is_terminal().await {
            let snapshot = handle.snapshot().await;
            self.destroy_trader(&symbol, snapshot.realized_pnl).await;
        }
    }

    pub async fn active_trader_count(&self) -> usize {
        self.inner.lock().await.traders.len()
    }
}

fn kind_label(kind: StrategyKind) -> &'static str {
    match kind {
        StrategyKind::Grid => "grid",
        StrategyKind::Volatility => "vol",
    }
}

/// Last-4-candle (1h) volume over the 24h hourly average volume.
fn klines_volume_ratio(klines: &[Kline], volume_24h: f64) -> f64 {
    if volume_24h <= 0.0 {
        return 0.0;
    }
    let hourly_avg = volume_24h / 24.0;
    let one_hour_volume: Decimal = klines.iter().rev().take(4).map(|k| k.volume).sum();
    one_hour_volume.to_f64().unwrap_or(0.0) / hourly_avg
}

/// 4h high-low range as a percentage of the range's low.
fn klines_range_percent(klines: &[Kline]) -> f64 {
    let Some(high) = klines.iter().map(|k| k.high).max() else {
        return 0.0;
    };
    let Some(low) = klines.iter().map(|k| k.low).min() else {
        return 0.0;
    };
    if low.is_zero() {
        return 0.0;
    }
    ((high - low) / low * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod candidate_metrics_tests {
    use super::*;

    fn kline(high: f64, low: f64, volume: f64) -> Kline {
        Kline {
            open_time: 0,
            open: Decimal::try_from(low).unwrap(),
            high: Decimal::try_from(high).unwrap(),
            low: Decimal::try_from(low).unwrap(),
            close: Decimal::try_from(high).unwrap(),
            volume: Decimal::try_from(volume).unwrap(),
        }
    }

    #[test]
    fn volume_ratio_compares_last_hour_to_24h_hourly_average() {
        // 4 x 15m candles of volume 30 each = 120 over the last hour;
        // 24h hourly average of a 2400 total volume is 100, so ratio = 1.2.
        let klines = vec![kline(101.0, 99.0, 30.0); 16];
        assert!((klines_volume_ratio(&klines, 2400.0) - 1.2).abs() < 1e-9);
    }

    #[test]
    fn volume_ratio_is_zero_with_no_24h_volume() {
        assert_eq!(klines_volume_ratio(&[], 0.0), 0.0);
    }

    #[test]
    fn range_percent_spans_the_high_and_low_of_all_candles() {
        let mut klines = vec![kline(101.0, 99.0, 10.0); 15];
        klines.push(kline(110.0, 95.0, 10.0));
        let pct = klines_range_percent(&klines);
        assert!((pct - ((110.0 - 95.0) / 95.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn range_percent_is_zero_with_no_candles() {
        assert_eq!(klines_range_percent(&[]), 0.0);
    }
}
