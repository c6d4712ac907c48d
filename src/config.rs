//! Engine configuration, loaded from the environment.
//!
//! `dotenv().ok()` once, then `env::var` with a parsed, clamped default for
//! every field so the engine runs in `TEST` mode out of the box.

use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Test,
    Live,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: RunMode,
    pub api_key: String,
    pub api_secret: String,
    pub base_rest_url: String,
    pub base_ws_url: String,
    pub recv_window_ms: u64,

    pub max_traders: usize,
    pub leverage: u32,
    pub starting_balance_usdt: f64,
    pub equity_fraction: f64,
    pub position_notional_usdt: f64,
    pub volatility_position_notional_usdt: f64,

    pub level_spacing_percent: f64,
    pub take_profit_percent: f64,
    pub stop_loss_percent: f64,
    pub volatility_take_profit_percent: f64,
    pub volatility_stop_loss_percent: f64,

    pub fee_rate: f64,
    pub slippage_rate: f64,

    pub scanner_interval_ms: u64,
    pub enable_scanner_filters: bool,
    pub enable_trading_window: bool,
    /// `[trading_window_start_hour, trading_window_end_hour)` UTC. Hard-coded
    /// to `[3, 9)` upstream; parameterised here per the spec's own open
    /// question (see DESIGN.md).
    pub trading_window_start_hour: u32,
    pub trading_window_end_hour: u32,
    pub min_change: f64,
    pub max_change: f64,
    pub volume_ratio: f64,
    pub min_range_percent: f64,
    pub depth_min: f64,
    pub depth_max: f64,
    pub spread_min: f64,
    pub spread_max: f64,

    pub dashboard_port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load every configuration field from the environment, with documented
    /// defaults that make `TEST` mode runnable with zero config.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mode = match env::var("MODE").unwrap_or_else(|_| "test".to_string()).to_lowercase().as_str() {
            "live" => RunMode::Live,
            _ => RunMode::Test,
        };

        Self {
            mode,
            api_key: env::var("API_KEY").unwrap_or_default(),
            api_secret: env::var("API_SECRET").unwrap_or_default(),
            base_rest_url: env::var("BASE_REST_URL")
                .unwrap_or_else(|_| "https://fapi.binance.com".to_string()),
            base_ws_url: env::var("BASE_WS_URL")
                .unwrap_or_else(|_| "wss://fstream.binance.com".to_string()),
            recv_window_ms: env_parse("RECV_WINDOW_MS", 5_000),

            max_traders: env_parse("MAX_TRADERS", 6),
            leverage: env_parse("LEVERAGE", 5),
            starting_balance_usdt: env_parse("STARTING_BALANCE_USDT", 1_000.0),
            equity_fraction: env_parse("EQUITY_FRACTION", 0.5),
            position_notional_usdt: env_parse("POSITION_NOTIONAL_USDT", 100.0),
            volatility_position_notional_usdt: env_parse(
                "VOLATILITY_POSITION_NOTIONAL_USDT",
                100.0,
            ),

            level_spacing_percent: env_parse("LEVEL_SPACING_PERCENT", 1.0),
            take_profit_percent: env_parse("TAKE_PROFIT_PERCENT", 1.0),
            stop_loss_percent: env_parse("STOP_LOSS_PERCENT", 1.0),
            volatility_take_profit_percent: env_parse("VOLATILITY_TAKE_PROFIT_PERCENT", 3.0),
            volatility_stop_loss_percent: env_parse("VOLATILITY_STOP_LOSS_PERCENT", 6.0),

            fee_rate: env_parse("FEE_RATE", 0.0004),
            slippage_rate: env_parse("SLIPPAGE_RATE", 0.0002),

            scanner_interval_ms: env_parse("SCANNER_INTERVAL_MS", 30_000),
            enable_scanner_filters: env_bool("ENABLE_SCANNER_FILTERS", true),
            enable_trading_window: env_bool("ENABLE_TRADING_WINDOW", false),
            trading_window_start_hour: env_parse("TRADING_WINDOW_START_HOUR", 3),
            trading_window_end_hour: env_parse("TRADING_WINDOW_END_HOUR", 9),
            min_change: env_parse("MIN_CHANGE", 3.0),
            max_change: env_parse("MAX_CHANGE", 30.0),
            volume_ratio: env_parse("VOLUME_RATIO", 1.2),
            min_range_percent: env_parse("MIN_RANGE_PERCENT", 2.0),
            depth_min: env_parse("DEPTH_MIN", 10_000.0),
            depth_max: env_parse("DEPTH_MAX", 50_000_000.0),
            spread_min: env_parse("SPREAD_MIN", 0.0),
            spread_max: env_parse("SPREAD_MAX", 0.15),

            dashboard_port: env_parse("DASHBOARD_PORT", 3000),
        }
    }

    pub fn is_live(&self) -> bool {
        self.mode == RunMode::Live
    }

    /// `volatilitySlots = floor(maxTraders / 2)`.
    pub fn volatility_slots(&self) -> usize {
        self.max_traders / 2
    }

    /// `expansionSlots = maxTraders - volatilitySlots` (the Grid share).
    pub fn grid_slots(&self) -> usize {
        self.max_traders - self.volatility_slots()
    }

    /// Whether `utc_hour` falls in `[trading_window_start_hour,
    /// trading_window_end_hour)`. Only consulted when `enable_trading_window`
    /// is set.
    pub fn is_within_trading_window(&self, utc_hour: u32) -> bool {
        utc_hour >= self.trading_window_start_hour && utc_hour < self.trading_window_end_hour
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable_with_zero_env() {
        let cfg = EngineConfig {
            mode: RunMode::Test,
            api_key: String::new(),
            api_secret: String::new(),
            base_rest_url: "https://fapi.binance.com".into(),
            base_ws_url: "wss://fstream.binance.com".into(),
            recv_window_ms: 5000,
            max_traders: 6,
            leverage: 5,
            starting_balance_usdt: 1000.0,
            equity_fraction: 0.5,
            position_notional_usdt: 100.0,
            volatility_position_notional_usdt: 100.0,
            level_spacing_percent: 1.0,
            take_profit_percent: 1.0,
            stop_loss_percent: 1.0,
            volatility_take_profit_percent: 3.0,
            volatility_stop_loss_percent: 6.0,
            fee_rate: 0.0004,
            slippage_rate: 0.0002,
            scanner_interval_ms: 30_000,
            enable_scanner_filters: true,
            enable_trading_window: false,
            trading_window_start_hour: 3,
            trading_window_end_hour: 9,
            min_change: 3.0,
            max_change: 30.0,
            volume_ratio: 1.2,
            min_range_percent: 2.0,
            depth_min: 10_000.0,
            depth_max: 50_000_000.0,
            spread_min: 0.0,
            spread_max: 0.15,
            dashboard_port: 3000,
        };
        assert!(!cfg.is_live());
        assert_eq!(cfg.volatility_slots(), 3);
        assert_eq!(cfg.grid_slots(), 3);
    }

    #[test]
    fn slot_split_favors_grid_on_odd_max_traders() {
        let mut cfg = EngineConfig::from_env();
        cfg.max_traders = 5;
        assert_eq!(cfg.volatility_slots(), 2);
        assert_eq!(cfg.grid_slots(), 3);
    }
}
