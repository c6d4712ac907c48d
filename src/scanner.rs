//! Scanner contract: a pure ranking function over a 24h-ticker snapshot,
//! decoupled from the network fetch that produces it (the Adapter's
//! `get24hTickers`/`getExchangeInfo`).

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::EngineConfig;
use crate::models::{Depth, Symbol, Ticker24h};

/// Band around mid price, as a percentage, within which resting order-book
/// liquidity counts toward the depth filter.
const DEPTH_BAND_PERCENT: &str = "1";

#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub symbol: Symbol,
    pub score: f64,
    pub change_percent: f64,
    pub range_percent: f64,
}

/// Everything the scanner's filters need for one symbol, fetched/derived by
/// the caller ahead of time so this module stays pure/allocation-only.
#[derive(Debug, Clone)]
pub struct CandidateInput {
    pub ticker: Ticker24h,
    pub depth: Option<Depth>,
    /// 1h volume over the 24h hourly average volume.
    pub volume_ratio: f64,
    /// 4h high-low range as a percentage of the range's low.
    pub range_percent: f64,
    pub blacklisted: bool,
}

pub trait Scanner {
    /// Returns candidates in descending score order, already filtered.
    fn rank(&self, inputs: &[CandidateInput], config: &EngineConfig) -> Vec<ScanCandidate>;
}

/// The scanner implementation the Supervisor uses: filters on change%,
/// volume ratio, range%, spread, and depth-within-band, then scores survivors
/// by `|change| + rangePct`.
#[derive(Debug, Default)]
pub struct RankedScanner;

impl RankedScanner {
    fn passes_filters(input: &CandidateInput, config: &EngineConfig) -> bool {
        if input.blacklisted {
            return false;
        }
        if !config.enable_scanner_filters {
            return true;
        }

        let change_abs = input.ticker.price_change_percent.abs();
        if change_abs < config.min_change || change_abs > config.max_change {
            return false;
        }

        if input.ticker.volume <= 0.0 {
            return false;
        }

        if input.volume_ratio < config.volume_ratio {
            return false;
        }

        if input.range_percent < config.min_range_percent {
            return false;
        }

        let Some(depth) = &input.depth else {
            return false;
        };
        let (Some(bid), Some(ask)) = (depth.best_bid(), depth.best_ask()) else {
            return false;
        };
        let bid_f = bid.to_f64().unwrap_or(0.0);
        let ask_f = ask.to_f64().unwrap_or(0.0);
        if bid_f <= 0.0 || ask_f <= 0.0 {
            return false;
        }
        let mid = (bid + ask) / Decimal::TWO;
        let spread_pct = (ask_f - bid_f) / ((bid_f + ask_f) / 2.0) * 100.0;
        if spread_pct < config.spread_min || spread_pct > config.spread_max {
            return false;
        }

        let band: Decimal = DEPTH_BAND_PERCENT.parse().unwrap();
        let notional = depth.notional_within(mid, band).to_f64().unwrap_or(0.0);
        if notional < config.depth_min || notional > config.depth_max {
            return false;
        }

        true
    }
}

impl Scanner for RankedScanner {
    fn rank(&self, inputs: &[CandidateInput], config: &EngineConfig) -> Vec<ScanCandidate> {
        let mut candidates: Vec<ScanCandidate> = inputs
            .iter()
            .filter(|input| Self::passes_filters(input, config))
            .map(|input| {
                let change_percent = input.ticker.price_change_percent;
                ScanCandidate {
                    symbol: input.ticker.symbol.clone(),
                    score: change_percent.abs() + input.range_percent,
                    change_percent,
                    range_percent: input.range_percent,
                }
            })
            .collect();

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates
    }
}
