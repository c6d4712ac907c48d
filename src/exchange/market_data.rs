//! Shared, unauthenticated market-data client: read-only REST wrappers for
//! `getMarkPrice`, `getTickerPrice`, `get24hTickers`, `getExchangeInfo`,
//! `getKlines`, `getDepth`.
//!
//! Used by BOTH the live and simulator adapters: substituting a deterministic
//! simulator only concerns order routing, not price data, so there is a
//! single source of truth for prices regardless of `mode`. Includes the
//! `exchangeInfo` lot-filter cache (10-minute TTL).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::error::ExchangeError;
use crate::exchange::ExchangeResult;
use crate::models::{Depth, Kline, LotFilters, Ticker24h};

const EXCHANGE_INFO_TTL: Duration = Duration::from_secs(600);

fn map_transport_err(e: reqwest::Error) -> ExchangeError {
    ExchangeError::Transient(e.to_string())
}

async fn check_status(resp: reqwest::Response) -> ExchangeResult<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let code = resp.status().as_u16() as i32;
    let body = resp.text().await.unwrap_or_default();
    let (code, message) = parse_binance_error(&body).unwrap_or((code, body));
    Err(ExchangeError::Rejected { code, message })
}

/// Binance error bodies look like `{"code": -2011, "msg": "Unknown order"}`.
fn parse_binance_error(body: &str) -> Option<(i32, String)> {
    #[derive(Deserialize)]
    struct BinanceErr {
        code: i32,
        msg: String,
    }
    serde_json::from_str::<BinanceErr>(body)
        .ok()
        .map(|e| (e.code, e.msg))
}

#[derive(Debug, Deserialize)]
struct PremiumIndexResp {
    #[serde(rename = "markPrice")]
    mark_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct TickerPriceResp {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct Ticker24hResp {
    symbol: String,
    #[serde(rename = "priceChangePercent")]
    price_change_percent: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
    volume: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResp {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoSymbol {
    symbol: String,
    status: String,
    #[serde(rename = "contractType")]
    contract_type: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    filters: Vec<ExchangeInfoFilter>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoFilter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "tickSize")]
    tick_size: Option<Decimal>,
    #[serde(rename = "stepSize")]
    step_size: Option<Decimal>,
}

struct LotFilterCache {
    fetched_at: Instant,
    filters: HashMap<String, LotFilters>,
}

/// Unauthenticated Binance USDT-M Futures REST client.
#[derive(Debug)]
pub struct MarketDataClient {
    http: Client,
    base_rest_url: String,
    lot_cache: RwLock<Option<LotFilterCache>>,
}

impl MarketDataClient {
    pub fn new(base_rest_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_rest_url: base_rest_url.into(),
            lot_cache: RwLock::new(None),
        }
    }

    pub async fn get_mark_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_rest_url, symbol);
        let resp = self.http.get(&url).send().await.map_err(map_transport_err)?;
        let resp = check_status(resp).await?;
        let parsed: PremiumIndexResp = resp.json().await.map_err(map_transport_err)?;
        Ok(parsed.mark_price)
    }

    pub async fn get_ticker_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_rest_url, symbol);
        let resp = self.http.get(&url).send().await.map_err(map_transport_err)?;
        let resp = check_status(resp).await?;
        let parsed: TickerPriceResp = resp.json().await.map_err(map_transport_err)?;
        Ok(parsed.price)
    }

    pub async fn get_24h_tickers(&self) -> ExchangeResult<Vec<Ticker24h>> {
        let url = format!("{}/fapi/v1/ticker/24hr", self.base_rest_url);
        let resp = self.http.get(&url).send().await.map_err(map_transport_err)?;
        let resp = check_status(resp).await?;
        let parsed: Vec<Ticker24hResp> = resp.json().await.map_err(map_transport_err)?;
        Ok(parsed
            .into_iter()
            .filter_map(|t| {
                Some(Ticker24h {
                    symbol: t.symbol,
                    price_change_percent: t.price_change_percent.parse().ok()?,
                    quote_volume: t.quote_volume.parse().ok()?,
                    volume: t.volume.parse().ok()?,
                })
            })
            .collect())
    }

    /// Refreshes the `exchangeInfo` cache if older than 10 minutes, then
    /// returns the requested symbol's lot filters.
    pub async fn get_lot_filters(&self, symbol: &str) -> ExchangeResult<LotFilters> {
        let needs_refresh = {
            let cache = self.lot_cache.read();
            match cache.as_ref() {
                Some(c) => c.fetched_at.elapsed() > EXCHANGE_INFO_TTL,
                None => true,
            }
        };

        if needs_refresh {
            self.refresh_exchange_info().await?;
        }

        let cache = self.lot_cache.read();
        cache
            .as_ref()
            .and_then(|c| c.filters.get(symbol).copied())
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: format!("unknown symbol {symbol}"),
            })
    }

    async fn refresh_exchange_info(&self) -> ExchangeResult<()> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_rest_url);
        let resp = self.http.get(&url).send().await.map_err(map_transport_err)?;
        let resp = check_status(resp).await?;
        let parsed: ExchangeInfoResp = resp.json().await.map_err(map_transport_err)?;

        let mut filters = HashMap::new();
        for s in parsed.symbols {
            if s.status != "TRADING" || s.contract_type != "PERPETUAL" || s.quote_asset != "USDT" {
                continue;
            }
            let mut lot = LotFilters::default();
            for f in s.filters {
                match f.filter_type.as_str() {
                    "PRICE_FILTER" => {
                        if let Some(tick) = f.tick_size {
                            lot.tick_size = tick;
                        }
                    }
                    "LOT_SIZE" | "MARKET_LOT_SIZE" => {
                        if let Some(step) = f.step_size {
                            lot.step_size = step;
                        }
                    }
                    _ => {}
                }
            }
            filters.insert(s.symbol, lot);
        }

        debug!(count = filters.len(), "refreshed exchangeInfo lot filters");
        *self.lot_cache.write() = Some(LotFilterCache {
            fetched_at: Instant::now(),
            filters,
        });
        Ok(())
    }

    pub async fn get_klines(&self, symbol: &str, limit: u32) -> ExchangeResult<Vec<Kline>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval=15m&limit={}",
            self.base_rest_url, symbol, limit
        );
        let resp = self.http.get(&url).send().await.map_err(map_transport_err)?;
        let resp = check_status(resp).await?;
        let raw: Vec<Vec<serde_json::Value>> = resp.json().await.map_err(map_transport_err)?;

        let parse_dec = |v: &serde_json::Value| -> Decimal {
            v.as_str().and_then(|s| s.parse().ok()).unwrap_or_default()
        };

        Ok(raw
            .into_iter()
            .filter_map(|row| {
                Some(Kline {
                    open_time: row.first()?.as_i64()?,
                    open: parse_dec(row.get(1)?),
                    high: parse_dec(row.get(2)?),
                    low: parse_dec(row.get(3)?),
                    close: parse_dec(row.get(4)?),
                    volume: parse_dec(row.get(5)?),
                })
            })
            .collect())
    }

    pub async fn get_depth(&self, symbol: &str, limit: u32) -> ExchangeResult<Depth> {
        let url = format!("{}/fapi/v1/depth?symbol={}&limit={}", self.base_rest_url, symbol, limit);
        let resp = self.http.get(&url).send().await.map_err(map_transport_err)?;
        let resp = check_status(resp).await?;

        #[derive(Deserialize)]
        struct RawDepth {
            bids: Vec<(String, String)>,
            asks: Vec<(String, String)>,
        }
        let raw: RawDepth = resp.json().await.map_err(map_transport_err)?;

        let to_levels = |levels: Vec<(String, String)>| -> Vec<(Decimal, Decimal)> {
            levels
                .into_iter()
                .filter_map(|(p, q)| Some((p.parse().ok()?, q.parse().ok()?)))
                .collect()
        };

        Ok(Depth {
            bids: to_levels(raw.bids),
            asks: to_levels(raw.asks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binance_error_body() {
        let body = r#"{"code":-2011,"msg":"Unknown order sent."}"#;
        let (code, msg) = parse_binance_error(body).unwrap();
        assert_eq!(code, -2011);
        assert_eq!(msg, "Unknown order sent.");
    }

    #[test]
    fn malformed_error_body_returns_none() {
        assert!(parse_binance_error("not json").is_none());
    }
}
