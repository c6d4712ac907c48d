//! Perpetual-futures trading engine: Grid/Volatility Trader lifecycle
//! manager over a Binance-USDM-shaped Exchange Adapter.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod scanner;
pub mod strategy;
pub mod supervisor;
