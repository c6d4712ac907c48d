//! Typed error surface for the trading engine.
//!
//! Library code (exchange adapters, strategies, ledger, supervisor) returns
//! [`ExchangeError`]/[`StrategyError`] so callers can match on the
//! exchange-rejection table instead of parsing strings. Binary/application
//! glue uses `anyhow::Result` with `.context(...)`.

use thiserror::Error;

/// Errors surfaced by the Exchange Adapter.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// REST timeout, websocket drop, parse error. Recovered locally by the
    /// adapter's reconnect/watchdog logic; surfaced only as a market-status
    /// transition.
    #[error("transient network error: {0}")]
    Transient(String),

    /// A `-xxxx` exchange error code. `-2011` (unknown order) on cancel is
    /// translated to a success by the caller, not represented here.
    #[error("exchange rejected request ({code}): {message}")]
    Rejected { code: i32, message: String },

    /// A precondition the caller violated (e.g. requesting a market order
    /// through the algo-order endpoint). Never produced by network activity.
    #[error("programmer error: {0}")]
    Programmer(String),
}

impl ExchangeError {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExchangeError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// `-2011`: "unknown order" — cancel callers must treat this as success.
    pub fn is_unknown_order(&self) -> bool {
        self.code() == Some(-2011)
    }

    /// `-2021`: "would immediately trigger" — SL placement callers close at
    /// market instead of surfacing the error.
    pub fn is_would_immediately_trigger(&self) -> bool {
        self.code() == Some(-2021)
    }
}

/// Errors a Trader's strategy state machine can hit outside normal exits.
#[derive(Debug, Clone, Error)]
pub enum StrategyError {
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// SL cancellation/rejection while a position is open: the position must
    /// never be left unprotected.
    #[error("stop-loss became unsafe for position {position_id}")]
    SlUnsafe { position_id: String },

    /// Trader construction failed during startup.
    #[error("trader startup failed for {symbol}: {reason}")]
    Startup { symbol: String, reason: String },
}
