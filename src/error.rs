//! Typed errors for the decision engine.
//!
//! Everything here degrades to "skip this symbol/cycle" at the caller; none
//! of these variants is allowed to terminate the process.

use thiserror::Error;

use crate::types::Symbol;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{symbol}: not enough candles (have {have}, need {need})")]
    InsufficientData {
        symbol: Symbol,
        have: usize,
        need: usize,
    },

    #[error("unknown strategy id {0}")]
    UnknownStrategyId(u32),

    #[error("unknown exit preset id {0}")]
    UnknownExitPresetId(u32),

    #[error("{symbol}: market data error: {source}")]
    MarketData {
        symbol: Symbol,
        #[source]
        source: anyhow::Error,
    },

    #[error("{symbol}: broker error: {source}")]
    Broker {
        symbol: Symbol,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("state persistence error: {0}")]
    State(#[from] std::io::Error),
}
