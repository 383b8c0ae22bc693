//! Core data types used across the trading engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV candlestick data for one closed bar.
///
/// Series are ordered oldest first, one entry per bar of a fixed timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Absolute body size (|close - open|)
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// Red candle: close below open
    pub fn is_red(&self) -> bool {
        self.close < self.open
    }
}

/// Trading pair symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction. The engine only opens long positions; `Side` keeps trade
/// records and broker calls explicit about direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

/// Stop model of an open position.
///
/// The percentage model derives its trailing stop from `max_price` each
/// cycle and needs no extra state. The ATR model freezes its anchors (entry
/// ATR, R, initial stop) on the first evaluation after the fill; until then
/// it is `AtrPending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum StopState {
    Percent,
    AtrPending,
    Atr(AtrAnchors),
}

/// ATR stop anchors, frozen at the first post-entry evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrAnchors {
    /// ATR at entry time
    pub entry_atr: f64,
    /// One risk unit: entry_atr * initial_atr_mult
    pub entry_r: f64,
    /// Absolute initial stop: entry - entry_r
    pub initial_stop: f64,
    /// Highest trailing stop reached so far, once armed
    pub trailing_stop: Option<f64>,
}

/// An open long position and its attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub entry_price: f64,
    pub qty: f64,
    /// Highest close observed since entry
    pub max_price: f64,
    pub layer_id: Option<String>,
    pub strategy_id: Option<u32>,
    pub entry_preset_id: Option<String>,
    pub exit_preset_id: Option<u32>,
    pub risk_allocated_usd: Option<f64>,
    pub opened_at: DateTime<Utc>,
    /// Open time of the bar the entry was taken on
    pub entry_bar_ts: DateTime<Utc>,
    /// Breakout level recorded by breakout entries, for invalidation checks
    pub breakout_level: Option<f64>,
    pub stop: StopState,
}

/// Per-symbol lifecycle record owned by the state machine.
///
/// `last_evaluated_at` tracks the most recent bar this symbol was evaluated
/// on, flat or not, so each closed bar is processed at most once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub position: Option<OpenPosition>,
}

impl Position {
    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    /// Notional value at the given price, 0.0 when flat
    pub fn exposure_at(&self, price: f64) -> f64 {
        self.position.as_ref().map_or(0.0, |p| p.qty * price)
    }
}

/// Completed trade record with layer/strategy attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: Symbol,
    pub side: Side,
    pub entry: f64,
    pub exit: f64,
    pub qty: f64,
    pub pnl_value: f64,
    pub pnl_pct: f64,
    pub layer_id: Option<String>,
    pub strategy_id: Option<u32>,
    pub entry_preset_id: Option<String>,
    pub exit_preset_id: Option<u32>,
    pub time: DateTime<Utc>,
}

/// Result of a filled market order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub executed_qty: f64,
    pub avg_price: f64,
}

/// Asset balance as reported by the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub locked: f64,
}

impl Balance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}
