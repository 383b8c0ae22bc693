//! Regime-driven automated trading engine.
//!
//! The decision core classifies market conditions with a multi-rule regime
//! detector (plus a hysteresis lock), maps regimes to entry/exit preset
//! packs, runs a per-symbol position lifecycle state machine and allocates
//! capital across risk-segmented layers with drawdown-based pausing and a
//! portfolio-wide circuit breaker.
//!
//! Venue specifics stay behind narrow contracts: [`broker::MarketData`] for
//! candles/universe/session data and [`broker::Broker`] for market orders.
//! A simulated [`broker::PaperBroker`] and a public-data Binance client are
//! bundled.
//!
//! ```no_run
//! use regime_trader::regime::engine::{detect_market_regime, RegimeSettings};
//! use regime_trader::broker::MarketData;
//! use regime_trader::timeframe::Timeframe;
//! use regime_trader::types::Symbol;
//! use regime_trader::venue::BinanceMarketData;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let data = BinanceMarketData::new("USDT", 10);
//!     let candles = data
//!         .get_bars(&Symbol::new("BTCUSDT"), Timeframe::M15, 250)
//!         .await?;
//!     let detection = detect_market_regime(&candles, &RegimeSettings::default());
//!     println!("{} ({:.2})", detection.regime, detection.confidence);
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod history;
pub mod indicators;
pub mod portfolio;
pub mod presets;
pub mod regime;
pub mod risk;
pub mod state;
pub mod timeframe;
pub mod types;
pub mod venue;

pub use config::Config;
pub use error::EngineError;
pub use types::{Candle, OrderFill, Position, Side, Symbol, TradeRecord};
