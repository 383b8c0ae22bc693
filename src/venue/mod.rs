//! Venue clients. Only public market-data endpoints live here; order
//! execution goes through the abstract broker contract.

pub mod binance;

pub use binance::BinanceMarketData;
