//! Binance-style public market-data client.
//!
//! No API key required: klines and 24h tickers are public endpoints. All
//! requests carry a bounded timeout and transient failures (HTTP 418/429,
//! 5xx, network errors) are retried a fixed number of times with
//! exponential backoff before the error surfaces to the engine, which
//! isolates it at the symbol boundary.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::MarketData;
use crate::timeframe::Timeframe;
use crate::types::{Candle, Symbol};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// Universe filters: leveraged-token suffixes and bases that are not real
/// trading candidates.
const EXCLUDE_KEYWORDS: &[&str] = &["UP", "DOWN", "BULL", "BEAR", "2L", "2S", "3L", "3S"];
const STABLE_BASES: &[&str] = &["USDC", "FDUSD", "TUSD", "USDP", "DAI", "BUSD"];

#[derive(Debug, Clone)]
pub struct BinanceMarketData {
    client: Client,
    base_url: String,
    quote: String,
    max_symbols: usize,
}

#[derive(Debug, Deserialize)]
struct Ticker24h {
    symbol: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
}

impl BinanceMarketData {
    pub fn new(quote: impl Into<String>, max_symbols: usize) -> Self {
        let base_url =
            std::env::var("BINANCE_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        BinanceMarketData {
            client,
            base_url,
            quote: quote.into(),
            max_symbols,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// GET with bounded retry on transient failures.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;

        loop {
            let result = self.client.get(&url).query(params).send().await;

            let retryable = match &result {
                Ok(resp) => {
                    let status = resp.status();
                    status.as_u16() == 429 || status.as_u16() == 418 || status.is_server_error()
                }
                Err(e) => e.is_timeout() || e.is_connect(),
            };

            if retryable && attempt < MAX_RETRIES {
                attempt += 1;
                let backoff = Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(attempt - 1));
                warn!(url = %url, attempt, "transient venue error, backing off");
                tokio::time::sleep(backoff).await;
                continue;
            }

            let resp = result.context("venue request failed")?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("venue API error {}: {}", status, body);
            }
            return resp.json::<T>().await.context("venue response parse failed");
        }
    }

    fn parse_kline(raw: &[serde_json::Value]) -> Option<Candle> {
        if raw.len() < 6 {
            return None;
        }
        Some(Candle {
            open_time: DateTime::from_timestamp_millis(raw[0].as_i64()?)?,
            open: raw[1].as_str()?.parse().ok()?,
            high: raw[2].as_str()?.parse().ok()?,
            low: raw[3].as_str()?.parse().ok()?,
            close: raw[4].as_str()?.parse().ok()?,
            volume: raw[5].as_str()?.parse().ok()?,
        })
    }

    fn universe_candidate(&self, symbol: &str) -> bool {
        let Some(base) = symbol.strip_suffix(self.quote.as_str()) else {
            return false;
        };
        if base.is_empty() || STABLE_BASES.contains(&base) {
            return false;
        }
        !EXCLUDE_KEYWORDS.iter().any(|kw| base.contains(kw))
    }
}

#[async_trait]
impl MarketData for BinanceMarketData {
    async fn get_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let params = [
            ("symbol", symbol.as_str().to_string()),
            ("interval", timeframe.as_str().to_string()),
            ("limit", limit.to_string()),
        ];

        debug!(%symbol, timeframe = %timeframe, limit, "fetching klines");
        let raw: Vec<Vec<serde_json::Value>> = self.get_json("/api/v3/klines", &params).await?;

        let mut candles: Vec<Candle> = raw.iter().filter_map(|r| Self::parse_kline(r)).collect();
        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    /// Top quote-volume symbols for the configured quote asset, filtered to
    /// real trading candidates.
    async fn list_universe(&self) -> Result<Vec<Symbol>> {
        let tickers: Vec<Ticker24h> = self.get_json("/api/v3/ticker/24hr", &[]).await?;

        let mut candidates: Vec<(String, f64)> = tickers
            .into_iter()
            .filter(|t| self.universe_candidate(&t.symbol))
            .filter_map(|t| {
                let volume: f64 = t.quote_volume.parse().ok()?;
                Some((t.symbol, volume))
            })
            .collect();

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(candidates
            .into_iter()
            .take(self.max_symbols)
            .map(|(symbol, _)| Symbol::new(symbol))
            .collect())
    }
}
