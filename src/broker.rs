//! External collaborator contracts: market data, broker, and a paper broker
//! used for dry runs and tests.
//!
//! Fill results are `Option<OrderFill>`; `None` means "nothing executed"
//! and is never an error. Order sizing is an order *fraction* of free quote
//! cash, not an absolute quantity.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::timeframe::Timeframe;
use crate::types::{Balance, Candle, OrderFill, Symbol};

/// Venue session window. Only meaningful for session-gated venues; 24/7
/// venues report permanently open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketCalendar {
    pub is_open: bool,
    pub next_open: Option<DateTime<Utc>>,
    pub next_close: Option<DateTime<Utc>>,
}

/// Account snapshot: per-asset balances plus an optional venue-reported
/// equity figure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountSnapshot {
    pub balances: HashMap<String, Balance>,
    pub equity: Option<f64>,
}

/// Find an asset balance in an account snapshot; missing assets are zero.
pub fn find_balance(account: &AccountSnapshot, asset: &str) -> Balance {
    account.balances.get(asset).copied().unwrap_or_default()
}

/// Candle/quote/universe source for one venue.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Fetch up to `limit` most recent closed bars, oldest first.
    async fn get_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    /// Session window; 24/7 venues return an always-open calendar.
    async fn market_calendar(&self) -> Result<MarketCalendar> {
        Ok(MarketCalendar {
            is_open: true,
            next_open: None,
            next_close: None,
        })
    }

    /// Ordered set of tradable symbols, refreshed on an external cadence.
    async fn list_universe(&self) -> Result<Vec<Symbol>>;
}

/// Market-order execution against one account.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Latest observed price for a symbol. Simulated brokers fill against
    /// it; real brokers ignore the hint.
    async fn update_mark_price(&self, _symbol: &Symbol, _price: f64) {}

    /// Buy `order_fraction` of the free quote balance at market.
    /// `None` means nothing was executed (e.g. fraction or balance is zero).
    async fn buy_market(
        &self,
        symbol: &Symbol,
        quote: &str,
        order_fraction: f64,
    ) -> Result<Option<OrderFill>>;

    /// Sell the entire base balance of `symbol` at market.
    async fn sell_market_all(&self, symbol: &Symbol, quote: &str) -> Result<Option<OrderFill>>;

    async fn get_account(&self) -> Result<AccountSnapshot>;
}

#[derive(Debug, Default)]
struct PaperAccount {
    quote_free: f64,
    holdings: HashMap<Symbol, f64>,
    last_prices: HashMap<Symbol, f64>,
}

/// Simulated broker: fills at the last observed price against a simulated
/// quote balance. No slippage or fees; a fill is all-or-nothing.
pub struct PaperBroker {
    quote: String,
    account: Mutex<PaperAccount>,
}

impl PaperBroker {
    pub fn new(quote: impl Into<String>, starting_cash: f64) -> Self {
        PaperBroker {
            quote: quote.into(),
            account: Mutex::new(PaperAccount {
                quote_free: starting_cash,
                ..PaperAccount::default()
            }),
        }
    }

    /// Record the latest price used to fill market orders for `symbol`.
    pub async fn set_last_price(&self, symbol: &Symbol, price: f64) {
        let mut acct = self.account.lock().await;
        acct.last_prices.insert(symbol.clone(), price);
    }

    pub async fn free_cash(&self) -> f64 {
        self.account.lock().await.quote_free
    }

    pub async fn holding(&self, symbol: &Symbol) -> f64 {
        self.account
            .lock()
            .await
            .holdings
            .get(symbol)
            .copied()
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn update_mark_price(&self, symbol: &Symbol, price: f64) {
        self.set_last_price(symbol, price).await;
    }

    async fn buy_market(
        &self,
        symbol: &Symbol,
        _quote: &str,
        order_fraction: f64,
    ) -> Result<Option<OrderFill>> {
        if !(order_fraction > 0.0) {
            return Ok(None);
        }

        let mut acct = self.account.lock().await;
        let Some(&price) = acct.last_prices.get(symbol) else {
            return Ok(None);
        };
        if price <= 0.0 {
            return Ok(None);
        }

        let spend = acct.quote_free * order_fraction.min(1.0);
        if spend <= 0.0 {
            return Ok(None);
        }

        let qty = spend / price;
        acct.quote_free -= spend;
        *acct.holdings.entry(symbol.clone()).or_insert(0.0) += qty;

        info!(%symbol, qty, price, "[PAPER] buy filled");
        Ok(Some(OrderFill {
            executed_qty: qty,
            avg_price: price,
        }))
    }

    async fn sell_market_all(&self, symbol: &Symbol, _quote: &str) -> Result<Option<OrderFill>> {
        let mut acct = self.account.lock().await;
        let qty = acct.holdings.get(symbol).copied().unwrap_or(0.0);
        if qty <= 0.0 {
            return Ok(None);
        }
        let Some(&price) = acct.last_prices.get(symbol) else {
            return Ok(None);
        };

        acct.quote_free += qty * price;
        acct.holdings.remove(symbol);

        info!(%symbol, qty, price, "[PAPER] sell filled");
        Ok(Some(OrderFill {
            executed_qty: qty,
            avg_price: price,
        }))
    }

    async fn get_account(&self) -> Result<AccountSnapshot> {
        let acct = self.account.lock().await;
        let mut balances = HashMap::new();
        balances.insert(
            self.quote.clone(),
            Balance {
                free: acct.quote_free,
                locked: 0.0,
            },
        );
        for (symbol, qty) in &acct.holdings {
            balances.insert(
                symbol.as_str().to_string(),
                Balance {
                    free: *qty,
                    locked: 0.0,
                },
            );
        }

        let positions_value: f64 = acct
            .holdings
            .iter()
            .map(|(s, qty)| acct.last_prices.get(s).copied().unwrap_or(0.0) * qty)
            .sum();

        Ok(AccountSnapshot {
            equity: Some(acct.quote_free + positions_value),
            balances,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_fraction_is_noop() {
        let broker = PaperBroker::new("USDT", 1_000.0);
        let sym = Symbol::new("BTCUSDT");
        broker.set_last_price(&sym, 100.0).await;

        let fill = broker.buy_market(&sym, "USDT", 0.0).await.unwrap();
        assert!(fill.is_none());
        assert_eq!(broker.free_cash().await, 1_000.0);
    }

    #[tokio::test]
    async fn test_buy_then_sell_round_trip() {
        let broker = PaperBroker::new("USDT", 1_000.0);
        let sym = Symbol::new("BTCUSDT");
        broker.set_last_price(&sym, 100.0).await;

        let fill = broker.buy_market(&sym, "USDT", 0.5).await.unwrap().unwrap();
        assert_eq!(fill.executed_qty, 5.0);
        assert_eq!(broker.free_cash().await, 500.0);

        broker.set_last_price(&sym, 110.0).await;
        let fill = broker.sell_market_all(&sym, "USDT").await.unwrap().unwrap();
        assert_eq!(fill.executed_qty, 5.0);
        assert_eq!(fill.avg_price, 110.0);
        assert_eq!(broker.free_cash().await, 1_050.0);
        assert_eq!(broker.holding(&sym).await, 0.0);
    }

    #[tokio::test]
    async fn test_sell_without_holding_is_noop() {
        let broker = PaperBroker::new("USDT", 1_000.0);
        let sym = Symbol::new("ETHUSDT");
        let fill = broker.sell_market_all(&sym, "USDT").await.unwrap();
        assert!(fill.is_none());
    }

    #[tokio::test]
    async fn test_account_snapshot_equity() {
        let broker = PaperBroker::new("USDT", 1_000.0);
        let sym = Symbol::new("BTCUSDT");
        broker.set_last_price(&sym, 100.0).await;
        broker.buy_market(&sym, "USDT", 0.5).await.unwrap();

        let account = broker.get_account().await.unwrap();
        assert_eq!(account.equity, Some(1_000.0));
        assert_eq!(find_balance(&account, "USDT").free, 500.0);
        assert_eq!(find_balance(&account, "BTCUSDT").free, 5.0);
        assert_eq!(find_balance(&account, "XRPUSDT").free, 0.0);
    }
}
