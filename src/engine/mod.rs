//! Per-symbol position lifecycle state machine.
//!
//! FLAT -> (entry conditions met, gate allows) -> OPEN -> (exit confirmed)
//! -> FLAT. One [`Position`] record per symbol; a symbol is evaluated at
//! most once per fully-closed bar. Every failure is isolated at the symbol
//! boundary: the caller logs the error and moves on to the next symbol.

pub mod entry;
pub mod exit;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::broker::{Broker, MarketData};
use crate::engine::entry::evaluate_entry;
use crate::engine::exit::{evaluate_exit, ExitDecision};
use crate::error::EngineError;
use crate::history::TradeHistory;
use crate::presets::entry::{resolve_entry_preset, ResolvedEntryPreset};
use crate::presets::exit::{AtrExitParams, ExitParams};
use crate::timeframe::{should_evaluate, Timeframe};
use crate::types::{Candle, OpenPosition, Position, Side, StopState, Symbol, TradeRecord};

/// Per-cycle options for one symbol evaluation, assembled by the
/// orchestrator from the regime pack, the trading plan and the runtime
/// config.
#[derive(Debug, Clone)]
pub struct CycleOptions {
    /// Entries permitted this cycle (regime gate, layer gate, session gate)
    pub allow_entries: bool,
    /// Fraction of free quote cash the buy call may spend
    pub order_fraction: f64,
    pub layer_id: Option<String>,
    pub strategy_id: u32,
    /// Layer-resolved preset; when absent the strategy id goes through the
    /// entry registry
    pub entry_override: Option<ResolvedEntryPreset>,
    pub exit_preset_id: Option<u32>,
    pub exit_params: ExitParams,
    /// ATR stop model parameters when the exit preset is ATR-based
    pub atr_exit: Option<AtrExitParams>,
    pub timeframe: Timeframe,
    pub risk_allocated_usd: Option<f64>,
    /// Global no-trade switch: skip the symbol entirely
    pub kill_switch: bool,
    /// Manual liquidation: force exits regardless of the candle gate
    pub sell_all: bool,
}

/// One market's engine: data/broker handles plus the market-level constants
/// the state machine needs.
pub struct MarketEngine<'a, D, B> {
    pub data: &'a D,
    pub broker: &'a B,
    pub history: &'a TradeHistory,
    pub quote: &'a str,
    pub klines_limit: usize,
    pub fast_ma: usize,
    pub slow_ma: usize,
}

impl<'a, D: MarketData, B: Broker> MarketEngine<'a, D, B> {
    /// Evaluate one symbol for one cycle. Mutates the position record in
    /// place and records any completed trade.
    pub async fn run_symbol(
        &self,
        symbol: &Symbol,
        position: &mut Position,
        last_prices: &mut HashMap<Symbol, f64>,
        opts: &CycleOptions,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let preset = match &opts.entry_override {
            Some(p) => p.clone(),
            None => resolve_entry_preset(opts.strategy_id, self.fast_ma, self.slow_ma)
                .ok_or(EngineError::UnknownStrategyId(opts.strategy_id))?,
        };

        let candles = self
            .data
            .get_bars(symbol, opts.timeframe, self.klines_limit)
            .await
            .map_err(|source| EngineError::MarketData {
                symbol: symbol.clone(),
                source,
            })?;

        let min_required = required_candles(&preset, opts.atr_exit.as_ref());
        if candles.len() < min_required {
            debug!(
                %symbol,
                have = candles.len(),
                need = min_required,
                "not enough candles, skipping"
            );
            return Ok(());
        }

        let Some(last) = candles.last() else {
            return Ok(());
        };
        last_prices.insert(symbol.clone(), last.close);
        self.broker.update_mark_price(symbol, last.close).await;

        if !should_evaluate(&candles, position, opts.timeframe, now) {
            return Ok(());
        }

        if opts.kill_switch {
            debug!(%symbol, "kill switch on, no trades");
            return Ok(());
        }

        if position.has_position() {
            self.handle_exit(symbol, position, &candles, opts).await?;
        }

        if opts.allow_entries && !position.has_position() {
            let signal = evaluate_entry(&candles, &preset.preset);
            if signal.enter {
                info!(
                    %symbol,
                    strategy = opts.strategy_id,
                    preset = %preset.id,
                    "entry signal"
                );

                let fill = self
                    .broker
                    .buy_market(symbol, self.quote, opts.order_fraction)
                    .await
                    .map_err(|source| EngineError::Broker {
                        symbol: symbol.clone(),
                        source,
                    })?;

                if let Some(fill) = fill.filter(|f| f.executed_qty > 0.0) {
                    let stop = if opts.atr_exit.is_some() {
                        StopState::AtrPending
                    } else {
                        StopState::Percent
                    };
                    position.position = Some(OpenPosition {
                        entry_price: fill.avg_price,
                        qty: fill.executed_qty,
                        max_price: fill.avg_price,
                        layer_id: opts.layer_id.clone(),
                        strategy_id: Some(opts.strategy_id),
                        entry_preset_id: Some(preset.id.clone()),
                        exit_preset_id: opts.exit_preset_id,
                        risk_allocated_usd: opts.risk_allocated_usd,
                        opened_at: now,
                        entry_bar_ts: last.open_time,
                        breakout_level: signal.breakout_level,
                        stop,
                    });
                    info!(
                        %symbol,
                        qty = fill.executed_qty,
                        price = fill.avg_price,
                        layer = opts.layer_id.as_deref().unwrap_or("-"),
                        "long opened"
                    );
                }
            } else {
                debug!(%symbol, strategy = opts.strategy_id, "entry conditions not met");
            }
        }

        position.last_evaluated_at = Some(last.open_time);
        Ok(())
    }

    async fn handle_exit(
        &self,
        symbol: &Symbol,
        position: &mut Position,
        candles: &[Candle],
        opts: &CycleOptions,
    ) -> Result<(), EngineError> {
        let Some(open) = position.position.as_mut() else {
            return Ok(());
        };

        let decision = evaluate_exit(
            open,
            candles,
            &opts.exit_params,
            opts.atr_exit.as_ref(),
            opts.sell_all,
        );

        let forced = match decision {
            ExitDecision::Exit { forced } => forced,
            ExitDecision::Hold { raw_blocked } => {
                if raw_blocked {
                    info!(%symbol, "stop/target hit but candle gate holds");
                }
                return Ok(());
            }
        };

        info!(%symbol, forced, "exit signal");

        let fill = self
            .broker
            .sell_market_all(symbol, self.quote)
            .await
            .map_err(|source| EngineError::Broker {
                symbol: symbol.clone(),
                source,
            })?;

        let Some(fill) = fill else {
            // Nothing executed; keep holding
            return Ok(());
        };

        let entry = open.entry_price;
        let qty = if open.qty > 0.0 {
            open.qty
        } else {
            fill.executed_qty
        };

        if qty > 0.0 && entry > 0.0 {
            let exit_price = fill.avg_price;
            let pnl_value = (exit_price - entry) * qty;
            let pnl_pct = (exit_price - entry) / entry * 100.0;
            self.history.add_trade(TradeRecord {
                symbol: symbol.clone(),
                side: Side::Long,
                entry,
                exit: exit_price,
                qty,
                pnl_value,
                pnl_pct,
                layer_id: open.layer_id.clone(),
                strategy_id: open.strategy_id,
                entry_preset_id: open.entry_preset_id.clone(),
                exit_preset_id: open.exit_preset_id,
                time: Utc::now(),
            });
        }

        info!(%symbol, price = fill.avg_price, "long closed");
        position.position = None;
        Ok(())
    }
}

/// History required before a symbol can be evaluated: the entry preset's
/// requirement plus anything the ATR exit model references.
fn required_candles(preset: &ResolvedEntryPreset, atr_exit: Option<&AtrExitParams>) -> usize {
    let mut need = preset.min_candles;
    if let Some(atr) = atr_exit {
        need = need
            .max(atr.atr_period + 1)
            .max(atr.trend_exit_fast_ema.unwrap_or(0))
            .max(atr.trend_exit_slow_ema.unwrap_or(0));
    }
    need
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::presets::entry::{EntryPreset, GoldenCrossParams};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use tokio::sync::Mutex;

    /// Scripted market data: serves a fixed series per symbol.
    struct ScriptedData {
        series: Mutex<HashMap<Symbol, Vec<Candle>>>,
    }

    impl ScriptedData {
        fn new() -> Self {
            ScriptedData {
                series: Mutex::new(HashMap::new()),
            }
        }

        async fn set(&self, symbol: &Symbol, candles: Vec<Candle>) {
            self.series.lock().await.insert(symbol.clone(), candles);
        }
    }

    #[async_trait]
    impl MarketData for ScriptedData {
        async fn get_bars(
            &self,
            symbol: &Symbol,
            _timeframe: Timeframe,
            _limit: usize,
        ) -> Result<Vec<Candle>> {
            Ok(self
                .series
                .lock()
                .await
                .get(symbol)
                .cloned()
                .unwrap_or_default())
        }

        async fn list_universe(&self) -> Result<Vec<Symbol>> {
            Ok(self.series.lock().await.keys().cloned().collect())
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn mk(i: usize, price: f64) -> Candle {
        Candle {
            open_time: start() + Duration::minutes(15 * i as i64),
            open: price,
            high: price + 0.1,
            low: price - 0.1,
            close: price,
            volume: 1_000.0,
        }
    }

    fn golden_cross_series() -> Vec<Candle> {
        // Declines, then a spike that crosses SMA3 over SMA6 on the last bar
        [10.0, 9.8, 9.6, 9.4, 9.2, 9.0, 8.8, 8.6, 8.4, 8.2, 13.0]
            .iter()
            .enumerate()
            .map(|(i, &p)| mk(i, p))
            .collect()
    }

    fn options() -> CycleOptions {
        CycleOptions {
            allow_entries: true,
            order_fraction: 0.5,
            layer_id: None,
            strategy_id: 1,
            entry_override: Some(ResolvedEntryPreset {
                id: "L1".to_string(),
                name: "Legacy Golden Cross".to_string(),
                preset: EntryPreset::GoldenCross(GoldenCrossParams {
                    ma_fast_period: 3,
                    ma_slow_period: 6,
                }),
                min_candles: 6,
            }),
            exit_preset_id: None,
            exit_params: ExitParams {
                sl_pct: 0.012,
                tp_pct: 0.024,
                trail_start_pct: 0.012,
                trail_distance_pct: 0.006,
                candle_exit_enabled: false,
                candle_red_trigger_pct: 0.4,
            },
            atr_exit: None,
            timeframe: Timeframe::M15,
            risk_allocated_usd: None,
            kill_switch: false,
            sell_all: false,
        }
    }

    #[tokio::test]
    async fn test_entry_opens_position_and_marks_bar() {
        let sym = Symbol::new("BTCUSDT");
        let data = ScriptedData::new();
        let candles = golden_cross_series();
        let last_bar = candles.last().unwrap().open_time;
        data.set(&sym, candles).await;

        let broker = PaperBroker::new("USDT", 1_000.0);
        broker.set_last_price(&sym, 13.0).await;
        let history = TradeHistory::ephemeral();
        let engine = MarketEngine {
            data: &data,
            broker: &broker,
            history: &history,
            quote: "USDT",
            klines_limit: 250,
            fast_ma: 3,
            slow_ma: 6,
        };

        let mut position = Position::default();
        let mut prices = HashMap::new();
        let now = last_bar + Duration::hours(1);

        engine
            .run_symbol(&sym, &mut position, &mut prices, &options(), now)
            .await
            .unwrap();

        let open = position.position.as_ref().expect("position should open");
        assert_eq!(open.entry_price, 13.0);
        assert_eq!(open.stop, StopState::Percent);
        assert_eq!(position.last_evaluated_at, Some(last_bar));
        assert_eq!(prices[&sym], 13.0);

        // Same bar again: gated, no double evaluation
        engine
            .run_symbol(&sym, &mut position, &mut prices, &options(), now)
            .await
            .unwrap();
        assert!(position.has_position());
    }

    #[tokio::test]
    async fn test_insufficient_history_skips() {
        let sym = Symbol::new("BTCUSDT");
        let data = ScriptedData::new();
        data.set(&sym, vec![mk(0, 10.0), mk(1, 10.0)]).await;

        let broker = PaperBroker::new("USDT", 1_000.0);
        let history = TradeHistory::ephemeral();
        let engine = MarketEngine {
            data: &data,
            broker: &broker,
            history: &history,
            quote: "USDT",
            klines_limit: 250,
            fast_ma: 3,
            slow_ma: 6,
        };

        let mut position = Position::default();
        let mut prices = HashMap::new();

        engine
            .run_symbol(
                &sym,
                &mut position,
                &mut prices,
                &options(),
                start() + Duration::days(1),
            )
            .await
            .unwrap();

        assert!(!position.has_position());
        assert_eq!(position.last_evaluated_at, None);
    }

    #[tokio::test]
    async fn test_unknown_strategy_id_errors() {
        let sym = Symbol::new("BTCUSDT");
        let data = ScriptedData::new();
        let broker = PaperBroker::new("USDT", 1_000.0);
        let history = TradeHistory::ephemeral();
        let engine = MarketEngine {
            data: &data,
            broker: &broker,
            history: &history,
            quote: "USDT",
            klines_limit: 250,
            fast_ma: 3,
            slow_ma: 6,
        };

        let mut opts = options();
        opts.entry_override = None;
        opts.strategy_id = 999;

        let mut position = Position::default();
        let mut prices = HashMap::new();
        let err = engine
            .run_symbol(&sym, &mut position, &mut prices, &opts, start())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownStrategyId(999)));
    }

    #[tokio::test]
    async fn test_sell_all_closes_and_records_trade() {
        let sym = Symbol::new("BTCUSDT");
        let data = ScriptedData::new();
        let mut candles = golden_cross_series();
        data.set(&sym, candles.clone()).await;

        let broker = PaperBroker::new("USDT", 1_000.0);
        broker.set_last_price(&sym, 13.0).await;
        let history = TradeHistory::ephemeral();
        let engine = MarketEngine {
            data: &data,
            broker: &broker,
            history: &history,
            quote: "USDT",
            klines_limit: 250,
            fast_ma: 3,
            slow_ma: 6,
        };

        let mut position = Position::default();
        let mut prices = HashMap::new();
        let now = candles.last().unwrap().open_time + Duration::hours(1);
        engine
            .run_symbol(&sym, &mut position, &mut prices, &options(), now)
            .await
            .unwrap();
        assert!(position.has_position());

        // Next bar at a higher price; sell-all forces the exit
        let n = candles.len();
        candles.push(mk(n, 14.0));
        data.set(&sym, candles.clone()).await;
        broker.set_last_price(&sym, 14.0).await;

        let mut opts = options();
        opts.sell_all = true;
        let now = candles.last().unwrap().open_time + Duration::hours(1);
        engine
            .run_symbol(&sym, &mut position, &mut prices, &opts, now)
            .await
            .unwrap();

        assert!(!position.has_position());
        let trades = history.all_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].entry, 13.0);
        assert_eq!(trades[0].exit, 14.0);
        assert!(trades[0].pnl_value > 0.0);
    }
}
