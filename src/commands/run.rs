//! Trading loop command.
//!
//! Spawns one independent evaluation loop per configured market. Each loop
//! owns its own config copy, position map and price cache; the only shared
//! structure is the per-market [`ControlHandle`] used for cooperative stop
//! and sell-all signals. Within a loop, symbols are evaluated strictly
//! sequentially because each order mutates the account's free balance.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use tracing::{debug, error, info, warn};

use regime_trader::broker::{find_balance, Broker, MarketData, PaperBroker};
use regime_trader::config::{normalize_layer_id, Config, LayerConfig, MarketConfig, RuntimeUpdate};
use regime_trader::control::ControlHandle;
use regime_trader::engine::{CycleOptions, MarketEngine};
use regime_trader::error::EngineError;
use regime_trader::history::TradeHistory;
use regime_trader::portfolio::{
    build_trading_plan, order_sizing, LayerState, PlanContext, TradingPlan,
};
use regime_trader::presets::entry::ResolvedEntryPreset;
use regime_trader::presets::exit::{
    describe_exit_preset, resolve_exit_preset_config, resolve_layer_exit, AtrExitParams,
    ExitParams,
};
use regime_trader::regime::engine::{
    apply_regime_lock, detect_market_regime, pick_regime_strategy_pack, Regime, RegimeLockState,
    RegimeMode, StrategyPackChoice,
};
use regime_trader::risk::can_open_position;
use regime_trader::state::{MarketState, Performance, StateStore};
use regime_trader::types::{Position, Symbol};
use regime_trader::venue::BinanceMarketData;

pub fn run(config_path: String, paper: bool, live: bool) -> Result<()> {
    if !paper && !live {
        anyhow::bail!("Must specify either --paper or --live mode");
    }
    if live {
        anyhow::bail!("Live order routing requires a venue broker integration; run with --paper");
    }

    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path))
}

async fn run_async(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let store = StateStore::new(config.state_dir.clone());
    let initial_capital = config.initial_capital;

    let mut controls = Vec::new();
    let mut handles = Vec::new();

    for market in config.markets.clone() {
        let control = ControlHandle::new();
        controls.push(control.clone());
        let store = store.clone();

        handles.push(tokio::spawn(async move {
            let key = market.key.clone();
            let data = BinanceMarketData::new(market.quote.clone(), market.max_symbols);
            let broker = PaperBroker::new(market.quote.clone(), initial_capital);
            if let Err(e) = market_loop(market, data, broker, store, control, initial_capital).await
            {
                error!(market = %key, error = %e, "market loop ended with error");
            }
        }));
    }

    {
        let controls = controls.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, requesting graceful stop");
                for control in &controls {
                    control.request_stop();
                }
            }
        });
    }

    for handle in handles {
        let _ = handle.await;
    }

    info!("trading session ended");
    Ok(())
}

/// Per-cycle strategy selection produced by the regime engine.
struct CycleSelection {
    strategy_id: u32,
    exit_preset_id: Option<u32>,
    allow_entries: bool,
}

/// One market's indefinitely-repeating evaluation loop.
async fn market_loop<D: MarketData, B: Broker>(
    mut market: MarketConfig,
    data: D,
    broker: B,
    store: StateStore,
    control: ControlHandle,
    initial_capital: f64,
) -> Result<()> {
    let key = market.key.clone();
    info!(market = %key, "starting market loop");

    let history = TradeHistory::open(store.history_path(&key));
    let mut perf = store
        .load_performance(&key)
        .unwrap_or_else(|| Performance::new(initial_capital));

    // Restore durable state. The runtime snapshot goes back through the
    // allow-list validation so a stale file cannot smuggle in bad overrides.
    let mut state = store.load_state(&key).unwrap_or_default();
    if let Some(restored) = state.runtime.take() {
        market.runtime.apply_update(RuntimeUpdate {
            active_strategy_id: Some(restored.active_strategy_id),
            loop_interval_ms: Some(restored.loop_interval_ms),
            sl_pct: restored.sl_pct,
            tp_pct: restored.tp_pct,
            trail_start_pct: restored.trail_start_pct,
            trail_distance_pct: restored.trail_distance_pct,
            candle_exit_enabled: restored.candle_exit_enabled,
            candle_red_trigger_pct: restored.candle_red_trigger_pct,
        });
    }
    let mut positions: HashMap<Symbol, Position> = state.positions.clone();
    let mut regime_lock = state.regime_lock.clone();
    let mut layer_states: HashMap<String, LayerState> = state.layers.clone();

    let mut universe: Vec<Symbol> = if market.symbols.is_empty() {
        positions.keys().cloned().collect()
    } else {
        market.symbols.iter().map(Symbol::new).collect()
    };
    let mut last_universe_refresh: Option<NaiveDate> = None;
    let mut last_prices: HashMap<Symbol, f64> = HashMap::new();

    loop {
        let now = Utc::now();

        if control.stop_requested() {
            info!(market = %key, "stop requested, persisting state");
            save_market_state(&store, &key, &market, &positions, &regime_lock, &layer_states);
            store.save_performance(&key, &perf);
            break;
        }

        // Daily universe refresh for markets without a fixed symbol list.
        // Symbols with open positions always stay in the universe.
        if market.symbols.is_empty() && last_universe_refresh != Some(now.date_naive()) {
            match data.list_universe().await {
                Ok(fresh) if !fresh.is_empty() => {
                    let held: Vec<Symbol> = positions
                        .iter()
                        .filter(|(_, p)| p.has_position())
                        .map(|(s, _)| s.clone())
                        .collect();
                    universe = fresh.into_iter().chain(held).unique().collect();
                    last_universe_refresh = Some(now.date_naive());
                    info!(market = %key, symbols = universe.len(), "universe refreshed");
                }
                Ok(_) => warn!(market = %key, "universe refresh returned 0 symbols"),
                Err(e) => warn!(market = %key, error = %e, "universe refresh failed"),
            }
        }

        // Session gate: venues with trading hours skip entries while closed
        let mut market_open = true;
        if market.session_gated {
            match data.market_calendar().await {
                Ok(calendar) => {
                    market_open = calendar.is_open;
                    if !market_open {
                        info!(
                            market = %key,
                            next_open = ?calendar.next_open,
                            "market closed, exits only"
                        );
                    }
                }
                Err(e) => warn!(market = %key, error = %e, "calendar check failed, continuing"),
            }
        }

        // Manual liquidation happens immediately, outside the bar gate
        if control.take_sell_all() {
            info!(market = %key, "sell-all requested, liquidating");
            sell_all_positions(&broker, &market.quote, &universe, &mut positions).await;
            save_market_state(&store, &key, &market, &positions, &regime_lock, &layer_states);
            let interval = std::time::Duration::from_millis(market.runtime.loop_interval_ms);
            control.interruptible_sleep(interval).await;
            continue;
        }

        // Fine-grained regime engine drives non-layered markets; layered
        // markets are driven by the portfolio plan below
        let selection = if market.layers.is_empty() {
            select_cycle_strategy(&mut market, &data, &mut regime_lock).await
        } else {
            CycleSelection {
                strategy_id: market.runtime.active_strategy_id,
                exit_preset_id: None,
                allow_entries: true,
            }
        };

        // Account snapshot for equity and sizing
        let (equity, free_cash) = match broker.get_account().await {
            Ok(account) => {
                let cash = find_balance(&account, &market.quote);
                let held_value: f64 = positions
                    .iter()
                    .filter_map(|(s, p)| last_prices.get(s).map(|price| p.exposure_at(*price)))
                    .sum();
                (
                    account.equity.unwrap_or(cash.total() + held_value),
                    cash.free,
                )
            }
            Err(e) => {
                warn!(market = %key, error = %e, "account fetch failed, holding this cycle");
                (0.0, 0.0)
            }
        };

        // Portfolio plan: macro regime, layer states, budgets, breaker
        let plan = if market.layers.is_empty() {
            None
        } else {
            let benchmark = universe
                .iter()
                .find(|s| s.as_str() == "SPY")
                .or_else(|| universe.first())
                .cloned();
            let benchmark_candles = match benchmark {
                Some(sym) => data
                    .get_bars(&sym, market.timeframe, market.klines_limit)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(market = %key, error = %e, "benchmark candles failed");
                        Vec::new()
                    }),
                None => Vec::new(),
            };

            let trades = history.all_trades();
            let ctx = PlanContext {
                market: &market,
                equity,
                positions: &positions,
                last_prices: &last_prices,
                trades: &trades,
                benchmark_candles: &benchmark_candles,
                persisted_layers: &layer_states,
                now,
            };
            let plan = build_trading_plan(&ctx);
            layer_states = plan.layer_states.clone();
            Some(plan)
        };

        let engine = MarketEngine {
            data: &data,
            broker: &broker,
            history: &history,
            quote: &market.quote,
            klines_limit: market.klines_limit,
            fast_ma: market.fast_ma,
            slow_ma: market.slow_ma,
        };

        // Strictly sequential: each order mutates the shared free balance
        for symbol in universe.clone() {
            let result = match plan.as_ref() {
                Some(plan) => {
                    run_layered_symbol(
                        &engine,
                        &market,
                        plan,
                        &symbol,
                        &mut positions,
                        &mut last_prices,
                        equity,
                        free_cash,
                        market_open,
                        now,
                    )
                    .await
                }
                None => {
                    run_simple_symbol(
                        &engine,
                        &market,
                        &selection,
                        &symbol,
                        &mut positions,
                        &mut last_prices,
                        market_open,
                        now,
                    )
                    .await
                }
            };
            if let Err(e) = result {
                error!(market = %key, %symbol, error = %e, "symbol evaluation failed");
            }
        }

        // Performance line and durable snapshot after every cycle
        perf.record(equity, now);
        let stats = history.stats();
        info!(
            market = %key,
            equity = format!("{:.2}", equity),
            pnl = format!("{:+.2}%", perf.last_pnl_pct),
            trades = stats.total,
            wins = stats.wins,
            losses = stats.losses,
            "portfolio"
        );

        save_market_state(&store, &key, &market, &positions, &regime_lock, &layer_states);
        store.save_performance(&key, &perf);

        let interval = std::time::Duration::from_millis(market.runtime.loop_interval_ms);
        info!(market = %key, "waiting {}s", interval.as_secs());
        control.interruptible_sleep(interval).await;
    }

    Ok(())
}

/// Liquidate every held symbol at market and reset its record.
async fn sell_all_positions<B: Broker>(
    broker: &B,
    quote: &str,
    universe: &[Symbol],
    positions: &mut HashMap<Symbol, Position>,
) {
    let symbols: Vec<Symbol> = universe
        .iter()
        .chain(positions.keys())
        .unique()
        .cloned()
        .collect();

    for symbol in symbols {
        match broker.sell_market_all(&symbol, quote).await {
            Ok(Some(fill)) => {
                info!(%symbol, qty = fill.executed_qty, price = fill.avg_price, "sold (sell all)");
                positions.insert(symbol, Position::default());
            }
            Ok(None) => {
                positions.insert(symbol, Position::default());
            }
            Err(e) => error!(%symbol, error = %e, "sell-all order failed"),
        }
    }
}

/// Run the regime engine for the cycle and derive the strategy selection.
async fn select_cycle_strategy<D: MarketData>(
    market: &mut MarketConfig,
    data: &D,
    regime_lock: &mut Option<RegimeLockState>,
) -> CycleSelection {
    let settings = market.regime.clone().sanitized();

    let proxy = Symbol::new(settings.proxy_symbol.clone());
    let proxy_candles = match data
        .get_bars(&proxy, settings.timeframe, market.klines_limit)
        .await
    {
        Ok(candles) => candles,
        Err(e) => {
            warn!(error = %e, "regime proxy candles failed");
            Vec::new()
        }
    };

    let detection = detect_market_regime(&proxy_candles, &settings);
    let lock = apply_regime_lock(
        regime_lock.as_ref(),
        detection.regime,
        settings.min_hold_candles,
    );
    *regime_lock = Some(lock.to_state());

    let choice = pick_regime_strategy_pack(&detection, &settings);

    let mut selection = CycleSelection {
        strategy_id: market.runtime.active_strategy_id,
        exit_preset_id: None,
        allow_entries: true,
    };
    let mut block_reason: Option<String> = None;

    if settings.mode == RegimeMode::Auto {
        match &choice {
            StrategyPackChoice::Trade { pack, .. } if lock.current_regime != Regime::NoTrade => {
                selection.strategy_id = pack.entry_strategy_id;
                selection.exit_preset_id = Some(pack.exit_preset_id);
                market.runtime.active_strategy_id = pack.entry_strategy_id;
            }
            StrategyPackChoice::Trade { .. } => {
                selection.allow_entries = false;
                block_reason = Some(detection.reason.clone());
            }
            StrategyPackChoice::Blocked { reason, .. } => {
                selection.allow_entries = false;
                block_reason = Some(reason.clone());
            }
        }
    }

    if let Some(metrics) = detection.metrics {
        info!(
            detected = %detection.regime,
            applied = %lock.current_regime,
            confidence = format!("{:.2}", detection.confidence),
            lock = ?lock.lock_status,
            hold = format!("{}/{}", lock.hold_count, settings.min_hold_candles),
            atr_ratio = format!("{:.2}", metrics.atr_ratio),
            vol_ratio = format!("{:.2}", metrics.volume_ratio),
            slope = format!("{:.3}%", metrics.slope_pct),
            rsi = format!("{:.0}", metrics.rsi),
            "regime"
        );
    } else {
        info!(
            detected = %detection.regime,
            applied = %lock.current_regime,
            reason = %detection.reason,
            "regime"
        );
    }

    if settings.mode == RegimeMode::Auto {
        info!(
            entry = selection.strategy_id,
            exit = %describe_exit_preset(selection.exit_preset_id),
            "regime strategy pack"
        );
        if !selection.allow_entries {
            info!(
                reason = block_reason.as_deref().unwrap_or("NO_TRADE"),
                "entries blocked by regime"
            );
        }
    }

    selection
}

/// Simple branch: no layers configured; the regime pack (or the operator's
/// strategy) drives every symbol.
#[allow(clippy::too_many_arguments)]
async fn run_simple_symbol<D: MarketData, B: Broker>(
    engine: &MarketEngine<'_, D, B>,
    market: &MarketConfig,
    selection: &CycleSelection,
    symbol: &Symbol,
    positions: &mut HashMap<Symbol, Position>,
    last_prices: &mut HashMap<Symbol, f64>,
    market_open: bool,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let position = positions.entry(symbol.clone()).or_default();
    let base_exit = market.effective_exit();

    // An open position keeps the exit preset it was opened with
    let exit_preset_id = position
        .position
        .as_ref()
        .and_then(|p| p.exit_preset_id)
        .or(selection.exit_preset_id);
    let exit_params = resolve_exit_preset_config(exit_preset_id, &base_exit);

    let opts = CycleOptions {
        allow_entries: selection.allow_entries && market_open,
        order_fraction: market.quote_order_fraction,
        layer_id: None,
        strategy_id: selection.strategy_id,
        entry_override: None,
        exit_preset_id,
        exit_params,
        atr_exit: None,
        timeframe: market.timeframe,
        risk_allocated_usd: None,
        kill_switch: market.kill_switch,
        sell_all: false,
    };

    engine
        .run_symbol(symbol, position, last_prices, &opts, now)
        .await
}

/// Resolve a layer's entry and exit bindings into engine inputs.
fn layer_bindings(
    market: &MarketConfig,
    layer: &LayerConfig,
) -> (
    u32,
    Option<ResolvedEntryPreset>,
    ExitParams,
    Option<AtrExitParams>,
) {
    let strategy_id = layer
        .entry_strategy_id
        .unwrap_or(market.runtime.active_strategy_id);

    let entry_override = layer.entry_preset.as_ref().map(|preset| {
        let min_candles = preset.min_candles();
        ResolvedEntryPreset {
            id: layer
                .entry_preset_id
                .clone()
                .unwrap_or_else(|| layer.normalized_id()),
            name: layer.name.clone(),
            preset: preset.clone(),
            min_candles,
        }
    });

    let base_exit = market.effective_exit();
    let (exit_params, atr_exit) =
        resolve_layer_exit(layer.exit_preset.as_ref(), layer.exit_preset_id, &base_exit);

    (strategy_id, entry_override, exit_params, atr_exit)
}

/// Layered branch: open positions are managed under their own layer's exit
/// rules with entries off; flat symbols try each enabled layer in order
/// until one opens a position.
#[allow(clippy::too_many_arguments)]
async fn run_layered_symbol<D: MarketData, B: Broker>(
    engine: &MarketEngine<'_, D, B>,
    market: &MarketConfig,
    plan: &TradingPlan,
    symbol: &Symbol,
    positions: &mut HashMap<Symbol, Position>,
    last_prices: &mut HashMap<Symbol, f64>,
    equity: f64,
    free_cash: f64,
    market_open: bool,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    positions.entry(symbol.clone()).or_default();

    let held_layer = positions
        .get(symbol)
        .and_then(|p| p.position.as_ref())
        .and_then(|open| open.layer_id.clone());

    if let Some(layer_id) = held_layer {
        // Manage the open position under its own layer's rules
        let layer = market
            .layers
            .iter()
            .find(|l| l.normalized_id() == normalize_layer_id(&layer_id));

        let opts = match layer {
            Some(layer) => {
                let (strategy_id, entry_override, exit_params, atr_exit) =
                    layer_bindings(market, layer);
                CycleOptions {
                    allow_entries: false,
                    order_fraction: 0.0,
                    layer_id: Some(layer.normalized_id()),
                    strategy_id,
                    entry_override,
                    exit_preset_id: layer.exit_preset_id,
                    exit_params,
                    atr_exit,
                    timeframe: layer.timeframe.unwrap_or(market.timeframe),
                    risk_allocated_usd: None,
                    kill_switch: market.kill_switch,
                    sell_all: false,
                }
            }
            None => CycleOptions {
                allow_entries: false,
                order_fraction: 0.0,
                layer_id: Some(layer_id),
                strategy_id: market.runtime.active_strategy_id,
                entry_override: None,
                exit_preset_id: None,
                exit_params: market.effective_exit(),
                atr_exit: None,
                timeframe: market.timeframe,
                risk_allocated_usd: None,
                kill_switch: market.kill_switch,
                sell_all: false,
            },
        };

        if let Some(position) = positions.get_mut(symbol) {
            return engine
                .run_symbol(symbol, position, last_prices, &opts, now)
                .await;
        }
        return Ok(());
    }

    // Flat: try each enabled layer until one opens a position
    for layer_id in &plan.enabled_layers {
        let Some(layer) = market
            .layers
            .iter()
            .find(|l| &l.normalized_id() == layer_id)
        else {
            continue;
        };

        let is_paused = plan
            .layer_states
            .get(layer_id)
            .map_or(false, |s| s.is_paused);
        if let Err(denial) = can_open_position(
            layer,
            is_paused,
            positions,
            last_prices,
            equity,
            plan.global_max_open_positions,
        ) {
            debug!(%symbol, layer = %layer_id, denial = %denial, "layer not eligible");
            continue;
        }

        let budget = plan.layer_budgets.get(layer_id);
        let (order_fraction, max_risk_usd) = order_sizing(layer, budget, equity, free_cash);
        let (strategy_id, entry_override, exit_params, atr_exit) = layer_bindings(market, layer);

        let opts = CycleOptions {
            allow_entries: order_fraction > 0.0 && market_open,
            order_fraction,
            layer_id: Some(layer.normalized_id()),
            strategy_id,
            entry_override,
            exit_preset_id: layer.exit_preset_id,
            exit_params,
            atr_exit,
            timeframe: layer.timeframe.unwrap_or(market.timeframe),
            risk_allocated_usd: Some(max_risk_usd),
            kill_switch: market.kill_switch,
            sell_all: false,
        };

        if let Some(position) = positions.get_mut(symbol) {
            engine
                .run_symbol(symbol, position, last_prices, &opts, now)
                .await?;
        }

        if positions.get(symbol).map_or(false, |p| p.has_position()) {
            break;
        }
    }

    Ok(())
}

fn save_market_state(
    store: &StateStore,
    key: &str,
    market: &MarketConfig,
    positions: &HashMap<Symbol, Position>,
    regime_lock: &Option<RegimeLockState>,
    layer_states: &HashMap<String, LayerState>,
) {
    let state = MarketState {
        positions: positions.clone(),
        active_strategy_id: Some(market.runtime.active_strategy_id),
        runtime: Some(market.runtime.clone()),
        regime_lock: regime_lock.clone(),
        layers: layer_states.clone(),
        last_update: Some(Utc::now()),
    };
    store.save_state(key, &state);
}
