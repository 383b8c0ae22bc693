//! Portfolio engine: per-layer drawdown state, the per-cycle trading plan
//! and order sizing.
//!
//! Each cycle the engine sums realized PnL per layer over trailing 24h and
//! 7-day windows, derives drawdown against the layer's allocated equity and
//! pauses breached layers for their configured cooldown. A macro regime
//! classification of a benchmark series gates which layers may open
//! positions, and a portfolio-wide daily circuit breaker can disable all of
//! them at once.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{normalize_layer_id, LayerConfig, MarketConfig};
use crate::regime::macro_classifier::{classify_macro_regime, MacroRegime};
use crate::risk::{compute_layer_budgets, open_position_counts, LayerBudget, OpenCounts};
use crate::types::{Candle, Position, Symbol, TradeRecord};

/// Derived layer state for one cycle. `pause_until` is sticky: once set it
/// is never cleared early, even if PnL recovers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    pub pnl_day: f64,
    pub pnl_week: f64,
    pub drawdown_day: f64,
    pub drawdown_week: f64,
    pub is_paused: bool,
    pub pause_until: Option<DateTime<Utc>>,
}

fn sum_pnl_for_layer(
    trades: &[TradeRecord],
    layer_id: &str,
    window: Duration,
    now: DateTime<Utc>,
) -> f64 {
    let id = normalize_layer_id(layer_id);
    if id.is_empty() {
        return 0.0;
    }
    let cutoff = now - window;
    trades
        .iter()
        .filter(|t| t.time >= cutoff)
        .filter(|t| {
            t.layer_id
                .as_deref()
                .map(normalize_layer_id)
                .map_or(false, |l| l == id)
        })
        .map(|t| t.pnl_value)
        .sum()
}

fn sum_pnl_total(trades: &[TradeRecord], window: Duration, now: DateTime<Utc>) -> f64 {
    let cutoff = now - window;
    trades
        .iter()
        .filter(|t| t.time >= cutoff)
        .map(|t| t.pnl_value)
        .sum()
}

/// Compute one layer's state, carrying the sticky pause forward from the
/// persisted snapshot. The first cycle a drawdown threshold is breached sets
/// `pause_until = now + cooldown`; the pause then runs its full course.
pub fn compute_layer_state(
    layer: &LayerConfig,
    trades: &[TradeRecord],
    equity: f64,
    persisted: Option<&LayerState>,
    now: DateTime<Utc>,
) -> LayerState {
    let equity_allocated = equity * layer.allocation_pct;
    let pnl_day = sum_pnl_for_layer(trades, &layer.id, Duration::hours(24), now);
    let pnl_week = sum_pnl_for_layer(trades, &layer.id, Duration::days(7), now);

    let drawdown = |pnl: f64| {
        if equity_allocated > 0.0 {
            (-pnl).max(0.0) / equity_allocated * 100.0
        } else {
            0.0
        }
    };
    let drawdown_day = drawdown(pnl_day);
    let drawdown_week = drawdown(pnl_week);

    let mut pause_until = persisted.and_then(|p| p.pause_until);
    let mut is_paused = pause_until.map_or(false, |until| until > now);

    if !is_paused {
        let daily_stop =
            layer.loss_stop_daily_pct > 0.0 && drawdown_day >= layer.loss_stop_daily_pct;
        let weekly_stop =
            layer.loss_stop_weekly_pct > 0.0 && drawdown_week >= layer.loss_stop_weekly_pct;
        if daily_stop || weekly_stop {
            let cooldown_secs = (layer.cooldown_hours_after_stop * 3600.0) as i64;
            pause_until = Some(now + Duration::seconds(cooldown_secs));
            is_paused = pause_until.map_or(false, |until| until > now);
            warn!(
                layer = %layer.normalized_id(),
                drawdown_day = format!("{:.2}%", drawdown_day),
                drawdown_week = format!("{:.2}%", drawdown_week),
                "layer drawdown stop hit, pausing"
            );
        }
    }

    LayerState {
        pnl_day,
        pnl_week,
        drawdown_day,
        drawdown_week,
        is_paused,
        pause_until,
    }
}

/// The per-cycle trading plan consumed by the state machine.
#[derive(Debug, Clone, Default)]
pub struct TradingPlan {
    pub regime: Option<MacroRegime>,
    /// Layers allowed to open positions this cycle, in config order
    pub enabled_layers: Vec<String>,
    pub layer_budgets: HashMap<String, LayerBudget>,
    pub layer_states: HashMap<String, LayerState>,
    pub open_counts: OpenCounts,
    pub daily_stop_hit: bool,
    pub global_max_open_positions: usize,
}

/// Inputs for one plan computation.
pub struct PlanContext<'a> {
    pub market: &'a MarketConfig,
    pub equity: f64,
    pub positions: &'a HashMap<Symbol, Position>,
    pub last_prices: &'a HashMap<Symbol, f64>,
    pub trades: &'a [TradeRecord],
    pub benchmark_candles: &'a [Candle],
    pub persisted_layers: &'a HashMap<String, LayerState>,
    pub now: DateTime<Utc>,
}

/// Build the cycle's trading plan: classify the macro regime, derive layer
/// states and budgets, apply the regime->layers eligibility map and the
/// global daily circuit breaker.
pub fn build_trading_plan(ctx: &PlanContext<'_>) -> TradingPlan {
    let market = ctx.market;

    let regime = classify_macro_regime(ctx.benchmark_candles, &market.macro_regime);
    let allowed: Vec<String> = market
        .regime_layer_rules
        .get(&regime.to_string())
        .map(|ids| ids.iter().map(|id| normalize_layer_id(id)).collect())
        .unwrap_or_default();

    let mut layer_states = HashMap::new();
    for layer in &market.layers {
        let id = layer.normalized_id();
        let state = compute_layer_state(
            layer,
            ctx.trades,
            ctx.equity,
            ctx.persisted_layers.get(&id),
            ctx.now,
        );
        layer_states.insert(id, state);
    }

    let enabled_layers: Vec<String> = market
        .layers
        .iter()
        .map(|l| l.normalized_id())
        .filter(|id| allowed.contains(id))
        .filter(|id| !layer_states.get(id).map_or(false, |s| s.is_paused))
        .collect();

    let layer_budgets =
        compute_layer_budgets(ctx.equity, &market.layers, ctx.positions, ctx.last_prices);
    let open_counts = open_position_counts(ctx.positions);

    // Portfolio-wide daily circuit breaker
    let daily_pnl = sum_pnl_total(ctx.trades, Duration::hours(24), ctx.now);
    let stop_pct = market.global_risk.daily_stop_pct;
    let daily_stop_hit = ctx.equity > 0.0
        && stop_pct > 0.0
        && (-daily_pnl).max(0.0) / ctx.equity >= stop_pct / 100.0;

    let enabled_layers = if daily_stop_hit {
        warn!(
            daily_pnl = format!("{:.2}", daily_pnl),
            "portfolio daily stop hit, all layers disabled this cycle"
        );
        Vec::new()
    } else {
        enabled_layers
    };

    let global_max_open_positions = market
        .global_risk
        .max_open_positions
        .unwrap_or_else(|| market.layers.iter().map(|l| l.max_open_positions).sum());

    info!(
        regime = %regime,
        enabled = enabled_layers.iter().join(","),
        open = open_counts.total_open,
        "trading plan"
    );

    TradingPlan {
        regime: Some(regime),
        enabled_layers,
        layer_budgets,
        layer_states,
        open_counts,
        daily_stop_hit,
        global_max_open_positions,
    }
}

/// Order sizing for a layer entry: the budget is capped by both the layer's
/// remaining allocation and its per-trade risk cap, then expressed as a
/// fraction of free quote cash for the broker call.
pub fn order_sizing(
    layer: &LayerConfig,
    budget: Option<&LayerBudget>,
    equity: f64,
    free_cash: f64,
) -> (f64, f64) {
    let max_risk_usd = equity * layer.allocation_pct * layer.max_risk_per_trade_pct / 100.0;
    let available = budget.map(|b| b.available_usd).unwrap_or(0.0);
    let order_budget = available.min(max_risk_usd);
    let fraction = if free_cash > 0.0 {
        (order_budget / free_cash).min(1.0)
    } else {
        0.0
    };
    (fraction, max_risk_usd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalRiskConfig, RuntimeConfig};
    use crate::presets::exit::ExitParams;
    use crate::regime::engine::RegimeSettings;
    use crate::regime::macro_classifier::MacroRegimeConfig;
    use crate::timeframe::Timeframe;
    use crate::types::Side;
    use chrono::TimeZone;

    fn layer(id: &str, allocation: f64) -> LayerConfig {
        LayerConfig {
            id: id.to_string(),
            name: id.to_string(),
            allocation_pct: allocation,
            max_risk_per_trade_pct: 10.0,
            max_open_positions: 2,
            entry_strategy_id: Some(2),
            entry_preset_id: None,
            entry_preset: None,
            exit_preset_id: Some(1),
            exit_preset: None,
            timeframe: None,
            loss_stop_daily_pct: 2.0,
            loss_stop_weekly_pct: 5.0,
            cooldown_hours_after_stop: 24.0,
        }
    }

    fn trade_for(layer_id: &str, pnl: f64, time: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            symbol: Symbol::new("AAPL"),
            side: Side::Long,
            entry: 100.0,
            exit: 100.0 + pnl,
            qty: 1.0,
            pnl_value: pnl,
            pnl_pct: pnl,
            layer_id: Some(layer_id.to_string()),
            strategy_id: Some(2),
            entry_preset_id: None,
            exit_preset_id: Some(1),
            time,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_layer_pauses_on_daily_drawdown() {
        let l = layer("core", 0.5);
        // Allocated 50k, daily stop 2% => losses >= 1000 pause the layer
        let trades = vec![trade_for("core", -1_200.0, now() - Duration::hours(2))];
        let state = compute_layer_state(&l, &trades, 100_000.0, None, now());

        assert!(state.is_paused);
        let until = state.pause_until.unwrap();
        assert_eq!(until, now() + Duration::hours(24));
        assert!((state.drawdown_day - 2.4).abs() < 1e-9);
    }

    #[test]
    fn test_pause_is_sticky_even_after_recovery() {
        let l = layer("core", 0.5);
        let paused = LayerState {
            is_paused: true,
            pause_until: Some(now() + Duration::hours(20)),
            ..LayerState::default()
        };

        // The losing trades have aged out and PnL is now positive, but the
        // pause window has not elapsed
        let trades = vec![trade_for("core", 500.0, now() - Duration::hours(1))];
        let state = compute_layer_state(&l, &trades, 100_000.0, Some(&paused), now());
        assert!(state.is_paused);
        assert_eq!(state.pause_until, paused.pause_until);

        // Once the window elapses the layer resumes on its own
        let later = now() + Duration::hours(21);
        let state = compute_layer_state(&l, &trades, 100_000.0, Some(&paused), later);
        assert!(!state.is_paused);
    }

    #[test]
    fn test_old_trades_ignored_by_windows() {
        let l = layer("core", 0.5);
        let trades = vec![
            trade_for("core", -5_000.0, now() - Duration::days(10)),
            trade_for("core", -100.0, now() - Duration::hours(3)),
        ];
        let state = compute_layer_state(&l, &trades, 100_000.0, None, now());
        assert_eq!(state.pnl_day, -100.0);
        assert_eq!(state.pnl_week, -100.0);
        assert!(!state.is_paused);
    }

    fn market_with_layers(layers: Vec<LayerConfig>, daily_stop_pct: f64) -> MarketConfig {
        let mut rules = HashMap::new();
        rules.insert(
            "TREND".to_string(),
            layers.iter().map(|l| l.id.clone()).collect(),
        );
        MarketConfig {
            key: "stocks".to_string(),
            quote: "USD".to_string(),
            symbols: vec![],
            max_symbols: 10,
            timeframe: Timeframe::H1,
            klines_limit: 250,
            fast_ma: 25,
            slow_ma: 100,
            quote_order_fraction: 0.5,
            kill_switch: false,
            session_gated: true,
            exit: ExitParams {
                sl_pct: 0.012,
                tp_pct: 0.024,
                trail_start_pct: 0.012,
                trail_distance_pct: 0.006,
                candle_exit_enabled: true,
                candle_red_trigger_pct: 0.4,
            },
            regime: RegimeSettings::default(),
            macro_regime: MacroRegimeConfig::default(),
            layers,
            regime_layer_rules: rules,
            global_risk: GlobalRiskConfig {
                daily_stop_pct,
                max_open_positions: None,
            },
            runtime: RuntimeConfig::default(),
        }
    }

    fn trending_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.2;
                Candle {
                    open_time: now() - Duration::hours((n - i) as i64),
                    open: base,
                    high: base + 0.4,
                    low: base - 0.4,
                    close: base + 0.1,
                    volume: 1_000.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_plan_enables_layers_by_regime_rule() {
        let market = market_with_layers(vec![layer("core", 0.5), layer("tactical", 0.35)], 0.0);
        let positions = HashMap::new();
        let prices = HashMap::new();
        let persisted = HashMap::new();
        let ctx = PlanContext {
            market: &market,
            equity: 100_000.0,
            positions: &positions,
            last_prices: &prices,
            trades: &[],
            benchmark_candles: &trending_candles(240),
            persisted_layers: &persisted,
            now: now(),
        };

        let plan = build_trading_plan(&ctx);
        assert_eq!(plan.regime, Some(MacroRegime::Trend));
        assert_eq!(plan.enabled_layers, vec!["CORE", "TACTICAL"]);
        assert_eq!(plan.global_max_open_positions, 4);
        assert!(!plan.daily_stop_hit);
    }

    #[test]
    fn test_plan_short_benchmark_disables_everything() {
        let market = market_with_layers(vec![layer("core", 0.5)], 0.0);
        let positions = HashMap::new();
        let prices = HashMap::new();
        let persisted = HashMap::new();
        let ctx = PlanContext {
            market: &market,
            equity: 100_000.0,
            positions: &positions,
            last_prices: &prices,
            trades: &[],
            benchmark_candles: &trending_candles(50),
            persisted_layers: &persisted,
            now: now(),
        };

        let plan = build_trading_plan(&ctx);
        assert_eq!(plan.regime, Some(MacroRegime::Off));
        assert!(plan.enabled_layers.is_empty());
    }

    #[test]
    fn test_daily_circuit_breaker_disables_all_layers() {
        let market = market_with_layers(vec![layer("core", 0.5)], 3.0);
        let trades = vec![trade_for("core", -3_500.0, now() - Duration::hours(2))];
        let positions = HashMap::new();
        let prices = HashMap::new();
        let persisted = HashMap::new();
        let ctx = PlanContext {
            market: &market,
            equity: 100_000.0,
            positions: &positions,
            last_prices: &prices,
            trades: &trades,
            benchmark_candles: &trending_candles(240),
            persisted_layers: &persisted,
            now: now(),
        };

        let plan = build_trading_plan(&ctx);
        assert!(plan.daily_stop_hit);
        assert!(plan.enabled_layers.is_empty());
        // Layer states are still computed for persistence
        assert!(plan.layer_states.contains_key("CORE"));
    }

    #[test]
    fn test_order_sizing_fraction() {
        let l = layer("core", 0.5);
        let budget = LayerBudget {
            budget_usd: 50_000.0,
            exposure_usd: 45_000.0,
            available_usd: 5_000.0,
            allocation_pct: 0.5,
        };

        // Risk cap: 100k * 0.5 * 10% = 5000; available 5000; free cash 20k
        let (fraction, max_risk) = order_sizing(&l, Some(&budget), 100_000.0, 20_000.0);
        assert_eq!(max_risk, 5_000.0);
        assert_eq!(fraction, 0.25);

        // No free cash means no order
        let (fraction, _) = order_sizing(&l, Some(&budget), 100_000.0, 0.0);
        assert_eq!(fraction, 0.0);

        // Fraction is clamped to 1
        let (fraction, _) = order_sizing(&l, Some(&budget), 100_000.0, 1_000.0);
        assert_eq!(fraction, 1.0);
    }
}
