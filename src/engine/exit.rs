//! Exit evaluation for open positions.
//!
//! Two mutually exclusive stop models: the percentage model (fixed SL/TP off
//! the entry price with a max-price trailing stop) and the ATR model (stop
//! distance frozen as a multiple of the entry-time ATR, targets and trailing
//! expressed in R). A raw exit signal from either model still has to pass
//! the candle-confirmation gate before it is acted on; a manual sell-all
//! always forces the exit.

use tracing::debug;

use crate::indicators::{atr, ema, last_value};
use crate::presets::exit::{AtrExitParams, ExitParams};
use crate::types::{AtrAnchors, Candle, OpenPosition, StopState};

/// Outcome of one exit evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Sell now. `forced` marks a manual sell-all override.
    Exit { forced: bool },
    /// Keep the position. `raw_blocked` is set when a stop/target fired but
    /// the candle gate refused to confirm it.
    Hold { raw_blocked: bool },
}

/// Evaluate exit conditions against the latest closed bar, updating the
/// position's max price and trailing-stop state in place.
pub fn evaluate_exit(
    pos: &mut OpenPosition,
    candles: &[Candle],
    exit_params: &ExitParams,
    atr_exit: Option<&AtrExitParams>,
    sell_all: bool,
) -> ExitDecision {
    let [.., prev, last] = candles else {
        return ExitDecision::Hold { raw_blocked: false };
    };

    let price = last.close;
    let entry = pos.entry_price;

    if price > pos.max_price {
        pos.max_price = price;
    }

    let raw_exit = match atr_exit {
        Some(preset) => evaluate_atr_model(pos, candles, price, entry, preset),
        None => evaluate_percent_model(pos, price, entry, exit_params),
    };

    // Candle confirmation: a raw signal only passes on a red bar whose body
    // is strong enough relative to the previous bar's body.
    let candle_ok = if !exit_params.candle_exit_enabled {
        true
    } else {
        let prev_body = prev.body();
        last.is_red()
            && prev_body > 0.0
            && last.body() / prev_body >= exit_params.candle_red_trigger_pct
    };

    if sell_all {
        return ExitDecision::Exit { forced: true };
    }

    if raw_exit && candle_ok {
        ExitDecision::Exit { forced: false }
    } else {
        if raw_exit {
            debug!("stop/target hit but candle gate refused, holding");
        }
        ExitDecision::Hold {
            raw_blocked: raw_exit,
        }
    }
}

fn evaluate_percent_model(
    pos: &mut OpenPosition,
    price: f64,
    entry: f64,
    params: &ExitParams,
) -> bool {
    let base_sl = entry * (1.0 - params.sl_pct);
    let base_tp = entry * (1.0 + params.tp_pct);

    // Trailing arms once price clears the start threshold; the effective
    // stop is then the max of the base stop and the max-price trail, which
    // can only ratchet upward.
    let mut dyn_sl = base_sl;
    if price >= entry * (1.0 + params.trail_start_pct) {
        let trail_sl = pos.max_price * (1.0 - params.trail_distance_pct);
        if trail_sl > dyn_sl {
            dyn_sl = trail_sl;
        }
    }

    price >= base_tp || price <= dyn_sl
}

fn evaluate_atr_model(
    pos: &mut OpenPosition,
    candles: &[Candle],
    price: f64,
    entry: f64,
    preset: &AtrExitParams,
) -> bool {
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let Some(atr_now) = last_value(&atr(&highs, &lows, &closes, preset.atr_period)) else {
        // No ATR, no signal; the anchors stay pending
        return false;
    };

    // Freeze the anchors on the first evaluation after entry
    if !matches!(pos.stop, StopState::Atr(_)) {
        let stop_distance = atr_now * preset.initial_atr_mult;
        pos.stop = StopState::Atr(AtrAnchors {
            entry_atr: atr_now,
            entry_r: stop_distance,
            initial_stop: entry - stop_distance,
            trailing_stop: None,
        });
    }

    let StopState::Atr(ref mut anchors) = pos.stop else {
        return false;
    };

    let r = anchors.entry_r;
    let base_sl = anchors.initial_stop;
    let base_tp = preset
        .take_profit_r
        .filter(|&tp_r| tp_r > 0.0)
        .map(|tp_r| entry + r * tp_r);

    if let Some(trail_start_r) = preset.trail_start_r {
        if price >= entry + r * trail_start_r {
            let trail = price - anchors.entry_atr * preset.trail_atr_mult;
            if anchors.trailing_stop.map_or(true, |t| trail > t) {
                anchors.trailing_stop = Some(trail);
            }
        }
    }

    let dyn_sl = match anchors.trailing_stop {
        Some(t) if t > base_sl => t,
        _ => base_sl,
    };

    let hit_tp = base_tp.map_or(false, |tp| price >= tp);
    let hit_sl = price <= dyn_sl;
    let mut raw_exit = hit_tp || hit_sl;

    // Trend flip: the fast exit EMA dropping below the slow one ends the trade
    if let (Some(fast_p), Some(slow_p)) = (preset.trend_exit_fast_ema, preset.trend_exit_slow_ema)
    {
        let fast = last_value(&ema(&closes, fast_p));
        let slow = last_value(&ema(&closes, slow_p));
        if let (Some(fast), Some(slow)) = (fast, slow) {
            if fast < slow {
                raw_exit = true;
            }
        }
    }

    let bars_since_entry = candles
        .iter()
        .filter(|c| c.open_time > pos.entry_bar_ts)
        .count();

    // Time stop: enough bars elapsed without the trade reaching min R
    if let Some(time_stop_bars) = preset.time_stop_bars {
        if bars_since_entry >= time_stop_bars && price < entry + r * preset.time_stop_min_r {
            raw_exit = true;
        }
    }

    // Breakout invalidation: an early close back under the broken level
    if let (Some(invalidation_bars), Some(level)) = (preset.invalidation_bars, pos.breakout_level)
    {
        if bars_since_entry <= invalidation_bars && price < level {
            raw_exit = true;
        }
    }

    raw_exit
}
