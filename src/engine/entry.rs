//! Entry predicates, one per preset family.
//!
//! Each predicate is a pure function of the candle series and the preset
//! parameters; unavailable indicators simply mean "no entry". The breakout
//! family additionally reports the broken level so the exit logic can run
//! invalidation checks against it.

use tracing::debug;

use crate::indicators::{
    self, adx, atr, ema, highest_high, is_bullish_engulfing, is_bullish_hammer, last_value, rsi,
    sma, volume_ma, vwap,
};
use crate::presets::entry::{
    BreakoutParams, CoreTrendParams, EmaMomentumParams, EntryPreset, GoldenCrossParams,
    SwingPullbackParams, TrendPullbackParams,
};
use crate::types::Candle;

/// Outcome of an entry evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntrySignal {
    pub enter: bool,
    /// Broken N-bar high, recorded by the breakout family
    pub breakout_level: Option<f64>,
}

impl EntrySignal {
    fn hold() -> Self {
        EntrySignal {
            enter: false,
            breakout_level: None,
        }
    }

    fn simple(enter: bool) -> Self {
        EntrySignal {
            enter,
            breakout_level: None,
        }
    }
}

/// Evaluate the preset's predicate against the series.
pub fn evaluate_entry(candles: &[Candle], preset: &EntryPreset) -> EntrySignal {
    match preset {
        EntryPreset::GoldenCross(p) => EntrySignal::simple(check_golden_cross(candles, p)),
        EntryPreset::TrendPullback(p) => EntrySignal::simple(check_trend_pullback(candles, p)),
        EntryPreset::EmaMomentum(p) => EntrySignal::simple(check_ema_momentum(candles, p)),
        EntryPreset::Breakout(p) => check_breakout(candles, p),
        EntryPreset::CoreTrend(p) => EntrySignal::simple(check_core_trend(candles, p)),
        EntryPreset::SwingPullback(p) => EntrySignal::simple(check_swing_pullback(candles, p)),
    }
}

fn closes_of(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

fn highs_of(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.high).collect()
}

fn lows_of(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.low).collect()
}

fn check_golden_cross(candles: &[Candle], p: &GoldenCrossParams) -> bool {
    let closes = closes_of(candles);
    if closes.len() < 2 {
        return false;
    }

    let fast_now = last_value(&sma(&closes, p.ma_fast_period));
    let slow_now = last_value(&sma(&closes, p.ma_slow_period));
    let fast_prev = last_value(&sma(&closes[..closes.len() - 1], p.ma_fast_period));
    let slow_prev = last_value(&sma(&closes[..closes.len() - 1], p.ma_slow_period));

    let (Some(fast_now), Some(slow_now), Some(fast_prev), Some(slow_prev)) =
        (fast_now, slow_now, fast_prev, slow_prev)
    else {
        return false;
    };

    let crossed = fast_prev <= slow_prev && fast_now > slow_now;
    debug!(fast = fast_now, slow = slow_now, crossed, "golden cross check");
    crossed
}

fn check_trend_pullback(candles: &[Candle], p: &TrendPullbackParams) -> bool {
    let [.., prev, last] = candles else {
        return false;
    };

    let closes = closes_of(candles);
    let ma_fast = last_value(&sma(&closes, p.ma_fast_period));
    let ma_slow = last_value(&sma(&closes, p.ma_slow_period));
    let rsi_now = last_value(&rsi(&closes, p.rsi_period));

    let (Some(ma_fast), Some(ma_slow), Some(rsi_now)) = (ma_fast, ma_slow, rsi_now) else {
        return false;
    };

    let trend_up = ma_fast > ma_slow && last.close > ma_slow;

    // Pullback band around the fast MA, measured off the prior bar's low
    let pullback_pct = (ma_fast - prev.low) / ma_fast * 100.0;
    let band_ok = pullback_pct >= p.pullback_min_pct && pullback_pct <= p.pullback_max_pct;
    let reclaim_ok = last.close >= ma_fast * (1.0 - p.pullback_min_pct / 100.0);
    let pullback_ok = band_ok && reclaim_ok;

    let rsi_ok = rsi_now >= p.rsi_min && rsi_now <= p.rsi_max;

    let candle_ok = is_bullish_engulfing(prev, last) || is_bullish_hammer(last);

    let atr_ok = if p.atr_filter_enabled {
        let highs = highs_of(candles);
        let lows = lows_of(candles);
        let atr_now = last_value(&atr(&highs, &lows, &closes, p.atr_period));
        let atr_ma = indicators::atr_ma(&highs, &lows, &closes, p.atr_period, p.atr_ma_period);
        matches!((atr_now, atr_ma), (Some(a), Some(m)) if a >= m * p.atr_min_ratio)
    } else {
        true
    };

    let volume_ok = if p.volume_multiplier > 0.0 {
        volume_ma(candles, p.volume_ma_period)
            .map(|ma| last.volume >= p.volume_multiplier * ma)
            .unwrap_or(false)
    } else {
        true
    };

    let entry_ok = trend_up
        && pullback_ok
        && rsi_ok
        && atr_ok
        && volume_ok
        && (!p.require_candle_pattern || candle_ok);

    debug!(
        trend = trend_up,
        pullback = pullback_ok,
        rsi = rsi_now,
        atr = atr_ok,
        vol = volume_ok,
        "trend pullback check"
    );

    entry_ok
}

fn check_ema_momentum(candles: &[Candle], p: &EmaMomentumParams) -> bool {
    let Some(last) = candles.last() else {
        return false;
    };
    if candles.len() < 2 {
        return false;
    }

    let closes = closes_of(candles);
    let highs = highs_of(candles);
    let lows = lows_of(candles);

    let ema_fast = last_value(&ema(&closes, p.ema_fast));
    let ema_slow = last_value(&ema(&closes, p.ema_slow));
    let prev_fast = last_value(&ema(&closes[..closes.len() - 1], p.ema_fast));
    let prev_slow = last_value(&ema(&closes[..closes.len() - 1], p.ema_slow));
    let atr_now = last_value(&atr(&highs, &lows, &closes, p.atr_period));
    let rsi_now = last_value(&rsi(&closes, p.rsi_period));

    let (Some(ema_fast), Some(ema_slow), Some(prev_fast), Some(prev_slow), Some(atr_now), Some(rsi_now)) =
        (ema_fast, ema_slow, prev_fast, prev_slow, atr_now, rsi_now)
    else {
        return false;
    };

    let crossed = prev_fast <= prev_slow && ema_fast > ema_slow;
    let above_ema = last.close > ema_slow;
    let body_ok = last.body() > p.body_atr_mult * atr_now;
    let rsi_ok = rsi_now >= p.rsi_min && rsi_now <= p.rsi_max;

    let volume_ok = if p.volume_multiplier > 0.0 {
        volume_ma(candles, p.volume_ma_period)
            .map(|ma| last.volume >= p.volume_multiplier * ma)
            .unwrap_or(false)
    } else {
        true
    };

    debug!(
        crossed,
        above_ema,
        body = body_ok,
        rsi = rsi_now,
        vol = volume_ok,
        "ema momentum check"
    );

    crossed && (!p.require_above_ema || above_ema) && body_ok && rsi_ok && volume_ok
}

fn check_breakout(candles: &[Candle], p: &BreakoutParams) -> EntrySignal {
    let Some(last) = candles.last() else {
        return EntrySignal::hold();
    };
    if candles.len() < 2 {
        return EntrySignal::hold();
    }

    let closes = closes_of(candles);
    let ema_now = last_value(&ema(&closes, p.ema_period));
    let ema_prev = last_value(&ema(&closes[..closes.len() - 1], p.ema_period));
    let rsi_now = last_value(&rsi(&closes, p.rsi_period));
    // Highest high of the prior bars, excluding the breakout bar itself
    let breakout_high = highest_high(&candles[..candles.len() - 1], p.breakout_lookback);
    let vol_ma = volume_ma(candles, p.volume_ma_period);

    let (Some(ema_now), Some(ema_prev), Some(rsi_now), Some(breakout_high), Some(vol_ma)) =
        (ema_now, ema_prev, rsi_now, breakout_high, vol_ma)
    else {
        return EntrySignal::hold();
    };

    let ema_rising = ema_now > ema_prev;
    let vwap_ok = vwap(candles).map(|v| last.close > v).unwrap_or(false);
    let trend_ok = vwap_ok || ema_rising;
    let breakout_ok = last.close > breakout_high;
    let vol_ok = last.volume >= p.volume_multiplier * vol_ma;
    let rsi_ok = rsi_now >= p.rsi_min && rsi_now <= p.rsi_max;

    let enter = trend_ok && breakout_ok && vol_ok && rsi_ok;

    debug!(
        trend = trend_ok,
        breakout = breakout_ok,
        vol = vol_ok,
        rsi = rsi_now,
        level = breakout_high,
        "breakout check"
    );

    EntrySignal {
        enter,
        breakout_level: Some(breakout_high),
    }
}

fn check_core_trend(candles: &[Candle], p: &CoreTrendParams) -> bool {
    let [.., prev, last] = candles else {
        return false;
    };

    let closes = closes_of(candles);
    let highs = highs_of(candles);
    let lows = lows_of(candles);

    let ema_fast = last_value(&ema(&closes, p.ema_fast));
    let ema_slow = last_value(&ema(&closes, p.ema_slow));
    let adx_now = last_value(&adx(&highs, &lows, &closes, p.adx_period));
    let rsi_now = last_value(&rsi(&closes, p.rsi_period));

    let (Some(ema_fast), Some(ema_slow), Some(adx_now), Some(rsi_now)) =
        (ema_fast, ema_slow, adx_now, rsi_now)
    else {
        return false;
    };

    let trend_ok = ema_fast > ema_slow && last.close > ema_fast;
    let adx_ok = adx_now >= p.adx_min;
    let rsi_ok = rsi_now >= p.rsi_min && rsi_now <= p.rsi_max;
    let pullback = p.pullback_to_ema && prev.close < ema_fast && last.close > ema_fast;

    debug!(
        trend = trend_ok,
        adx = adx_now,
        rsi = rsi_now,
        pullback,
        "core trend check"
    );

    trend_ok && adx_ok && rsi_ok && pullback
}

fn check_swing_pullback(candles: &[Candle], p: &SwingPullbackParams) -> bool {
    let [.., prev, last] = candles else {
        return false;
    };

    let closes = closes_of(candles);
    let highs = highs_of(candles);
    let lows = lows_of(candles);

    let ema_fast = last_value(&ema(&closes, p.ema_fast));
    let ema_slow = last_value(&ema(&closes, p.ema_slow));
    let rsi_now = last_value(&rsi(&closes, p.rsi_period));
    let atr_now = last_value(&atr(&highs, &lows, &closes, p.atr_period));
    let swing_high = highest_high(&candles[..candles.len() - 1], p.swing_lookback);

    let (Some(ema_fast), Some(ema_slow), Some(rsi_now), Some(atr_now), Some(swing_high)) =
        (ema_fast, ema_slow, rsi_now, atr_now, swing_high)
    else {
        return false;
    };

    let trend_ok = ema_fast > ema_slow;
    let pullback_pct = (swing_high - last.close) / swing_high * 100.0;
    let pullback_ok = pullback_pct >= p.pullback_min_pct && pullback_pct <= p.pullback_max_pct;
    let rsi_ok = rsi_now >= p.rsi_min && rsi_now <= p.rsi_max;
    let atr_pct = atr_now / last.close * 100.0;
    let atr_ok = atr_pct >= p.atr_pct_min && atr_pct <= p.atr_pct_max;
    let reclaim = prev.close <= ema_fast && last.close > ema_fast && last.close > last.open;

    debug!(
        trend = trend_ok,
        pullback_pct,
        rsi = rsi_now,
        atr_pct,
        reclaim,
        "swing pullback check"
    );

    trend_ok && pullback_ok && rsi_ok && atr_ok && reclaim
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn mk(open: f64, high: f64, low: f64, close: f64, volume: f64, i: usize) -> Candle {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Candle {
            open_time: start + Duration::minutes(15 * i as i64),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    fn flat_series(n: usize, price: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| mk(price, price + 0.1, price - 0.1, price, 1_000.0, i))
            .collect()
    }

    #[test]
    fn test_golden_cross_fires_on_cross_bar_only() {
        let p = GoldenCrossParams {
            ma_fast_period: 3,
            ma_slow_period: 6,
        };

        // Decline then a sharp spike: the fast SMA crosses over the slow one
        let mut candles = Vec::new();
        for (i, &price) in [10.0, 9.8, 9.6, 9.4, 9.2, 9.0, 8.8, 8.6, 8.4, 8.2, 13.0]
            .iter()
            .enumerate()
        {
            candles.push(mk(price, price + 0.1, price - 0.1, price, 1_000.0, i));
        }

        assert!(check_golden_cross(&candles, &p));

        // One bar later the fast MA is already above: no fresh cross
        candles.push(mk(14.0, 14.1, 13.9, 14.0, 1_000.0, candles.len()));
        assert!(!check_golden_cross(&candles, &p));
    }

    #[test]
    fn test_breakout_records_level() {
        let p = BreakoutParams {
            ema_period: 3,
            rsi_period: 3,
            rsi_min: 0.0,
            rsi_max: 100.0,
            breakout_lookback: 5,
            volume_multiplier: 1.0,
            volume_ma_period: 3,
        };

        // Rising series whose final bar clears the prior 5-bar high on volume
        let mut candles = Vec::new();
        for i in 0..10 {
            let base = 100.0 + i as f64 * 0.2;
            candles.push(mk(base, base + 0.3, base - 0.3, base + 0.1, 1_000.0, i));
        }
        let prior_high = highest_high(&candles[..candles.len() - 1], 5).unwrap();
        let n = candles.len();
        candles.push(mk(102.0, 104.0, 101.9, 103.9, 2_000.0, n));

        let signal = check_breakout(&candles, &p);
        assert!(signal.enter);
        // The recorded level is the high of the bars preceding the entry bar
        let level = signal.breakout_level.unwrap();
        assert!(level >= prior_high);
        assert!(103.9 > level);
    }

    #[test]
    fn test_breakout_requires_volume() {
        let p = BreakoutParams {
            ema_period: 3,
            rsi_period: 3,
            rsi_min: 0.0,
            rsi_max: 100.0,
            breakout_lookback: 5,
            volume_multiplier: 2.0,
            volume_ma_period: 3,
        };

        let mut candles = Vec::new();
        for i in 0..10 {
            let base = 100.0 + i as f64 * 0.2;
            candles.push(mk(base, base + 0.3, base - 0.3, base + 0.1, 1_000.0, i));
        }
        let n = candles.len();
        // Breaks the high but on thin volume
        candles.push(mk(102.0, 104.0, 101.9, 103.9, 1_100.0, n));

        assert!(!check_breakout(&candles, &p).enter);
    }

    #[test]
    fn test_core_trend_requires_pullback_reclaim() {
        let p = CoreTrendParams {
            ema_fast: 5,
            ema_slow: 10,
            adx_period: 5,
            adx_min: 15.0,
            rsi_period: 5,
            rsi_min: 0.0,
            rsi_max: 100.0,
            pullback_to_ema: true,
        };

        // Steady uptrend without any dip: no reclaim bar, no entry
        let mut candles = Vec::new();
        for i in 0..40 {
            let base = 100.0 + i as f64;
            candles.push(mk(base, base + 0.5, base - 0.5, base + 0.3, 1_000.0, i));
        }
        assert!(!check_core_trend(&candles, &p));
    }

    #[test]
    fn test_flat_market_yields_no_signals() {
        let candles = flat_series(60, 100.0);

        let trend = TrendPullbackParams {
            ma_fast_period: 5,
            ma_slow_period: 20,
            pullback_min_pct: 1.0,
            pullback_max_pct: 2.0,
            rsi_period: 5,
            rsi_min: 50.0,
            rsi_max: 60.0,
            require_candle_pattern: false,
            atr_filter_enabled: false,
            atr_period: 5,
            atr_ma_period: 5,
            atr_min_ratio: 0.7,
            volume_multiplier: 0.0,
            volume_ma_period: 5,
        };
        assert!(!check_trend_pullback(&candles, &trend));

        let momentum = EmaMomentumParams {
            ema_fast: 5,
            ema_slow: 10,
            atr_period: 5,
            body_atr_mult: 0.7,
            rsi_period: 5,
            rsi_min: 45.0,
            rsi_max: 55.0,
            require_above_ema: true,
            volume_multiplier: 0.0,
            volume_ma_period: 5,
        };
        assert!(!check_ema_momentum(&candles, &momentum));
    }

    #[test]
    fn test_short_series_never_panics() {
        let candles = flat_series(1, 100.0);
        let preset = EntryPreset::SwingPullback(SwingPullbackParams {
            ema_fast: 5,
            ema_slow: 10,
            rsi_period: 5,
            rsi_min: 0.0,
            rsi_max: 100.0,
            atr_period: 5,
            atr_pct_min: 0.0,
            atr_pct_max: 100.0,
            swing_lookback: 5,
            pullback_min_pct: 0.0,
            pullback_max_pct: 100.0,
        });
        assert!(!evaluate_entry(&candles, &preset).enter);
        assert!(!evaluate_entry(&[], &preset).enter);
    }
}
