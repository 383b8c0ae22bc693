//! Macro regime classifier for layer eligibility.
//!
//! A deliberately simpler classifier than the rule engine: EMA 50/200
//! relationship, ADX trend strength and an ATR% volatility bucket. The
//! portfolio engine maps its output onto the set of layers allowed to open
//! positions this cycle.

use serde::{Deserialize, Serialize};

use crate::indicators;
use crate::types::Candle;

/// Macro market condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MacroRegime {
    Trend,
    Range,
    Volatile,
    Off,
}

impl std::fmt::Display for MacroRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MacroRegime::Trend => "TREND",
            MacroRegime::Range => "RANGE",
            MacroRegime::Volatile => "VOLATILE",
            MacroRegime::Off => "OFF",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroRegimeConfig {
    pub min_candles: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub adx_period: usize,
    pub adx_trend_min: f64,
    pub adx_chop_max: f64,
    pub atr_period: usize,
    /// ATR as percent of price above which the market counts as volatile
    pub atr_pct_high: f64,
}

impl Default for MacroRegimeConfig {
    fn default() -> Self {
        MacroRegimeConfig {
            min_candles: 220,
            ema_fast: 50,
            ema_slow: 200,
            adx_period: 14,
            adx_trend_min: 18.0,
            adx_chop_max: 16.0,
            atr_period: 14,
            atr_pct_high: 1.2,
        }
    }
}

/// Classify the benchmark series. Anything short or unreadable is `Off`.
pub fn classify_macro_regime(candles: &[Candle], cfg: &MacroRegimeConfig) -> MacroRegime {
    if candles.len() < cfg.min_candles {
        return MacroRegime::Off;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();

    let price = match closes.last() {
        Some(&p) if p > 0.0 && p.is_finite() => p,
        _ => return MacroRegime::Off,
    };

    let fast = indicators::last_value(&indicators::ema(&closes, cfg.ema_fast));
    let slow = indicators::last_value(&indicators::ema(&closes, cfg.ema_slow));
    let atr = indicators::last_value(&indicators::atr(&highs, &lows, &closes, cfg.atr_period));
    let adx = indicators::last_value(&indicators::adx(&highs, &lows, &closes, cfg.adx_period));

    let (Some(fast), Some(slow), Some(atr), Some(adx)) = (fast, slow, atr, adx) else {
        return MacroRegime::Off;
    };

    let vol_pct = atr / price * 100.0;
    if vol_pct > cfg.atr_pct_high {
        return MacroRegime::Volatile;
    }

    if fast > slow && adx >= cfg.adx_trend_min {
        return MacroRegime::Trend;
    }

    MacroRegime::Range
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn candles_with(n: usize, step: f64, range: f64) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let base = 100.0 + step * i as f64;
                Candle {
                    open_time: start + Duration::hours(i as i64),
                    open: base,
                    high: base + range,
                    low: base - range,
                    close: base + range * 0.25,
                    volume: 1_000.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_off_below_min_candles() {
        let cfg = MacroRegimeConfig::default();
        let candles = candles_with(100, 0.1, 0.5);
        assert_eq!(classify_macro_regime(&candles, &cfg), MacroRegime::Off);
    }

    #[test]
    fn test_steady_uptrend_classifies_trend() {
        let cfg = MacroRegimeConfig::default();
        // Rising closes with a tight range keep ATR% small and ADX high
        let candles = candles_with(240, 0.2, 0.4);
        assert_eq!(classify_macro_regime(&candles, &cfg), MacroRegime::Trend);
    }

    #[test]
    fn test_wide_ranges_classify_volatile() {
        let cfg = MacroRegimeConfig::default();
        // ATR around 10 on a price near 100 => ~10% volatility
        let candles = candles_with(240, 0.05, 5.0);
        assert_eq!(classify_macro_regime(&candles, &cfg), MacroRegime::Volatile);
    }

    #[test]
    fn test_flat_market_classifies_range() {
        let cfg = MacroRegimeConfig::default();
        let candles = candles_with(240, 0.0, 0.4);
        assert_eq!(classify_macro_regime(&candles, &cfg), MacroRegime::Range);
    }
}
