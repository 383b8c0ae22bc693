//! Entry preset registry.
//!
//! Each entry family is a variant of [`EntryPreset`] carrying only its own
//! parameters; evaluation dispatches by `match`. Canonical presets are keyed
//! by [`EntryPresetKey`]; the numeric strategy ids used by operator config
//! and older state files map onto canonical keys through an explicit alias
//! table.

use serde::{Deserialize, Serialize};

/// Canonical entry preset keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryPresetKey {
    TrendConservative,
    TrendAggressive,
    SwingDeepPullback,
    Breakout,
    Scalping,
}

impl EntryPresetKey {
    /// The numeric id shown to operators and stored in state files.
    pub fn display_id(&self) -> u32 {
        match self {
            EntryPresetKey::TrendConservative => 101,
            EntryPresetKey::TrendAggressive => 102,
            EntryPresetKey::Scalping => 103,
            EntryPresetKey::SwingDeepPullback => 104,
            EntryPresetKey::Breakout => 105,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntryPresetKey::TrendConservative => "Trend Conservative",
            EntryPresetKey::TrendAggressive => "Trend Aggressive",
            EntryPresetKey::Scalping => "Scalping / Micro-Momentum",
            EntryPresetKey::SwingDeepPullback => "Swing Deep Pullback",
            EntryPresetKey::Breakout => "Breakout",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPresetKey::TrendConservative => "TREND_CONSERVATIVE",
            EntryPresetKey::TrendAggressive => "TREND_AGGRESSIVE",
            EntryPresetKey::Scalping => "SCALPING",
            EntryPresetKey::SwingDeepPullback => "SWING_DEEP_PULLBACK",
            EntryPresetKey::Breakout => "BREAKOUT",
        }
    }

    /// Map a numeric strategy id to a canonical key. Ids 2/3 and the retired
    /// 106-108 series are legacy aliases; canonical ids map to themselves.
    /// Id 1 (golden cross) is handled separately and unknown ids are a
    /// caller error.
    pub fn from_strategy_id(id: u32) -> Option<EntryPresetKey> {
        let canonical = match id {
            2 => 101,
            3 => 103,
            106 => 103,
            107 => 102,
            108 => 103,
            other => other,
        };
        match canonical {
            101 => Some(EntryPresetKey::TrendConservative),
            102 => Some(EntryPresetKey::TrendAggressive),
            103 => Some(EntryPresetKey::Scalping),
            104 => Some(EntryPresetKey::SwingDeepPullback),
            105 => Some(EntryPresetKey::Breakout),
            _ => None,
        }
    }
}

/// Trend filter + pullback band reclaim + RSI, with optional candle
/// pattern, ATR and volume filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPullbackParams {
    pub ma_fast_period: usize,
    pub ma_slow_period: usize,
    pub pullback_min_pct: f64,
    pub pullback_max_pct: f64,
    pub rsi_period: usize,
    pub rsi_min: f64,
    pub rsi_max: f64,
    pub require_candle_pattern: bool,
    pub atr_filter_enabled: bool,
    pub atr_period: usize,
    pub atr_ma_period: usize,
    pub atr_min_ratio: f64,
    /// 0.0 disables the volume surge filter
    pub volume_multiplier: f64,
    pub volume_ma_period: usize,
}

/// EMA cross with a minimum candle body relative to ATR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaMomentumParams {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub atr_period: usize,
    pub body_atr_mult: f64,
    pub rsi_period: usize,
    pub rsi_min: f64,
    pub rsi_max: f64,
    pub require_above_ema: bool,
    pub volume_multiplier: f64,
    pub volume_ma_period: usize,
}

/// Break of the prior N-bar high with trend and volume confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutParams {
    pub ema_period: usize,
    pub rsi_period: usize,
    pub rsi_min: f64,
    pub rsi_max: f64,
    pub breakout_lookback: usize,
    pub volume_multiplier: f64,
    pub volume_ma_period: usize,
}

/// ADX-confirmed trend with an EMA pullback reclaim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreTrendParams {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub adx_period: usize,
    pub adx_min: f64,
    pub rsi_period: usize,
    pub rsi_min: f64,
    pub rsi_max: f64,
    pub pullback_to_ema: bool,
}

/// EMA trend + percentage pullback off an N-bar swing high within an ATR%
/// band, entered on a bullish reclaim bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwingPullbackParams {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_period: usize,
    pub rsi_min: f64,
    pub rsi_max: f64,
    pub atr_period: usize,
    pub atr_pct_min: f64,
    pub atr_pct_max: f64,
    pub swing_lookback: usize,
    pub pullback_min_pct: f64,
    pub pullback_max_pct: f64,
}

/// Fast/slow SMA cross, kept for strategy id 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenCrossParams {
    pub ma_fast_period: usize,
    pub ma_slow_period: usize,
}

/// One entry family with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum EntryPreset {
    GoldenCross(GoldenCrossParams),
    TrendPullback(TrendPullbackParams),
    EmaMomentum(EmaMomentumParams),
    Breakout(BreakoutParams),
    CoreTrend(CoreTrendParams),
    SwingPullback(SwingPullbackParams),
}

impl EntryPreset {
    /// Minimum candle history required to evaluate this preset: the maximum
    /// of every period it references (floor 2).
    pub fn min_candles(&self) -> usize {
        match self {
            EntryPreset::GoldenCross(p) => p.ma_fast_period.max(p.ma_slow_period).max(2),
            EntryPreset::TrendPullback(p) => p
                .ma_slow_period
                .max(p.rsi_period + 1)
                .max(p.atr_period + p.atr_ma_period)
                .max(p.volume_ma_period)
                .max(2),
            EntryPreset::EmaMomentum(p) => p
                .ema_slow
                .max(p.rsi_period + 1)
                .max(p.atr_period + 1)
                .max(p.volume_ma_period)
                .max(2),
            EntryPreset::Breakout(p) => p
                .breakout_lookback
                .max(p.ema_period)
                .max(p.rsi_period + 1)
                .max(p.volume_ma_period)
                .max(2),
            EntryPreset::CoreTrend(p) => p
                .ema_slow
                .max(2 * p.adx_period)
                .max(p.rsi_period + 1)
                .max(2),
            EntryPreset::SwingPullback(p) => p
                .ema_slow
                .max(p.rsi_period + 1)
                .max(p.atr_period + 1)
                .max(p.swing_lookback + 1)
                .max(2),
        }
    }
}

/// A preset resolved for evaluation: identity, parameters and the derived
/// history requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntryPreset {
    pub id: String,
    pub name: String,
    pub preset: EntryPreset,
    pub min_candles: usize,
}

fn builtin(key: EntryPresetKey) -> EntryPreset {
    match key {
        EntryPresetKey::TrendConservative => EntryPreset::TrendPullback(TrendPullbackParams {
            ma_fast_period: 20,
            ma_slow_period: 200,
            pullback_min_pct: 1.0,
            pullback_max_pct: 2.0,
            rsi_period: 14,
            rsi_min: 50.0,
            rsi_max: 60.0,
            require_candle_pattern: true,
            atr_filter_enabled: true,
            atr_period: 14,
            atr_ma_period: 14,
            atr_min_ratio: 0.7,
            volume_multiplier: 0.0,
            volume_ma_period: 10,
        }),
        EntryPresetKey::TrendAggressive => EntryPreset::TrendPullback(TrendPullbackParams {
            ma_fast_period: 10,
            ma_slow_period: 50,
            pullback_min_pct: 2.5,
            pullback_max_pct: 4.0,
            rsi_period: 14,
            rsi_min: 55.0,
            rsi_max: 70.0,
            require_candle_pattern: false,
            atr_filter_enabled: false,
            atr_period: 14,
            atr_ma_period: 14,
            atr_min_ratio: 0.7,
            volume_multiplier: 1.2,
            volume_ma_period: 10,
        }),
        EntryPresetKey::SwingDeepPullback => EntryPreset::TrendPullback(TrendPullbackParams {
            ma_fast_period: 50,
            ma_slow_period: 200,
            pullback_min_pct: 3.0,
            pullback_max_pct: 6.0,
            rsi_period: 14,
            rsi_min: 28.0,
            rsi_max: 40.0,
            require_candle_pattern: false,
            atr_filter_enabled: true,
            atr_period: 14,
            atr_ma_period: 14,
            atr_min_ratio: 0.7,
            volume_multiplier: 0.0,
            volume_ma_period: 10,
        }),
        EntryPresetKey::Breakout => EntryPreset::Breakout(BreakoutParams {
            ema_period: 20,
            rsi_period: 14,
            rsi_min: 60.0,
            rsi_max: 80.0,
            breakout_lookback: 20,
            volume_multiplier: 1.3,
            volume_ma_period: 10,
        }),
        EntryPresetKey::Scalping => EntryPreset::EmaMomentum(EmaMomentumParams {
            ema_fast: 9,
            ema_slow: 21,
            atr_period: 14,
            body_atr_mult: 0.7,
            rsi_period: 14,
            rsi_min: 45.0,
            rsi_max: 55.0,
            require_above_ema: true,
            volume_multiplier: 1.1,
            volume_ma_period: 10,
        }),
    }
}

/// Resolve a numeric strategy id to an evaluable preset. Id 1 builds the
/// legacy golden cross from the base MA periods; every other id goes through
/// the alias table. `None` means the id is unknown and the symbol should be
/// skipped.
pub fn resolve_entry_preset(
    strategy_id: u32,
    base_fast_ma: usize,
    base_slow_ma: usize,
) -> Option<ResolvedEntryPreset> {
    if strategy_id == 1 {
        let preset = EntryPreset::GoldenCross(GoldenCrossParams {
            ma_fast_period: base_fast_ma,
            ma_slow_period: base_slow_ma,
        });
        let min_candles = preset.min_candles();
        return Some(ResolvedEntryPreset {
            id: "L1".to_string(),
            name: "Legacy Golden Cross".to_string(),
            preset,
            min_candles,
        });
    }

    let key = EntryPresetKey::from_strategy_id(strategy_id)?;
    let preset = builtin(key);
    let min_candles = preset.min_candles();
    Some(ResolvedEntryPreset {
        id: key.as_str().to_string(),
        name: key.name().to_string(),
        preset,
        min_candles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_table_maps_legacy_ids() {
        assert_eq!(
            EntryPresetKey::from_strategy_id(2),
            Some(EntryPresetKey::TrendConservative)
        );
        assert_eq!(
            EntryPresetKey::from_strategy_id(101),
            Some(EntryPresetKey::TrendConservative)
        );
        assert_eq!(
            EntryPresetKey::from_strategy_id(108),
            Some(EntryPresetKey::Scalping)
        );
        assert_eq!(EntryPresetKey::from_strategy_id(999), None);
    }

    #[test]
    fn test_legacy_and_canonical_resolve_identically() {
        let via_alias = resolve_entry_preset(2, 25, 100).unwrap();
        let canonical = resolve_entry_preset(101, 25, 100).unwrap();
        assert_eq!(via_alias.preset, canonical.preset);
        assert_eq!(via_alias.id, "TREND_CONSERVATIVE");
    }

    #[test]
    fn test_min_candles_dominated_by_slow_ma() {
        let resolved = resolve_entry_preset(101, 25, 100).unwrap();
        assert_eq!(resolved.min_candles, 200);
    }

    #[test]
    fn test_min_candles_scalping() {
        // SCALPING: ema_slow 21 dominates (rsi+1 = 15, atr+1 = 15, vol 10)
        let resolved = resolve_entry_preset(103, 25, 100).unwrap();
        assert_eq!(resolved.min_candles, 21);
    }

    #[test]
    fn test_golden_cross_uses_base_periods() {
        let resolved = resolve_entry_preset(1, 12, 50).unwrap();
        match resolved.preset {
            EntryPreset::GoldenCross(ref p) => {
                assert_eq!(p.ma_fast_period, 12);
                assert_eq!(p.ma_slow_period, 50);
            }
            _ => panic!("expected golden cross"),
        }
        assert_eq!(resolved.min_candles, 50);
    }

    #[test]
    fn test_unknown_id_is_none() {
        assert!(resolve_entry_preset(42, 25, 100).is_none());
    }
}
