//! Exit preset registry.
//!
//! The built-in table holds eight percentage presets keyed by numeric id.
//! Table values are whole-number percentages (1.2 means 1.2%); resolution
//! converts them to fractional rates. Deprecated ids remap to canonical ones
//! through the alias table, and unknown ids fall back to the caller-supplied
//! base configuration.

use serde::{Deserialize, Serialize};

/// Percentage-based exit parameters as stored in the registry
/// (whole-number percentages).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentExitParams {
    pub sl: f64,
    pub tp: f64,
    pub trail_start: f64,
    pub trail_distance: f64,
    /// Required red-body strength vs the previous bar, in percent
    pub candle_red: f64,
}

/// ATR-based exit parameters, defined by layer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrExitParams {
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    pub initial_atr_mult: f64,
    /// Fixed target at entry + R * take_profit_r; None means no fixed target
    #[serde(default)]
    pub take_profit_r: Option<f64>,
    #[serde(default)]
    pub trail_start_r: Option<f64>,
    #[serde(default = "default_trail_atr_mult")]
    pub trail_atr_mult: f64,
    #[serde(default)]
    pub trend_exit_fast_ema: Option<usize>,
    #[serde(default)]
    pub trend_exit_slow_ema: Option<usize>,
    #[serde(default)]
    pub time_stop_bars: Option<usize>,
    #[serde(default)]
    pub time_stop_min_r: f64,
    #[serde(default)]
    pub invalidation_bars: Option<usize>,
}

fn default_atr_period() -> usize {
    14
}

fn default_trail_atr_mult() -> f64 {
    1.0
}

/// One exit preset: either stop model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ExitPreset {
    Percent(PercentExitParams),
    Atr(AtrExitParams),
}

/// Resolved percentage exit configuration as fractional rates, ready for
/// the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitParams {
    pub sl_pct: f64,
    pub tp_pct: f64,
    pub trail_start_pct: f64,
    pub trail_distance_pct: f64,
    pub candle_exit_enabled: bool,
    pub candle_red_trigger_pct: f64,
}

struct PresetDef {
    id: u32,
    name: &'static str,
    params: PercentExitParams,
}

const fn def(
    id: u32,
    name: &'static str,
    sl: f64,
    tp: f64,
    trail_start: f64,
    trail_distance: f64,
    candle_red: f64,
) -> PresetDef {
    PresetDef {
        id,
        name,
        params: PercentExitParams {
            sl,
            tp,
            trail_start,
            trail_distance,
            candle_red,
        },
    }
}

const EXIT_PRESETS: &[PresetDef] = &[
    def(1, "Conservative", 1.2, 2.4, 1.2, 0.6, 60.0),
    def(2, "Aggressive Trend", 0.9, 3.2, 1.6, 0.8, 40.0),
    def(3, "Safe Scalping", 0.6, 1.2, 0.8, 0.4, 50.0),
    def(4, "Momentum Rider", 1.0, 4.0, 2.0, 1.0, 30.0),
    def(5, "ATR Mixed (semi-dynamic)", 0.6, 1.4, 2.0, 1.0, 40.0),
    def(6, "Volatility Shield", 1.5, 2.5, 2.2, 1.2, 70.0),
    def(7, "Breakout Mode", 0.8, 5.0, 3.0, 1.5, 20.0),
    def(8, "Ultra Tight", 0.4, 0.8, 0.6, 0.3, 35.0),
];

/// Remap deprecated preset ids to their canonical replacements.
fn canonical_exit_id(id: u32) -> u32 {
    match id {
        9 => 5,
        10 => 7,
        other => other,
    }
}

fn preset_def(id: u32) -> Option<&'static PresetDef> {
    let id = canonical_exit_id(id);
    EXIT_PRESETS.iter().find(|p| p.id == id)
}

/// Look up a registry preset by id (after alias remapping).
pub fn exit_preset_by_id(id: u32) -> Option<(u32, &'static str, &'static PercentExitParams)> {
    preset_def(id).map(|p| (p.id, p.name, &p.params))
}

/// Human-readable label for log lines.
pub fn describe_exit_preset(id: Option<u32>) -> String {
    match id {
        Some(id) => match preset_def(id) {
            Some(p) => format!("{} ({})", p.id, p.name),
            None => id.to_string(),
        },
        None => "n/a".to_string(),
    }
}

/// Resolve a numeric exit preset id into fractional exit parameters.
///
/// Registry percentages are divided by 100; the candle-exit enable flag
/// always comes from the base configuration. Unknown ids return the base
/// configuration unchanged. Resolution is idempotent: the same id and base
/// always produce the same output.
pub fn resolve_exit_preset_config(exit_preset_id: Option<u32>, base: &ExitParams) -> ExitParams {
    let Some(def) = exit_preset_id.and_then(preset_def) else {
        return base.clone();
    };

    ExitParams {
        sl_pct: def.params.sl / 100.0,
        tp_pct: def.params.tp / 100.0,
        trail_start_pct: def.params.trail_start / 100.0,
        trail_distance_pct: def.params.trail_distance / 100.0,
        candle_exit_enabled: base.candle_exit_enabled,
        candle_red_trigger_pct: def.params.candle_red / 100.0,
    }
}

/// Resolve a layer's exit binding into the state machine's inputs: the
/// fractional percentage parameters plus, for ATR-model presets, the ATR
/// parameter bundle. A custom preset on the layer wins over a registry id.
pub fn resolve_layer_exit(
    custom: Option<&ExitPreset>,
    exit_preset_id: Option<u32>,
    base: &ExitParams,
) -> (ExitParams, Option<AtrExitParams>) {
    match custom {
        Some(ExitPreset::Atr(atr)) => (base.clone(), Some(atr.clone())),
        Some(ExitPreset::Percent(p)) => (
            ExitParams {
                sl_pct: p.sl / 100.0,
                tp_pct: p.tp / 100.0,
                trail_start_pct: p.trail_start / 100.0,
                trail_distance_pct: p.trail_distance / 100.0,
                candle_exit_enabled: base.candle_exit_enabled,
                candle_red_trigger_pct: p.candle_red / 100.0,
            },
            None,
        ),
        None => (resolve_exit_preset_config(exit_preset_id, base), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ExitParams {
        ExitParams {
            sl_pct: 0.012,
            tp_pct: 0.024,
            trail_start_pct: 0.012,
            trail_distance_pct: 0.006,
            candle_exit_enabled: true,
            candle_red_trigger_pct: 0.4,
        }
    }

    #[test]
    fn test_resolution_converts_to_fractions() {
        let resolved = resolve_exit_preset_config(Some(1), &base());
        assert_eq!(resolved.sl_pct, 0.012);
        assert_eq!(resolved.tp_pct, 0.024);
        assert_eq!(resolved.trail_start_pct, 0.012);
        assert_eq!(resolved.trail_distance_pct, 0.006);
        assert_eq!(resolved.candle_red_trigger_pct, 0.6);
        assert!(resolved.candle_exit_enabled);
    }

    #[test]
    fn test_unknown_id_falls_back_to_base() {
        let resolved = resolve_exit_preset_config(Some(99), &base());
        assert_eq!(resolved, base());

        let resolved = resolve_exit_preset_config(None, &base());
        assert_eq!(resolved, base());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let a = resolve_exit_preset_config(Some(7), &base());
        let b = resolve_exit_preset_config(Some(7), &base());
        assert_eq!(a, b);
    }

    #[test]
    fn test_deprecated_ids_remap() {
        let nine = resolve_exit_preset_config(Some(9), &base());
        let five = resolve_exit_preset_config(Some(5), &base());
        assert_eq!(nine, five);

        let (id, name, _) = exit_preset_by_id(10).unwrap();
        assert_eq!(id, 7);
        assert_eq!(name, "Breakout Mode");
    }

    #[test]
    fn test_enable_flag_always_from_base() {
        let mut b = base();
        b.candle_exit_enabled = false;
        let resolved = resolve_exit_preset_config(Some(2), &b);
        assert!(!resolved.candle_exit_enabled);
    }

    #[test]
    fn test_layer_exit_resolution() {
        // Custom ATR preset keeps the base percentage params for the gate
        let atr = ExitPreset::Atr(AtrExitParams {
            atr_period: 14,
            initial_atr_mult: 2.0,
            take_profit_r: Some(3.0),
            trail_start_r: Some(1.0),
            trail_atr_mult: 1.5,
            trend_exit_fast_ema: Some(9),
            trend_exit_slow_ema: Some(21),
            time_stop_bars: Some(12),
            time_stop_min_r: 0.5,
            invalidation_bars: Some(6),
        });
        let (params, atr_params) = resolve_layer_exit(Some(&atr), Some(3), &base());
        assert_eq!(params, base());
        assert_eq!(atr_params.unwrap().initial_atr_mult, 2.0);

        // Custom percent preset converts whole numbers to fractions
        let pct = ExitPreset::Percent(PercentExitParams {
            sl: 2.0,
            tp: 4.0,
            trail_start: 2.0,
            trail_distance: 1.0,
            candle_red: 50.0,
        });
        let (params, atr_params) = resolve_layer_exit(Some(&pct), None, &base());
        assert!(atr_params.is_none());
        assert_eq!(params.sl_pct, 0.02);
        assert_eq!(params.candle_red_trigger_pct, 0.5);

        // No custom preset: fall through to the registry
        let (params, _) = resolve_layer_exit(None, Some(8), &base());
        assert_eq!(params.sl_pct, 0.004);
    }
}
