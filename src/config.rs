//! Configuration management
//!
//! A JSON config file describes one or more markets, each with its own
//! universe, regime settings, portfolio layers and runtime overrides. The
//! runtime subset is hot-reloadable through [`RuntimeConfig::apply_update`],
//! which validates every field against fixed allow-lists or bounds and keeps
//! the prior value when an override is rejected.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::presets::entry::{resolve_entry_preset, EntryPreset};
use crate::presets::exit::{ExitParams, ExitPreset};
use crate::regime::engine::RegimeSettings;
use crate::regime::macro_classifier::MacroRegimeConfig;
use crate::timeframe::Timeframe;

/// Strategy ids an operator may activate.
pub const ALLOWED_STRATEGY_IDS: &[u32] = &[1, 2, 3, 101, 102, 103, 104, 105];

/// Cycle intervals an operator may select (ms).
pub const ALLOWED_LOOP_INTERVALS_MS: &[u64] = &[60_000, 300_000, 900_000];

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
    pub markets: Vec<MarketConfig>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_initial_capital() -> f64 {
    100_000.0
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.markets.is_empty() {
            anyhow::bail!("config needs at least one market");
        }
        for market in &self.markets {
            market.validate()?;
        }
        Ok(())
    }
}

/// Per-market configuration. Each market loop gets its own independent copy
/// so one market's runtime overrides can never leak into another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    pub key: String,
    #[serde(default = "default_quote")]
    pub quote: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_max_symbols")]
    pub max_symbols: usize,
    #[serde(default)]
    pub timeframe: Timeframe,
    #[serde(default = "default_klines_limit")]
    pub klines_limit: usize,
    #[serde(default = "default_fast_ma")]
    pub fast_ma: usize,
    #[serde(default = "default_slow_ma")]
    pub slow_ma: usize,
    /// Fraction of free quote cash spent per entry outside layered markets
    #[serde(default = "default_quote_order_fraction")]
    pub quote_order_fraction: f64,
    #[serde(default)]
    pub kill_switch: bool,
    /// Venues with trading sessions skip entries while closed
    #[serde(default)]
    pub session_gated: bool,
    #[serde(default = "default_exit_params")]
    pub exit: ExitParams,
    #[serde(default)]
    pub regime: RegimeSettings,
    #[serde(default)]
    pub macro_regime: MacroRegimeConfig,
    #[serde(default)]
    pub layers: Vec<LayerConfig>,
    /// Macro regime name -> layer ids allowed to open positions
    #[serde(default)]
    pub regime_layer_rules: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub global_risk: GlobalRiskConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

fn default_quote() -> String {
    "USDT".to_string()
}

fn default_max_symbols() -> usize {
    10
}

fn default_klines_limit() -> usize {
    250
}

fn default_fast_ma() -> usize {
    25
}

fn default_slow_ma() -> usize {
    100
}

fn default_quote_order_fraction() -> f64 {
    0.5
}

fn default_exit_params() -> ExitParams {
    ExitParams {
        sl_pct: 0.012,
        tp_pct: 0.024,
        trail_start_pct: 0.012,
        trail_distance_pct: 0.006,
        candle_exit_enabled: true,
        candle_red_trigger_pct: 0.4,
    }
}

impl MarketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            anyhow::bail!("market key must not be empty");
        }
        if !ALLOWED_STRATEGY_IDS.contains(&self.runtime.active_strategy_id) {
            anyhow::bail!(
                "market {}: strategy id {} is not allow-listed",
                self.key,
                self.runtime.active_strategy_id
            );
        }
        if !ALLOWED_LOOP_INTERVALS_MS.contains(&self.runtime.loop_interval_ms) {
            anyhow::bail!(
                "market {}: loop interval {} ms is not allow-listed",
                self.key,
                self.runtime.loop_interval_ms
            );
        }
        for layer in &self.layers {
            layer.validate(&self.key)?;
        }
        Ok(())
    }

    /// Exit parameters with any runtime overrides applied.
    pub fn effective_exit(&self) -> ExitParams {
        let r = &self.runtime;
        ExitParams {
            sl_pct: r.sl_pct.unwrap_or(self.exit.sl_pct),
            tp_pct: r.tp_pct.unwrap_or(self.exit.tp_pct),
            trail_start_pct: r.trail_start_pct.unwrap_or(self.exit.trail_start_pct),
            trail_distance_pct: r.trail_distance_pct.unwrap_or(self.exit.trail_distance_pct),
            candle_exit_enabled: r
                .candle_exit_enabled
                .unwrap_or(self.exit.candle_exit_enabled),
            candle_red_trigger_pct: r
                .candle_red_trigger_pct
                .unwrap_or(self.exit.candle_red_trigger_pct),
        }
    }
}

/// Portfolio-wide risk controls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalRiskConfig {
    /// Aggregate daily drawdown (percent of equity) that disables all
    /// layers for the cycle; 0 disables the breaker
    #[serde(default)]
    pub daily_stop_pct: f64,
    /// Global open-position ceiling; defaults to the sum of layer ceilings
    #[serde(default)]
    pub max_open_positions: Option<usize>,
}

/// One risk-isolated capital layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Fraction of equity allocated to this layer (0, 1]
    pub allocation_pct: f64,
    /// Percent (whole number) of the layer allocation risked per trade
    pub max_risk_per_trade_pct: f64,
    pub max_open_positions: usize,
    /// Numeric strategy binding; resolved through the entry registry
    #[serde(default)]
    pub entry_strategy_id: Option<u32>,
    /// Custom entry preset carried by the layer itself
    #[serde(default)]
    pub entry_preset_id: Option<String>,
    #[serde(default)]
    pub entry_preset: Option<EntryPreset>,
    /// Registry exit preset id
    #[serde(default)]
    pub exit_preset_id: Option<u32>,
    /// Custom exit preset (percentage or ATR model)
    #[serde(default)]
    pub exit_preset: Option<ExitPreset>,
    #[serde(default)]
    pub timeframe: Option<Timeframe>,
    #[serde(default)]
    pub loss_stop_daily_pct: f64,
    #[serde(default)]
    pub loss_stop_weekly_pct: f64,
    #[serde(default)]
    pub cooldown_hours_after_stop: f64,
}

impl LayerConfig {
    /// Layer ids compare case-insensitively and trimmed.
    pub fn normalized_id(&self) -> String {
        normalize_layer_id(&self.id)
    }

    fn validate(&self, market: &str) -> Result<()> {
        if self.normalized_id().is_empty() {
            anyhow::bail!("market {}: layer id must not be empty", market);
        }
        if !(self.allocation_pct > 0.0 && self.allocation_pct <= 1.0) {
            anyhow::bail!(
                "market {}: layer {} allocation_pct {} out of (0, 1]",
                market,
                self.id,
                self.allocation_pct
            );
        }
        if let Some(id) = self.entry_strategy_id {
            if self.entry_preset.is_none() && resolve_entry_preset(id, 25, 100).is_none() {
                anyhow::bail!(
                    "market {}: layer {} references unknown strategy id {}",
                    market,
                    self.id,
                    id
                );
            }
        }
        Ok(())
    }
}

/// Normalize a layer id: trimmed, uppercase, empty when not a real id.
pub fn normalize_layer_id(id: &str) -> String {
    id.trim().to_uppercase()
}

/// Hot-reloadable runtime subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub active_strategy_id: u32,
    pub loop_interval_ms: u64,
    pub sl_pct: Option<f64>,
    pub tp_pct: Option<f64>,
    pub trail_start_pct: Option<f64>,
    pub trail_distance_pct: Option<f64>,
    pub candle_exit_enabled: Option<bool>,
    pub candle_red_trigger_pct: Option<f64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            active_strategy_id: 2,
            loop_interval_ms: 900_000,
            sl_pct: None,
            tp_pct: None,
            trail_start_pct: None,
            trail_distance_pct: None,
            candle_exit_enabled: None,
            candle_red_trigger_pct: None,
        }
    }
}

/// Partial runtime update from the control plane or a restored state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeUpdate {
    pub active_strategy_id: Option<u32>,
    pub loop_interval_ms: Option<u64>,
    pub sl_pct: Option<f64>,
    pub tp_pct: Option<f64>,
    pub trail_start_pct: Option<f64>,
    pub trail_distance_pct: Option<f64>,
    pub candle_exit_enabled: Option<bool>,
    pub candle_red_trigger_pct: Option<f64>,
}

fn valid_pct(v: f64) -> bool {
    v > 0.0 && v <= 0.5
}

impl RuntimeConfig {
    /// Apply a partial update. Each field is validated independently;
    /// invalid fields are rejected (returned for reporting) and the prior
    /// value stays in effect.
    pub fn apply_update(&mut self, update: RuntimeUpdate) -> Vec<String> {
        let mut rejected = Vec::new();

        if let Some(id) = update.active_strategy_id {
            if ALLOWED_STRATEGY_IDS.contains(&id) {
                self.active_strategy_id = id;
            } else {
                rejected.push(format!("active_strategy_id={}", id));
            }
        }

        if let Some(interval) = update.loop_interval_ms {
            if ALLOWED_LOOP_INTERVALS_MS.contains(&interval) {
                self.loop_interval_ms = interval;
            } else {
                rejected.push(format!("loop_interval_ms={}", interval));
            }
        }

        let mut pct_field = |name: &str, value: Option<f64>, slot: &mut Option<f64>| {
            if let Some(v) = value {
                if valid_pct(v) {
                    *slot = Some(v);
                } else {
                    rejected.push(format!("{}={}", name, v));
                }
            }
        };
        pct_field("sl_pct", update.sl_pct, &mut self.sl_pct);
        pct_field("tp_pct", update.tp_pct, &mut self.tp_pct);
        pct_field(
            "trail_start_pct",
            update.trail_start_pct,
            &mut self.trail_start_pct,
        );
        pct_field(
            "trail_distance_pct",
            update.trail_distance_pct,
            &mut self.trail_distance_pct,
        );

        if let Some(enabled) = update.candle_exit_enabled {
            self.candle_exit_enabled = Some(enabled);
        }

        if let Some(trigger) = update.candle_red_trigger_pct {
            if trigger > 0.0 && trigger <= 1.0 {
                self.candle_red_trigger_pct = Some(trigger);
            } else {
                rejected.push(format!("candle_red_trigger_pct={}", trigger));
            }
        }

        for field in &rejected {
            warn!(field = %field, "runtime override rejected, keeping prior value");
        }
        rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_listed_updates_apply() {
        let mut rt = RuntimeConfig::default();
        let rejected = rt.apply_update(RuntimeUpdate {
            active_strategy_id: Some(101),
            loop_interval_ms: Some(60_000),
            sl_pct: Some(0.02),
            ..RuntimeUpdate::default()
        });
        assert!(rejected.is_empty());
        assert_eq!(rt.active_strategy_id, 101);
        assert_eq!(rt.loop_interval_ms, 60_000);
        assert_eq!(rt.sl_pct, Some(0.02));
    }

    #[test]
    fn test_rejected_updates_keep_prior_values() {
        let mut rt = RuntimeConfig::default();
        rt.sl_pct = Some(0.012);

        let rejected = rt.apply_update(RuntimeUpdate {
            active_strategy_id: Some(42),
            loop_interval_ms: Some(120_000),
            sl_pct: Some(0.9),
            candle_red_trigger_pct: Some(1.5),
            ..RuntimeUpdate::default()
        });

        assert_eq!(rejected.len(), 4);
        assert_eq!(rt.active_strategy_id, 2);
        assert_eq!(rt.loop_interval_ms, 900_000);
        assert_eq!(rt.sl_pct, Some(0.012));
        assert_eq!(rt.candle_red_trigger_pct, None);
    }

    #[test]
    fn test_effective_exit_merges_overrides() {
        let mut market = sample_market();
        market.runtime.tp_pct = Some(0.05);
        let exit = market.effective_exit();
        assert_eq!(exit.tp_pct, 0.05);
        assert_eq!(exit.sl_pct, 0.012);
    }

    #[test]
    fn test_layer_validation() {
        let mut market = sample_market();
        market.layers.push(LayerConfig {
            id: "core".to_string(),
            name: "Core".to_string(),
            allocation_pct: 1.5,
            max_risk_per_trade_pct: 10.0,
            max_open_positions: 2,
            entry_strategy_id: Some(101),
            entry_preset_id: None,
            entry_preset: None,
            exit_preset_id: Some(1),
            exit_preset: None,
            timeframe: None,
            loss_stop_daily_pct: 2.0,
            loss_stop_weekly_pct: 5.0,
            cooldown_hours_after_stop: 24.0,
        });
        assert!(market.validate().is_err());

        market.layers[0].allocation_pct = 0.5;
        assert!(market.validate().is_ok());

        market.layers[0].entry_strategy_id = Some(999);
        assert!(market.validate().is_err());
    }

    #[test]
    fn test_normalize_layer_id() {
        assert_eq!(normalize_layer_id("  core "), "CORE");
        assert_eq!(normalize_layer_id(""), "");
    }

    fn sample_market() -> MarketConfig {
        MarketConfig {
            key: "crypto".to_string(),
            quote: default_quote(),
            symbols: vec!["BTCUSDT".to_string()],
            max_symbols: default_max_symbols(),
            timeframe: Timeframe::M15,
            klines_limit: default_klines_limit(),
            fast_ma: default_fast_ma(),
            slow_ma: default_slow_ma(),
            quote_order_fraction: default_quote_order_fraction(),
            kill_switch: false,
            session_gated: false,
            exit: default_exit_params(),
            regime: RegimeSettings::default(),
            macro_regime: MacroRegimeConfig::default(),
            layers: Vec::new(),
            regime_layer_rules: HashMap::new(),
            global_risk: GlobalRiskConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}
