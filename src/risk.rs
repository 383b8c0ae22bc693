//! Layer-level risk accounting: open-position counts, exposure, budgets and
//! the eligibility chain for opening new positions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{normalize_layer_id, LayerConfig};
use crate::types::{Position, Symbol};

/// Layer id used for positions that carry no layer attribution.
pub const UNASSIGNED_LAYER: &str = "UNASSIGNED";

/// Open-position counts, total and per layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenCounts {
    pub per_layer: HashMap<String, usize>,
    pub total_open: usize,
}

pub fn open_position_counts(positions: &HashMap<Symbol, Position>) -> OpenCounts {
    let mut counts = OpenCounts::default();
    for pos in positions.values() {
        let Some(open) = pos.position.as_ref() else {
            continue;
        };
        counts.total_open += 1;
        let layer_id = open
            .layer_id
            .as_deref()
            .map(normalize_layer_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| UNASSIGNED_LAYER.to_string());
        *counts.per_layer.entry(layer_id).or_insert(0) += 1;
    }
    counts
}

/// Notional exposure per layer, valued at the last known price (falling
/// back to the entry price for symbols without a quote yet).
pub fn layer_exposure(
    positions: &HashMap<Symbol, Position>,
    last_prices: &HashMap<Symbol, f64>,
) -> HashMap<String, f64> {
    let mut per_layer: HashMap<String, f64> = HashMap::new();
    for (symbol, pos) in positions {
        let Some(open) = pos.position.as_ref() else {
            continue;
        };
        let layer_id = open
            .layer_id
            .as_deref()
            .map(normalize_layer_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| UNASSIGNED_LAYER.to_string());
        let price = last_prices
            .get(symbol)
            .copied()
            .unwrap_or(open.entry_price);
        *per_layer.entry(layer_id).or_insert(0.0) += price * open.qty;
    }
    per_layer
}

/// One layer's capital budget for the cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerBudget {
    pub budget_usd: f64,
    pub exposure_usd: f64,
    pub available_usd: f64,
    pub allocation_pct: f64,
}

/// budget = equity * allocation; available = max(0, budget - exposure).
pub fn compute_layer_budgets(
    equity: f64,
    layers: &[LayerConfig],
    positions: &HashMap<Symbol, Position>,
    last_prices: &HashMap<Symbol, f64>,
) -> HashMap<String, LayerBudget> {
    let exposure = layer_exposure(positions, last_prices);
    let mut budgets = HashMap::new();

    for layer in layers {
        let id = layer.normalized_id();
        let budget_usd = equity * layer.allocation_pct;
        let exposure_usd = exposure.get(&id).copied().unwrap_or(0.0);
        budgets.insert(
            id,
            LayerBudget {
                budget_usd,
                exposure_usd,
                available_usd: (budget_usd - exposure_usd).max(0.0),
                allocation_pct: layer.allocation_pct,
            },
        );
    }

    budgets
}

/// Why a layer may not open a position this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryDenial {
    LayerPaused,
    GlobalMaxOpen,
    LayerMaxOpen,
    LayerBudgetExhausted,
}

impl std::fmt::Display for EntryDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryDenial::LayerPaused => "layer_paused",
            EntryDenial::GlobalMaxOpen => "global_max_open",
            EntryDenial::LayerMaxOpen => "layer_max_open",
            EntryDenial::LayerBudgetExhausted => "layer_budget_exhausted",
        };
        f.write_str(s)
    }
}

/// Eligibility chain, checked in order: pause, global ceiling, layer
/// ceiling, remaining budget.
pub fn can_open_position(
    layer: &LayerConfig,
    is_paused: bool,
    positions: &HashMap<Symbol, Position>,
    last_prices: &HashMap<Symbol, f64>,
    equity: f64,
    global_max_open: usize,
) -> Result<(), EntryDenial> {
    if is_paused {
        return Err(EntryDenial::LayerPaused);
    }

    let counts = open_position_counts(positions);
    if counts.total_open >= global_max_open {
        return Err(EntryDenial::GlobalMaxOpen);
    }

    let id = layer.normalized_id();
    let layer_open = counts.per_layer.get(&id).copied().unwrap_or(0);
    if layer_open >= layer.max_open_positions {
        return Err(EntryDenial::LayerMaxOpen);
    }

    let budgets = compute_layer_budgets(equity, std::slice::from_ref(layer), positions, last_prices);
    if let Some(budget) = budgets.get(&id) {
        if budget.available_usd <= 0.0 {
            return Err(EntryDenial::LayerBudgetExhausted);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OpenPosition, StopState};
    use chrono::Utc;

    fn layer(id: &str, allocation: f64, max_open: usize) -> LayerConfig {
        LayerConfig {
            id: id.to_string(),
            name: id.to_string(),
            allocation_pct: allocation,
            max_risk_per_trade_pct: 10.0,
            max_open_positions: max_open,
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

    fn open_in(layer_id: Option<&str>, qty: f64, entry: f64) -> Position {
        Position {
            last_evaluated_at: None,
            position: Some(OpenPosition {
                entry_price: entry,
                qty,
                max_price: entry,
                layer_id: layer_id.map(|s| s.to_string()),
                strategy_id: Some(2),
                entry_preset_id: None,
                exit_preset_id: Some(1),
                risk_allocated_usd: None,
                opened_at: Utc::now(),
                entry_bar_ts: Utc::now(),
                breakout_level: None,
                stop: StopState::Percent,
            }),
        }
    }

    /// Two layers at 0.5/0.35 on 100k equity: budgets 50k/35k; with 10k of
    /// exposure tagged to the second layer its available budget is 25k.
    #[test]
    fn test_budget_scenario() {
        let layers = vec![layer("core", 0.5, 3), layer("tactical", 0.35, 2)];
        let mut positions = HashMap::new();
        positions.insert(Symbol::new("AAPL"), open_in(Some("tactical"), 100.0, 95.0));
        let mut last_prices = HashMap::new();
        last_prices.insert(Symbol::new("AAPL"), 100.0);

        let budgets = compute_layer_budgets(100_000.0, &layers, &positions, &last_prices);

        assert_eq!(budgets["CORE"].budget_usd, 50_000.0);
        assert_eq!(budgets["CORE"].available_usd, 50_000.0);
        assert_eq!(budgets["TACTICAL"].budget_usd, 35_000.0);
        assert_eq!(budgets["TACTICAL"].exposure_usd, 10_000.0);
        assert_eq!(budgets["TACTICAL"].available_usd, 25_000.0);
    }

    #[test]
    fn test_exposure_falls_back_to_entry_price() {
        let mut positions = HashMap::new();
        positions.insert(Symbol::new("MSFT"), open_in(Some("core"), 10.0, 50.0));
        let exposure = layer_exposure(&positions, &HashMap::new());
        assert_eq!(exposure["CORE"], 500.0);
    }

    #[test]
    fn test_unassigned_positions_grouped() {
        let mut positions = HashMap::new();
        positions.insert(Symbol::new("A"), open_in(None, 1.0, 10.0));
        positions.insert(Symbol::new("B"), Position::default());

        let counts = open_position_counts(&positions);
        assert_eq!(counts.total_open, 1);
        assert_eq!(counts.per_layer[UNASSIGNED_LAYER], 1);
    }

    #[test]
    fn test_eligibility_chain_order() {
        let l = layer("core", 0.5, 1);
        let positions = HashMap::new();
        let prices = HashMap::new();

        // Paused wins over everything else
        assert_eq!(
            can_open_position(&l, true, &positions, &prices, 100_000.0, 10),
            Err(EntryDenial::LayerPaused)
        );

        // Global ceiling
        let mut crowded = HashMap::new();
        crowded.insert(Symbol::new("A"), open_in(Some("other"), 1.0, 10.0));
        assert_eq!(
            can_open_position(&l, false, &crowded, &prices, 100_000.0, 1),
            Err(EntryDenial::GlobalMaxOpen)
        );

        // Layer ceiling
        let mut layer_full = HashMap::new();
        layer_full.insert(Symbol::new("A"), open_in(Some("core"), 1.0, 10.0));
        assert_eq!(
            can_open_position(&l, false, &layer_full, &prices, 100_000.0, 10),
            Err(EntryDenial::LayerMaxOpen)
        );

        // Budget exhausted: zero equity means zero budget
        assert_eq!(
            can_open_position(&l, false, &positions, &prices, 0.0, 10),
            Err(EntryDenial::LayerBudgetExhausted)
        );

        assert_eq!(
            can_open_position(&l, false, &positions, &prices, 100_000.0, 10),
            Ok(())
        );
    }
}
