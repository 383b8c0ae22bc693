//! Durable state: per-market engine snapshots and performance tracking.
//!
//! Everything is small JSON under a state directory, written after every
//! cycle and on graceful stop. Load failures degrade to a fresh start with
//! a log line; save failures are logged and never fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::portfolio::LayerState;
use crate::regime::engine::RegimeLockState;
use crate::types::{Position, Symbol};

/// Snapshot of one market's engine state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketState {
    pub positions: HashMap<Symbol, Position>,
    pub active_strategy_id: Option<u32>,
    pub runtime: Option<RuntimeConfig>,
    pub regime_lock: Option<RegimeLockState>,
    pub layers: HashMap<String, LayerState>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerfSample {
    pub ts: DateTime<Utc>,
    pub equity: f64,
    pub pnl_pct: f64,
}

/// Equity curve relative to the configured initial capital.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Performance {
    pub initial_capital: f64,
    pub last_equity: f64,
    pub last_pnl_pct: f64,
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub samples: Vec<PerfSample>,
}

impl Performance {
    pub fn new(initial_capital: f64) -> Self {
        Performance {
            initial_capital,
            last_equity: initial_capital,
            last_pnl_pct: 0.0,
            last_update: None,
            samples: Vec::new(),
        }
    }

    /// Append an equity sample and refresh the headline figures.
    pub fn record(&mut self, equity: f64, now: DateTime<Utc>) {
        let base = if self.initial_capital > 0.0 {
            self.initial_capital
        } else {
            equity
        };
        let pnl_pct = if base > 0.0 {
            (equity - base) / base * 100.0
        } else {
            0.0
        };
        self.last_equity = equity;
        self.last_pnl_pct = pnl_pct;
        self.last_update = Some(now);
        self.samples.push(PerfSample {
            ts: now,
            equity,
            pnl_pct,
        });
    }
}

/// JSON file store keyed per market.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StateStore { dir: dir.into() }
    }

    pub fn state_path(&self, market: &str) -> PathBuf {
        self.dir.join(format!("state.{market}.json"))
    }

    pub fn performance_path(&self, market: &str) -> PathBuf {
        self.dir.join(format!("performance.{market}.json"))
    }

    pub fn history_path(&self, market: &str) -> PathBuf {
        self.dir.join(format!("history.{market}.json"))
    }

    pub fn load_state(&self, market: &str) -> Option<MarketState> {
        let state: Option<MarketState> = load_json(&self.state_path(market));
        if state.is_some() {
            info!(market, "restored previous state");
        }
        state
    }

    pub fn save_state(&self, market: &str, state: &MarketState) {
        save_json(&self.state_path(market), state);
    }

    pub fn load_performance(&self, market: &str) -> Option<Performance> {
        load_json(&self.performance_path(market))
    }

    pub fn save_performance(&self, market: &str, perf: &Performance) {
        save_json(&self.performance_path(market), perf);
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = std::fs::read_to_string(path).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable state file, ignoring");
            None
        }
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) {
    let write = || -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(path, json)?;
        Ok(())
    };
    if let Err(e) = write() {
        warn!(path = %path.display(), error = %e, "failed to persist state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> StateStore {
        StateStore::new(std::env::temp_dir().join(format!("regime-trader-test-state-{tag}")))
    }

    #[test]
    fn test_state_round_trip() {
        let store = temp_store("roundtrip");
        let _ = std::fs::remove_file(store.state_path("crypto"));

        assert!(store.load_state("crypto").is_none());

        let mut state = MarketState::default();
        state.active_strategy_id = Some(101);
        state.positions.insert(Symbol::new("BTCUSDT"), Position::default());
        store.save_state("crypto", &state);

        let loaded = store.load_state("crypto").unwrap();
        assert_eq!(loaded.active_strategy_id, Some(101));
        assert!(loaded.positions.contains_key(&Symbol::new("BTCUSDT")));

        let _ = std::fs::remove_file(store.state_path("crypto"));
    }

    #[test]
    fn test_performance_record() {
        let mut perf = Performance::new(100_000.0);
        perf.record(105_000.0, Utc::now());
        assert_eq!(perf.last_equity, 105_000.0);
        assert!((perf.last_pnl_pct - 5.0).abs() < 1e-9);
        assert_eq!(perf.samples.len(), 1);
    }

    #[test]
    fn test_broken_state_file_ignored() {
        let store = temp_store("broken");
        let path = store.state_path("crypto");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(store.load_state("crypto").is_none());
        let _ = std::fs::remove_file(&path);
    }
}
