//! Trade history sink.
//!
//! Keeps the full trade list in memory and mirrors it to a per-market JSON
//! file after every append. The risk engine reads it back for its trailing
//! PnL windows; persistence failures are logged and never fatal.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::types::TradeRecord;

/// Aggregate stats over the recorded trades.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TradeStats {
    pub total: usize,
    pub wins: usize,
    pub losses: usize,
    pub sum_pnl_pct: f64,
}

pub struct TradeHistory {
    path: Option<PathBuf>,
    trades: Mutex<Vec<TradeRecord>>,
}

impl TradeHistory {
    /// In-memory only; used by tests and dry runs.
    pub fn ephemeral() -> Self {
        TradeHistory {
            path: None,
            trades: Mutex::new(Vec::new()),
        }
    }

    /// File-backed history for one market, loading whatever is on disk.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let trades = match std::fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => match serde_json::from_str(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable trade history, starting empty");
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };
        info!(path = %path.display(), trades = trades.len(), "trade history loaded");

        TradeHistory {
            path: Some(path),
            trades: Mutex::new(trades),
        }
    }

    pub fn add_trade(&self, trade: TradeRecord) {
        info!(
            symbol = %trade.symbol,
            pnl = format!("{:+.2}", trade.pnl_value),
            pnl_pct = format!("{:+.2}%", trade.pnl_pct),
            layer = trade.layer_id.as_deref().unwrap_or("-"),
            "trade recorded"
        );

        let snapshot = {
            let mut trades = self.trades.lock().expect("trade history lock poisoned");
            trades.push(trade);
            self.path.as_ref().map(|_| trades.clone())
        };

        if let (Some(path), Some(trades)) = (self.path.as_ref(), snapshot) {
            if let Err(e) = persist(path, &trades) {
                warn!(path = %path.display(), error = %e, "failed to persist trade history");
            }
        }
    }

    pub fn all_trades(&self) -> Vec<TradeRecord> {
        self.trades
            .lock()
            .expect("trade history lock poisoned")
            .clone()
    }

    pub fn stats(&self) -> TradeStats {
        let trades = self.trades.lock().expect("trade history lock poisoned");
        let mut stats = TradeStats {
            total: trades.len(),
            ..TradeStats::default()
        };
        for t in trades.iter() {
            stats.sum_pnl_pct += t.pnl_pct;
            if t.pnl_pct > 0.0 {
                stats.wins += 1;
            } else if t.pnl_pct < 0.0 {
                stats.losses += 1;
            }
        }
        stats
    }

    /// Drop all trades (funds reset).
    pub fn clear(&self) {
        let mut trades = self.trades.lock().expect("trade history lock poisoned");
        trades.clear();
        if let Some(path) = self.path.as_ref() {
            if let Err(e) = persist(path, &trades) {
                warn!(path = %path.display(), error = %e, "failed to persist trade history");
            }
        }
    }
}

fn persist(path: &Path, trades: &[TradeRecord]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(trades)?;
    std::fs::write(path, json)?;
    Ok(())
}
