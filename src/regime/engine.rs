//! Multi-rule market-regime detector with hysteresis.
//!
//! Detection computes a metric bundle (ATR ratio, volume ratio, RSI, slow-EMA
//! slope) from a proxy-symbol candle series and evaluates three independent
//! rule sets (BREAKOUT, TREND, RANGE). A rule set matches when every one of
//! its threshold checks passes; regime priority is BREAKOUT > TREND > RANGE.
//! A lock state adds hysteresis across cycles so the applied regime cannot
//! flap bar to bar.

use serde::{Deserialize, Serialize};

use crate::indicators;
use crate::timeframe::Timeframe;
use crate::types::Candle;

/// Classified market condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Trend,
    Range,
    Breakout,
    NoTrade,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Regime::Trend => "TREND",
            Regime::Range => "RANGE",
            Regime::Breakout => "BREAKOUT",
            Regime::NoTrade => "NO_TRADE",
        };
        f.write_str(s)
    }
}

/// Detector operating mode. In `Manual` the detector still runs and logs,
/// but the operator-selected strategy stays in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeMode {
    Auto,
    #[default]
    Manual,
}

/// Entry/exit pack bound to a regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyPack {
    pub entry_strategy_id: u32,
    pub exit_preset_id: u32,
}

/// Per-regime default packs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimePacks {
    pub trend: StrategyPack,
    pub range: StrategyPack,
    pub breakout: StrategyPack,
}

impl Default for RegimePacks {
    fn default() -> Self {
        RegimePacks {
            trend: StrategyPack {
                entry_strategy_id: 101,
                exit_preset_id: 1,
            },
            range: StrategyPack {
                entry_strategy_id: 103,
                exit_preset_id: 3,
            },
            breakout: StrategyPack {
                entry_strategy_id: 105,
                exit_preset_id: 7,
            },
        }
    }
}

/// Validated detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeSettings {
    pub mode: RegimeMode,
    pub proxy_symbol: String,
    pub timeframe: Timeframe,
    pub min_confidence: f64,
    pub min_hold_candles: u32,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub atr_ma_period: usize,
    pub volume_ma_period: usize,
    pub slow_ma_period: usize,
    pub slope_window: usize,
    pub atr_ratio_breakout: f64,
    pub vol_ratio_breakout: f64,
    pub rsi_breakout_min: f64,
    pub slope_trend_min: f64,
    pub rsi_trend_min: f64,
    pub rsi_trend_max: f64,
    pub atr_ratio_trend_min: f64,
    pub atr_ratio_trend_max: f64,
    pub slope_range_max: f64,
    pub rsi_range_min: f64,
    pub rsi_range_max: f64,
    pub atr_ratio_range_max: f64,
    pub packs: RegimePacks,
}

impl Default for RegimeSettings {
    fn default() -> Self {
        RegimeSettings {
            mode: RegimeMode::Manual,
            proxy_symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M15,
            min_confidence: 0.55,
            min_hold_candles: 3,
            rsi_period: 14,
            atr_period: 14,
            atr_ma_period: 14,
            volume_ma_period: 10,
            slow_ma_period: 200,
            slope_window: 20,
            atr_ratio_breakout: 1.35,
            vol_ratio_breakout: 1.2,
            rsi_breakout_min: 60.0,
            slope_trend_min: 0.1,
            rsi_trend_min: 50.0,
            rsi_trend_max: 65.0,
            atr_ratio_trend_min: 0.9,
            atr_ratio_trend_max: 1.3,
            slope_range_max: 0.03,
            rsi_range_min: 45.0,
            rsi_range_max: 55.0,
            atr_ratio_range_max: 1.05,
            packs: RegimePacks::default(),
        }
    }
}

impl RegimeSettings {
    /// Clamp operator overrides to sane floors; out-of-range values fall
    /// back to the defaults rather than erroring.
    pub fn sanitized(mut self) -> Self {
        let d = RegimeSettings::default();
        if !self.min_confidence.is_finite() || self.min_confidence < 0.0 {
            self.min_confidence = d.min_confidence;
        }
        self.min_hold_candles = self.min_hold_candles.max(1);
        self.rsi_period = self.rsi_period.max(2);
        self.atr_period = self.atr_period.max(2);
        self.atr_ma_period = self.atr_ma_period.max(2);
        self.volume_ma_period = self.volume_ma_period.max(2);
        self.slow_ma_period = self.slow_ma_period.max(2);
        self.slope_window = self.slope_window.max(1);
        self
    }
}

/// Raw metric bundle feeding the rule sets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeMetrics {
    pub atr: f64,
    pub atr_ma: f64,
    pub atr_ratio: f64,
    pub volume: f64,
    pub volume_ma: f64,
    pub volume_ratio: f64,
    pub rsi: f64,
    pub slow_now: f64,
    pub slow_prev: f64,
    pub slope_pct: f64,
}

/// One threshold comparison inside a rule set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleCheck {
    pub label: &'static str,
    pub passed: bool,
    pub actual: f64,
    pub target: String,
}

/// A rule set's evaluation: confidence = met / total, matched iff all met.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSummary {
    pub met: usize,
    pub total: usize,
    pub confidence: f64,
    pub matched: bool,
    pub checks: Vec<RuleCheck>,
}

fn summarize(checks: Vec<RuleCheck>) -> RuleSummary {
    let total = checks.len();
    let met = checks.iter().filter(|c| c.passed).count();
    let confidence = if total > 0 {
        met as f64 / total as f64
    } else {
        0.0
    };
    RuleSummary {
        met,
        total,
        confidence,
        matched: met == total,
        checks,
    }
}

/// Per-rule-set summaries, kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleChecks {
    pub breakout: Option<RuleSummary>,
    pub trend: Option<RuleSummary>,
    pub range: Option<RuleSummary>,
}

/// One cycle's detection result. Produced fresh each cycle and consumed
/// immediately; only the lock state survives between cycles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegimeDetection {
    pub regime: Regime,
    pub confidence: f64,
    pub reason: String,
    pub metrics: Option<RegimeMetrics>,
    pub checks: RuleChecks,
}

fn compute_metrics(candles: &[Candle], cfg: &RegimeSettings) -> Result<RegimeMetrics, String> {
    if candles.is_empty() {
        return Err("missing data".to_string());
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();

    let insufficient = || "insufficient data".to_string();

    let volume = candles.last().map(|c| c.volume).ok_or_else(insufficient)?;
    let volume_ma =
        indicators::volume_ma(candles, cfg.volume_ma_period).ok_or_else(insufficient)?;
    let rsi = indicators::last_value(&indicators::rsi(&closes, cfg.rsi_period))
        .ok_or_else(insufficient)?;
    let atr = indicators::last_value(&indicators::atr(&highs, &lows, &closes, cfg.atr_period))
        .ok_or_else(insufficient)?;
    let atr_ma = indicators::atr_ma(&highs, &lows, &closes, cfg.atr_period, cfg.atr_ma_period)
        .ok_or_else(insufficient)?;
    let slow_now = indicators::last_value(&indicators::ema(&closes, cfg.slow_ma_period))
        .ok_or_else(insufficient)?;

    // Slope: the same slow EMA on the series truncated by slope_window bars
    let truncated_len = closes.len().saturating_sub(cfg.slope_window);
    if truncated_len < cfg.slow_ma_period {
        return Err(insufficient());
    }
    let slow_prev =
        indicators::last_value(&indicators::ema(&closes[..truncated_len], cfg.slow_ma_period))
            .ok_or_else(insufficient)?;

    if atr_ma <= 0.0 || volume_ma <= 0.0 || slow_prev <= 0.0 {
        return Err(insufficient());
    }

    let atr_ratio = atr / atr_ma;
    let volume_ratio = volume / volume_ma;
    let slope_pct = (slow_now - slow_prev) / slow_prev * 100.0;

    if !atr_ratio.is_finite() || !volume_ratio.is_finite() || !slope_pct.is_finite() {
        return Err(insufficient());
    }

    Ok(RegimeMetrics {
        atr,
        atr_ma,
        atr_ratio,
        volume,
        volume_ma,
        volume_ratio,
        rsi,
        slow_now,
        slow_prev,
        slope_pct,
    })
}

/// Evaluate the three rule sets against a metric bundle.
pub fn evaluate_regime(metrics: &RegimeMetrics, cfg: &RegimeSettings) -> RegimeDetection {
    let breakout = summarize(vec![
        RuleCheck {
            label: "ATR_RATIO",
            passed: metrics.atr_ratio >= cfg.atr_ratio_breakout,
            actual: metrics.atr_ratio,
            target: format!("{}", cfg.atr_ratio_breakout),
        },
        RuleCheck {
            label: "VOL_RATIO",
            passed: metrics.volume_ratio >= cfg.vol_ratio_breakout,
            actual: metrics.volume_ratio,
            target: format!("{}", cfg.vol_ratio_breakout),
        },
        RuleCheck {
            label: "RSI",
            passed: metrics.rsi >= cfg.rsi_breakout_min,
            actual: metrics.rsi,
            target: format!("{}", cfg.rsi_breakout_min),
        },
    ]);

    let trend = summarize(vec![
        RuleCheck {
            label: "SLOPE_ABS",
            passed: metrics.slope_pct.abs() >= cfg.slope_trend_min,
            actual: metrics.slope_pct.abs(),
            target: format!("{}", cfg.slope_trend_min),
        },
        RuleCheck {
            label: "RSI_RANGE",
            passed: metrics.rsi >= cfg.rsi_trend_min && metrics.rsi <= cfg.rsi_trend_max,
            actual: metrics.rsi,
            target: format!("{}-{}", cfg.rsi_trend_min, cfg.rsi_trend_max),
        },
        RuleCheck {
            label: "ATR_RATIO_RANGE",
            passed: metrics.atr_ratio >= cfg.atr_ratio_trend_min
                && metrics.atr_ratio <= cfg.atr_ratio_trend_max,
            actual: metrics.atr_ratio,
            target: format!("{}-{}", cfg.atr_ratio_trend_min, cfg.atr_ratio_trend_max),
        },
    ]);

    let range = summarize(vec![
        RuleCheck {
            label: "SLOPE_ABS",
            passed: metrics.slope_pct.abs() <= cfg.slope_range_max,
            actual: metrics.slope_pct.abs(),
            target: format!("{}", cfg.slope_range_max),
        },
        RuleCheck {
            label: "RSI_RANGE",
            passed: metrics.rsi >= cfg.rsi_range_min && metrics.rsi <= cfg.rsi_range_max,
            actual: metrics.rsi,
            target: format!("{}-{}", cfg.rsi_range_min, cfg.rsi_range_max),
        },
        RuleCheck {
            label: "ATR_RATIO_MAX",
            passed: metrics.atr_ratio <= cfg.atr_ratio_range_max,
            actual: metrics.atr_ratio,
            target: format!("{}", cfg.atr_ratio_range_max),
        },
    ]);

    let mut regime = Regime::NoTrade;
    if breakout.matched {
        regime = Regime::Breakout;
    } else if trend.matched {
        regime = Regime::Trend;
    } else if range.matched {
        regime = Regime::Range;
    }

    let best = breakout
        .confidence
        .max(trend.confidence)
        .max(range.confidence);

    let confidence = match regime {
        Regime::Breakout => breakout.confidence,
        Regime::Trend => trend.confidence,
        Regime::Range => range.confidence,
        Regime::NoTrade => best,
    };

    let mut reason = if regime == Regime::NoTrade {
        "no rule set matched".to_string()
    } else {
        "matched".to_string()
    };

    if confidence < cfg.min_confidence {
        regime = Regime::NoTrade;
        reason = format!(
            "confidence {:.2} below {}",
            confidence, cfg.min_confidence
        );
    }

    RegimeDetection {
        regime,
        confidence,
        reason,
        metrics: Some(*metrics),
        checks: RuleChecks {
            breakout: Some(breakout),
            trend: Some(trend),
            range: Some(range),
        },
    }
}

/// Run full detection on a candle series. Never panics: missing or
/// insufficient data yields NO_TRADE with a reason.
pub fn detect_market_regime(candles: &[Candle], cfg: &RegimeSettings) -> RegimeDetection {
    match compute_metrics(candles, cfg) {
        Ok(metrics) => evaluate_regime(&metrics, cfg),
        Err(reason) => RegimeDetection {
            regime: Regime::NoTrade,
            confidence: 0.0,
            reason,
            metrics: None,
            checks: RuleChecks::default(),
        },
    }
}

/// Lock status after applying hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Switched,
    Held,
}

/// Persisted hysteresis state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeLockState {
    pub current_regime: Regime,
    pub hold_count: u32,
    pub lock_status: LockStatus,
}

/// Lock application result for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeLock {
    pub current_regime: Regime,
    pub previous_regime: Option<Regime>,
    pub hold_count: u32,
    pub lock_status: LockStatus,
    pub switched: bool,
}

impl RegimeLock {
    pub fn to_state(&self) -> RegimeLockState {
        RegimeLockState {
            current_regime: self.current_regime,
            hold_count: self.hold_count,
            lock_status: self.lock_status,
        }
    }
}

/// Apply hysteresis: a held regime repeats and increments its hold count;
/// a fresh BREAKOUT switches immediately; any other change is suppressed
/// until the previous regime has been held for `min_hold_candles`.
pub fn apply_regime_lock(
    previous: Option<&RegimeLockState>,
    detected: Regime,
    min_hold_candles: u32,
) -> RegimeLock {
    let min_hold = min_hold_candles.max(1);
    let prev_regime = previous.map(|p| p.current_regime);
    let prev_hold = previous.map(|p| p.hold_count).unwrap_or(0);

    if let Some(prev) = prev_regime {
        if prev == detected {
            return RegimeLock {
                current_regime: prev,
                previous_regime: prev_regime,
                hold_count: prev_hold + 1,
                lock_status: LockStatus::Held,
                switched: false,
            };
        }
        if detected != Regime::Breakout && prev_hold < min_hold {
            return RegimeLock {
                current_regime: prev,
                previous_regime: prev_regime,
                hold_count: prev_hold + 1,
                lock_status: LockStatus::Held,
                switched: false,
            };
        }
    }

    RegimeLock {
        current_regime: detected,
        previous_regime: prev_regime,
        hold_count: 1,
        lock_status: LockStatus::Switched,
        switched: true,
    }
}

/// Why a pack (or a block) was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackSelection {
    Breakout,
    TrendStable,
    TrendStrong,
    PullbackOpportunity,
    RangeLowVol,
    RangeHighVol,
    NoTrade,
}

/// Pack selection outcome: trade with a concrete entry/exit pack, or block
/// entries this cycle with a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StrategyPackChoice {
    Trade {
        pack: StrategyPack,
        selection: PackSelection,
    },
    Blocked {
        reason: String,
        selection: PackSelection,
    },
}

/// Pick the strategy pack for the detected regime.
///
/// BREAKOUT always trades its dedicated pack. TREND inspects the metrics:
/// RSI near the trend floor routes to a pullback-opportunity pack, a
/// markedly elevated slope or ATR ratio routes to the aggressive pack,
/// otherwise the baseline pack. RANGE only trades when volatility is
/// comfortably below the range ceiling. NO_TRADE blocks.
pub fn pick_regime_strategy_pack(
    detection: &RegimeDetection,
    cfg: &RegimeSettings,
) -> StrategyPackChoice {
    match detection.regime {
        Regime::Breakout => StrategyPackChoice::Trade {
            pack: cfg.packs.breakout,
            selection: PackSelection::Breakout,
        },
        Regime::Trend => {
            let Some(metrics) = detection.metrics else {
                return StrategyPackChoice::Trade {
                    pack: cfg.packs.trend,
                    selection: PackSelection::TrendStable,
                };
            };
            let pullback_window = metrics.rsi <= cfg.rsi_trend_min + 2.0;
            let trend_strong = metrics.slope_pct >= cfg.slope_trend_min * 2.0;
            let atr_strong = metrics.atr_ratio >= cfg.atr_ratio_trend_max;

            if pullback_window {
                StrategyPackChoice::Trade {
                    pack: StrategyPack {
                        entry_strategy_id: 104,
                        exit_preset_id: 6,
                    },
                    selection: PackSelection::PullbackOpportunity,
                }
            } else if trend_strong || atr_strong {
                StrategyPackChoice::Trade {
                    pack: StrategyPack {
                        entry_strategy_id: 102,
                        exit_preset_id: 4,
                    },
                    selection: PackSelection::TrendStrong,
                }
            } else {
                StrategyPackChoice::Trade {
                    pack: cfg.packs.trend,
                    selection: PackSelection::TrendStable,
                }
            }
        }
        Regime::Range => {
            let low_vol = detection
                .metrics
                .map(|m| m.atr_ratio <= cfg.atr_ratio_range_max * 0.9)
                .unwrap_or(false);
            if low_vol {
                StrategyPackChoice::Trade {
                    pack: cfg.packs.range,
                    selection: PackSelection::RangeLowVol,
                }
            } else {
                StrategyPackChoice::Blocked {
                    reason: "range volatility too high".to_string(),
                    selection: PackSelection::RangeHighVol,
                }
            }
        }
        Regime::NoTrade => StrategyPackChoice::Blocked {
            reason: detection.reason.clone(),
            selection: PackSelection::NoTrade,
        },
    }
}
