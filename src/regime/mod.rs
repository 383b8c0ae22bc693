//! Market-regime classification.
//!
//! Two intentionally distinct detectors live here: [`engine`] is the rich
//! multi-rule detector that drives strategy-pack selection (with a
//! hysteresis lock), and [`macro_classifier`] is the simpler EMA/ADX/ATR%
//! classifier the portfolio engine uses for layer eligibility.

pub mod engine;
pub mod macro_classifier;

pub use engine::{
    apply_regime_lock, detect_market_regime, pick_regime_strategy_pack, LockStatus, Regime,
    RegimeDetection, RegimeLock, RegimeLockState, RegimeMetrics, RegimeSettings, RuleCheck,
    StrategyPack, StrategyPackChoice,
};
pub use macro_classifier::{classify_macro_regime, MacroRegime, MacroRegimeConfig};
