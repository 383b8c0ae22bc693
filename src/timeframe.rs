//! Candle timeframes and the once-per-closed-bar evaluation gate

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Candle, Position};

/// Supported candle timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Timeframe {
    #[serde(rename = "15m")]
    M15,
    #[default]
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
}

impl Timeframe {
    /// Parse a timeframe string; anything unrecognized normalizes to 1h.
    pub fn parse(s: &str) -> Timeframe {
        match s.trim().to_lowercase().as_str() {
            "15m" => Timeframe::M15,
            "4h" => Timeframe::H4,
            _ => Timeframe::H1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bar is closed once its open time plus the timeframe duration has
/// elapsed.
pub fn is_bar_closed(candle: &Candle, timeframe: Timeframe, now: DateTime<Utc>) -> bool {
    now >= candle.open_time + timeframe.duration()
}

/// A symbol is evaluated at most once per fully-closed bar: the latest
/// candle must be closed and must not be the bar recorded by the previous
/// evaluation.
pub fn should_evaluate(
    candles: &[Candle],
    position: &Position,
    timeframe: Timeframe,
    now: DateTime<Utc>,
) -> bool {
    let Some(last) = candles.last() else {
        return false;
    };
    if !is_bar_closed(last, timeframe, now) {
        return false;
    }
    position.last_evaluated_at != Some(last.open_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle_at(ts: DateTime<Utc>) -> Candle {
        Candle {
            open_time: ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        }
    }

    #[test]
    fn test_parse_normalizes_unknown_to_1h() {
        assert_eq!(Timeframe::parse("15m"), Timeframe::M15);
        assert_eq!(Timeframe::parse("4H"), Timeframe::H4);
        assert_eq!(Timeframe::parse("3m"), Timeframe::H1);
        assert_eq!(Timeframe::parse(""), Timeframe::H1);
    }

    #[test]
    fn test_bar_close_gate() {
        let open = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let c = candle_at(open);

        let mid_bar = open + Duration::minutes(30);
        assert!(!is_bar_closed(&c, Timeframe::H1, mid_bar));

        let after = open + Duration::minutes(61);
        assert!(is_bar_closed(&c, Timeframe::H1, after));
    }

    #[test]
    fn test_should_evaluate_once_per_bar() {
        let open = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let candles = vec![candle_at(open)];
        let now = open + Duration::hours(2);

        let mut pos = Position::default();
        assert!(should_evaluate(&candles, &pos, Timeframe::H1, now));

        pos.last_evaluated_at = Some(open);
        assert!(!should_evaluate(&candles, &pos, Timeframe::H1, now));

        assert!(!should_evaluate(&[], &pos, Timeframe::H1, now));
    }
}
