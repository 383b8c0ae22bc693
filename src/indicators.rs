//! Technical indicators powered by the `ta` crate
//!
//! SMA/EMA/RSI wrap the battle-tested `ta` crate; ATR and ADX use manual
//! Wilder-smoothing implementations, and the rest (VWAP, volume MA, window
//! extremes, candle patterns) are small pure functions over OHLCV slices.
//!
//! All series functions return one output per input bar, oldest first, with
//! `None` during the warmup window.

use ta::indicators::{ExponentialMovingAverage, RelativeStrengthIndex, SimpleMovingAverage};
use ta::Next;

use crate::types::Candle;

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match SimpleMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        let sma_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(sma_val));
        } else {
            result.push(None);
        }
    }

    result
}

/// Calculate Exponential Moving Average
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match ExponentialMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        let ema_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(ema_val));
        } else {
            result.push(None);
        }
    }

    result
}

/// Calculate RSI (Relative Strength Index)
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match RelativeStrengthIndex::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        let rsi_val = indicator.next(value);
        // RSI needs one extra bar for the first price delta
        if i + 1 >= period + 1 {
            result.push(Some(rsi_val));
        } else {
            result.push(None);
        }
    }

    result
}

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range using Wilder's smoothing:
/// ATR = (prev_ATR * (period - 1) + current_TR) / period
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 || high.len() != low.len() || high.len() != close.len() {
        return vec![];
    }

    let tr = true_range(high, low, close);
    let mut result = Vec::with_capacity(high.len());
    let mut atr_value: Option<f64> = None;

    for (i, &tr_i) in tr.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            // First ATR value is the SMA of the first `period` TR values
            let sum: f64 = tr[0..period].iter().sum();
            atr_value = Some(sum / period as f64);
            result.push(atr_value);
        } else if let Some(prev_atr) = atr_value {
            let new_atr = (prev_atr * (period - 1) as f64 + tr_i) / period as f64;
            atr_value = Some(new_atr);
            result.push(atr_value);
        } else {
            result.push(None);
        }
    }

    result
}

/// Trailing moving average of the ATR series itself: the mean of the last
/// `ma_period` ATR samples, where each sample is the ATR of the growing
/// candle prefix up to that bar. Returns `None` until enough samples exist.
pub fn atr_ma(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    atr_period: usize,
    ma_period: usize,
) -> Option<f64> {
    if ma_period == 0 {
        return None;
    }
    let series = atr(high, low, close, atr_period);
    let samples: Vec<f64> = series.iter().filter_map(|v| *v).collect();
    if samples.len() < ma_period {
        return None;
    }
    let tail = &samples[samples.len() - ma_period..];
    Some(tail.iter().sum::<f64>() / ma_period as f64)
}

/// Apply Wilder's smoothing to a series
fn wilders_smooth(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut result = Vec::with_capacity(values.len());
    let mut smoothed: Option<f64> = None;

    for (i, &v) in values.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = values[0..period].iter().sum();
            smoothed = Some(sum / period as f64);
            result.push(smoothed);
        } else if let Some(prev) = smoothed {
            let new_val = (prev * (period - 1) as f64 + v) / period as f64;
            smoothed = Some(new_val);
            result.push(smoothed);
        } else {
            result.push(None);
        }
    }

    result
}

/// Calculate Directional Movement Index components. Returns (+DI, -DI).
pub fn dmi(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    if high.is_empty() || period == 0 {
        return (vec![], vec![]);
    }

    let mut plus_dm = vec![0.0; high.len()];
    let mut minus_dm = vec![0.0; high.len()];

    for i in 1..high.len() {
        let up_move = high[i] - high[i - 1];
        let down_move = low[i - 1] - low[i];

        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    let smoothed_plus_dm = wilders_smooth(&plus_dm, period);
    let smoothed_minus_dm = wilders_smooth(&minus_dm, period);
    let atr_values = atr(high, low, close, period);

    let mut plus_di = Vec::with_capacity(high.len());
    let mut minus_di = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        match (
            smoothed_plus_dm.get(i),
            smoothed_minus_dm.get(i),
            atr_values.get(i),
        ) {
            (Some(Some(pdm)), Some(Some(mdm)), Some(Some(atr_val))) if *atr_val > 0.0 => {
                plus_di.push(Some(pdm / atr_val * 100.0));
                minus_di.push(Some(mdm / atr_val * 100.0));
            }
            _ => {
                plus_di.push(None);
                minus_di.push(None);
            }
        }
    }

    (plus_di, minus_di)
}

/// Calculate Average Directional Index (ADX) using Wilder's smoothing.
///
/// ADX requires 2*period - 1 warmup bars: one period for valid DI values,
/// a second for smoothing the DX series.
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 {
        return vec![];
    }

    let (plus_di, minus_di) = dmi(high, low, close, period);
    let di_start = period - 1;
    let mut result = vec![None; high.len()];

    let mut dx_values: Vec<f64> = Vec::new();
    for i in di_start..high.len() {
        if let (Some(pdi), Some(mdi)) = (
            plus_di.get(i).and_then(|x| *x),
            minus_di.get(i).and_then(|x| *x),
        ) {
            let sum = pdi + mdi;
            if sum > 0.0 {
                dx_values.push((pdi - mdi).abs() / sum * 100.0);
            } else {
                dx_values.push(0.0);
            }
        } else {
            dx_values.push(0.0);
        }
    }

    if dx_values.len() >= period {
        let mut adx_value: Option<f64> = None;

        for (j, &dx) in dx_values.iter().enumerate() {
            let bar_idx = di_start + j;

            if j + 1 < period {
                // Not enough DX values yet
            } else if j + 1 == period {
                let sum: f64 = dx_values[0..period].iter().sum();
                adx_value = Some(sum / period as f64);
                result[bar_idx] = adx_value;
            } else if let Some(prev_adx) = adx_value {
                let new_adx = (prev_adx * (period - 1) as f64 + dx) / period as f64;
                adx_value = Some(new_adx);
                result[bar_idx] = adx_value;
            }
        }
    }

    result
}

/// Calculate cumulative Volume Weighted Average Price over the given bars.
pub fn vwap(candles: &[Candle]) -> Option<f64> {
    let mut cumulative_tp_vol = 0.0;
    let mut cumulative_vol = 0.0;

    for c in candles {
        let typical_price = (c.high + c.low + c.close) / 3.0;
        cumulative_tp_vol += typical_price * c.volume;
        cumulative_vol += c.volume;
    }

    if cumulative_vol > 0.0 {
        Some(cumulative_tp_vol / cumulative_vol)
    } else {
        None
    }
}

/// Moving average of volume over the trailing `period` bars.
pub fn volume_ma(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let tail = &candles[candles.len() - period..];
    Some(tail.iter().map(|c| c.volume).sum::<f64>() / period as f64)
}

/// Highest high over the trailing `lookback` bars of the given slice.
pub fn highest_high(candles: &[Candle], lookback: usize) -> Option<f64> {
    if lookback == 0 || candles.len() < lookback {
        return None;
    }
    candles[candles.len() - lookback..]
        .iter()
        .map(|c| c.high)
        .fold(None, |acc: Option<f64>, h| {
            Some(acc.map_or(h, |a| a.max(h)))
        })
}

/// Lowest low over the trailing `lookback` bars of the given slice.
pub fn lowest_low(candles: &[Candle], lookback: usize) -> Option<f64> {
    if lookback == 0 || candles.len() < lookback {
        return None;
    }
    candles[candles.len() - lookback..]
        .iter()
        .map(|c| c.low)
        .fold(None, |acc: Option<f64>, l| {
            Some(acc.map_or(l, |a| a.min(l)))
        })
}

/// Bullish engulfing: a red bar followed by a green bar whose body engulfs it.
pub fn is_bullish_engulfing(prev: &Candle, curr: &Candle) -> bool {
    let prev_red = prev.close < prev.open;
    let curr_green = curr.close > curr.open;
    if !prev_red || !curr_green {
        return false;
    }

    if curr.body() <= prev.body() {
        return false;
    }

    curr.open <= prev.close && curr.close >= prev.open
}

/// Bullish hammer: long lower wick, short upper wick, close in the upper
/// half of the range.
pub fn is_bullish_hammer(c: &Candle) -> bool {
    let body = c.body();
    let range = c.high - c.low;
    if range <= 0.0 || body == 0.0 {
        return false;
    }

    let upper_wick = c.high - c.close.max(c.open);
    let lower_wick = c.close.min(c.open) - c.low;

    let lower_ok = lower_wick >= body * 2.0;
    let upper_ok = upper_wick <= body * 1.2;
    let close_upper_half = c.close > (c.high + c.low) / 2.0;

    lower_ok && upper_ok && close_upper_half
}

/// Last valid value of an indicator series.
pub fn last_value(series: &[Option<f64>]) -> Option<f64> {
    series.last().copied().flatten()
}
