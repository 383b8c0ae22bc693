//! One-shot regime diagnosis.
//!
//! Fetches a candle window for the given symbol and prints the detector's
//! verdict with the per-rule checks, without touching any state.

use anyhow::{Context, Result};

use regime_trader::broker::MarketData;
use regime_trader::regime::engine::{detect_market_regime, RegimeSettings};
use regime_trader::regime::macro_classifier::{classify_macro_regime, MacroRegimeConfig};
use regime_trader::timeframe::Timeframe;
use regime_trader::types::Symbol;
use regime_trader::venue::BinanceMarketData;

pub fn run(symbol: String, timeframe: String, limit: usize) -> Result<()> {
    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(symbol, timeframe, limit))
}

async fn run_async(symbol: String, timeframe: String, limit: usize) -> Result<()> {
    let timeframe = Timeframe::parse(&timeframe);
    let symbol = Symbol::new(symbol);

    let data = BinanceMarketData::new("USDT", 10);
    let candles = data
        .get_bars(&symbol, timeframe, limit)
        .await
        .with_context(|| format!("failed to fetch candles for {}", symbol))?;

    let settings = RegimeSettings {
        proxy_symbol: symbol.as_str().to_string(),
        timeframe,
        ..RegimeSettings::default()
    }
    .sanitized();

    let detection = detect_market_regime(&candles, &settings);

    println!("symbol:     {}", symbol);
    println!("timeframe:  {}", timeframe);
    println!("candles:    {}", candles.len());
    println!();
    println!("regime:     {}", detection.regime);
    println!("confidence: {:.2}", detection.confidence);
    println!("reason:     {}", detection.reason);

    if let Some(metrics) = detection.metrics {
        println!();
        println!("atr ratio:  {:.3}", metrics.atr_ratio);
        println!("vol ratio:  {:.3}", metrics.volume_ratio);
        println!("rsi:        {:.1}", metrics.rsi);
        println!("slope:      {:.3}%", metrics.slope_pct);
    }

    for (name, summary) in [
        ("BREAKOUT", &detection.checks.breakout),
        ("TREND", &detection.checks.trend),
        ("RANGE", &detection.checks.range),
    ] {
        let Some(summary) = summary else { continue };
        println!();
        println!(
            "{}: {}/{} ({:.0}%)",
            name,
            summary.met,
            summary.total,
            summary.confidence * 100.0
        );
        for check in &summary.checks {
            let mark = if check.passed { "ok " } else { "MISS" };
            println!(
                "  [{}] {:<16} actual={:<10.4} target={}",
                mark, check.label, check.actual, check.target
            );
        }
    }

    let macro_regime = classify_macro_regime(&candles, &MacroRegimeConfig::default());
    println!();
    println!("macro:      {}", macro_regime);

    Ok(())
}
