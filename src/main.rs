//! Regime trader - main entry point
//!
//! Two subcommands:
//! - run: start the trading loops (paper mode)
//! - regime: one-shot regime diagnosis for a symbol

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "regime-trader")]
#[command(about = "Regime-driven automated trading engine with layered capital allocation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading loops
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/markets.json")]
        config: String,

        /// Paper trading mode (simulated fills, no real orders)
        #[arg(long)]
        paper: bool,

        /// Live trading mode (requires a venue broker integration)
        #[arg(long)]
        live: bool,
    },

    /// Diagnose the current regime for a symbol
    Regime {
        /// Symbol to classify
        #[arg(short, long, default_value = "BTCUSDT")]
        symbol: String,

        /// Candle timeframe (15m, 1h, 4h)
        #[arg(short, long, default_value = "15m")]
        timeframe: String,

        /// Number of candles to fetch
        #[arg(short, long, default_value = "250")]
        limit: usize,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Regime { .. } => "regime",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            config,
            paper,
            live,
        } => commands::run::run(config, paper, live),

        Commands::Regime {
            symbol,
            timeframe,
            limit,
        } => commands::regime::run(symbol, timeframe, limit),
    }
}
