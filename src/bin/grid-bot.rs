// Grid Optimizer CLI
// Single entry point for backtests, volatility classification and parameter search

use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};

use grid_optimizer::backtesting::load_candles_json;
use grid_optimizer::clustering::{classify, preset_for, CoinProfile};
use grid_optimizer::core::optimal_grid_count;
use grid_optimizer::db::StoredResult;
use grid_optimizer::optimization::Scorer;
use grid_optimizer::progress::Spinner;
use grid_optimizer::{
    AppConfig, BacktestEngine, BacktestResult, CancellationToken, Database, GridError, GridResult, Optimizer,
};

#[derive(Parser)]
#[command(name = "grid-bot")]
#[command(version = "0.3.0")]
#[command(about = "Grid trading backtester and parameter optimizer", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Backtest the configured grid over a candle file
    Backtest {
        /// JSON array of candles
        #[arg(long)]
        candles: PathBuf,

        /// Override the configured symbol
        #[arg(short, long)]
        symbol: Option<String>,

        /// Store the result in the database
        #[arg(long)]
        save: bool,
    },

    /// Classify an instrument into a volatility cluster
    Classify {
        #[arg(long)]
        candles: PathBuf,

        #[arg(short, long)]
        symbol: Option<String>,
    },

    /// Search grid parameters inside the instrument's cluster preset
    Optimize {
        #[arg(long)]
        candles: PathBuf,

        #[arg(short, long)]
        symbol: Option<String>,

        /// Continue a previously stored checkpoint
        #[arg(long)]
        resume: Option<String>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// List stored optimization checkpoints for a symbol
    Checkpoints {
        #[arg(short, long)]
        symbol: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Config is loaded before logging so its level can apply; init skips it
    let config = match &cli.command {
        Commands::Init { .. } => None,
        _ => match AppConfig::from_file(&cli.config) {
            Ok(config) => Some(config),
            Err(e) => {
                init_logging(cli.verbose, None);
                error!("❌ Configuration Error");
                error!("{}", e);
                if !cli.config.exists() {
                    error!("💡 Quick fix: run `grid-bot init` to create {}", cli.config.display());
                }
                std::process::exit(1);
            }
        },
    };
    init_logging(cli.verbose, config.as_ref());

    let outcome = match (cli.command, config) {
        (Commands::Init { force }, _) => init_config(&cli.config, force),
        (Commands::Backtest { candles, symbol, save }, Some(config)) => {
            run_backtest(&config, &candles, symbol, save)
        }
        (Commands::Classify { candles, symbol }, Some(config)) => run_classify(&config, &candles, symbol),
        (Commands::Optimize { candles, symbol, resume, no_progress }, Some(config)) => {
            run_optimize(&config, &candles, symbol, resume, !no_progress)
        }
        (Commands::Checkpoints { symbol }, Some(config)) => list_checkpoints(&config, symbol),
        (_, None) => Err(GridError::invalid_config("configuration was not loaded")),
    };

    if let Err(e) = outcome {
        error!("❌ [{}] {}", e.category(), e.user_message());
        std::process::exit(if e.is_bug() { 2 } else { 1 });
    }
}

fn init_logging(verbose: bool, config: Option<&AppConfig>) {
    let level = if verbose {
        Level::DEBUG
    } else {
        config
            .and_then(|c| Level::from_str(&c.logging.level).ok())
            .unwrap_or(Level::INFO)
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn init_config(path: &Path, force: bool) -> GridResult<()> {
    info!("🔧 Initializing configuration...");
    if path.exists() && !force {
        warn!("⚠️  {} already exists, skipping (use --force to overwrite)", path.display());
        return Ok(());
    }
    AppConfig::default().to_file(path)?;
    info!("📝 Created {}", path.display());
    info!("💡 Next steps:");
    info!("   1. Edit the [grid] and [backtest] sections");
    info!("   2. Run: grid-bot classify --candles <file.json>");
    info!("   3. Run: grid-bot optimize --candles <file.json>");
    Ok(())
}

fn run_backtest(config: &AppConfig, candles_path: &Path, symbol: Option<String>, save: bool) -> GridResult<()> {
    let mut backtest = config.backtest_config();
    if let Some(symbol) = symbol {
        backtest.symbol = symbol;
    }
    let candles = load_candles_json(candles_path)?;
    info!("📂 Loaded {} candles from {}", candles.len(), candles_path.display());

    let result = BacktestEngine::new(backtest).run(&candles)?;
    print_result(&result);

    if save {
        let db = Database::new(&config.database.path)?;
        let id = StoredResult::insert(&db.get_connection(), &result)?;
        info!("💾 Saved result #{} to {}", id, config.database.path);
    }
    Ok(())
}

fn run_classify(config: &AppConfig, candles_path: &Path, symbol: Option<String>) -> GridResult<()> {
    let symbol = symbol.unwrap_or_else(|| config.backtest.symbol.clone());
    let candles = load_candles_json(candles_path)?;
    let profile = CoinProfile::from_candles(&symbol, &candles, config.clustering.atr_period)?;
    let cluster = classify(&profile, Some(&config.clustering.thresholds))?;
    let preset = preset_for(cluster);

    info!("📊 {} over {} candles", symbol, profile.samples);
    info!("   ATR:         {:.3}%", profile.atr_pct * 100.0);
    info!("   Avg volume:  {:.2}", profile.avg_volume);
    info!("   Typical gap: {:.3}%", profile.typical_gap_pct * 100.0);
    info!("🧭 Cluster: {} ({})", cluster, preset.label);
    info!("   Level counts: {:?}", preset.level_counts);
    info!("   Bound widths: {:?}", preset.bound_widths);
    info!(
        "💡 Suggested levels for the configured {:.4} - {:.4} grid: {}",
        config.grid.lower_price,
        config.grid.upper_price,
        optimal_grid_count(profile.atr_pct, config.grid.bounds())
    );
    Ok(())
}

fn run_optimize(
    config: &AppConfig,
    candles_path: &Path,
    symbol: Option<String>,
    resume: Option<String>,
    show_progress: bool,
) -> GridResult<()> {
    let mut backtest = config.backtest_config();
    if let Some(symbol) = symbol {
        backtest.symbol = symbol;
    }
    let candles = load_candles_json(candles_path)?;

    let spinner = Spinner::new("Profiling price history...");
    let profile = match CoinProfile::from_candles(&backtest.symbol, &candles, config.clustering.atr_period) {
        Ok(profile) => {
            spinner.finish(&format!("Profiled {} candles", profile.samples));
            profile
        }
        Err(e) => {
            spinner.finish_with_error("Profiling failed");
            return Err(e);
        }
    };

    let optimizer = Optimizer::for_profile(
        backtest,
        config.optimization.clone(),
        &profile,
        Some(&config.clustering.thresholds),
        &candles,
    )?
    .with_progress(show_progress);

    let db = Database::new(&config.database.path)?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    match ctrlc::set_handler(move || on_interrupt.cancel()) {
        Ok(()) => info!("💡 Press Ctrl-C to stop after the current batch"),
        Err(e) => warn!("⚠️  Could not install the Ctrl-C handler: {}", e),
    }
    let outcome = match resume {
        Some(id) => optimizer.resume(&id, &db, &cancel)?,
        None => optimizer.optimize(&db, &cancel)?,
    };

    info!("🏆 Top candidates ({}):", outcome.checkpoint.objective.name());
    for trial in outcome.ranked().iter().take(5) {
        info!(
            "   #{} {} score {:.4} return {:.2}% drawdown {:.2}% cycles {}",
            trial.rank,
            trial.candidate.label(),
            trial.score,
            trial.summary.total_return_pct,
            trial.summary.max_drawdown_pct,
            trial.summary.completed_cycles
        );
    }
    if !outcome.checkpoint.failures.is_empty() {
        warn!("⚠️  {} candidates failed", outcome.checkpoint.failures.len());
    }
    if let Some(result) = &outcome.best_result {
        print_result(result);
    }
    info!("🔖 Checkpoint id: {}", outcome.checkpoint.id);
    Ok(())
}

fn list_checkpoints(config: &AppConfig, symbol: Option<String>) -> GridResult<()> {
    let symbol = symbol.unwrap_or_else(|| config.backtest.symbol.clone());
    let db = Database::new(&config.database.path)?;
    let records = db.list_checkpoints(&symbol)?;

    info!("📋 Checkpoints for {}", symbol);
    if records.is_empty() {
        info!("  None yet. Run: grid-bot optimize --candles <file.json>");
    }
    for record in records {
        info!(
            "  {} [{}] cluster {} batches {} best {}",
            record.id,
            record.phase,
            record.cluster.as_deref().unwrap_or("-"),
            record.batches_completed,
            record
                .best_score
                .map(|s| format!("{:.4}", s))
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn print_result(result: &BacktestResult) {
    let m = &result.metrics;
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "📈 {} grid {:.4} - {:.4} x {} levels ({:?})",
        result.symbol,
        result.grid_config.lower_price,
        result.grid_config.upper_price,
        result.grid_config.level_count,
        result.grid_config.spacing
    );
    info!("   Total return:      {:.2}%", m.total_return_pct);
    info!("   Final equity:      {:.2}", m.final_equity);
    info!("   Realized P&L:      {:.2}", m.realized_pnl);
    info!("   Max drawdown:      {:.2}%", m.max_drawdown_pct);
    info!("   Sharpe ratio:      {:.3}", m.sharpe_ratio);
    info!("   Capital efficiency: {:.4}", m.capital_efficiency);
    info!("   Cycles:            {} ({:.1}% winning)", m.completed_cycles, m.win_rate_pct);
    info!("   Fees paid:         {:.4}", m.total_fees_paid);
    if result.rebalance_count > 0 {
        info!("   Rebalances:        {}", result.rebalance_count);
    }
    if result.skipped_candles > 0 {
        warn!("⚠️  Skipped {} malformed or out-of-order candles", result.skipped_candles);
    }
    info!("   Termination:       {:?}", result.termination);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
