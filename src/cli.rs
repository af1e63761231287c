//! CLI definition and dispatch.

use clap::{Parser, Subcommand, ValueEnum};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::backtest::{BacktestResult, run_backtest};
use crate::domain::config_validation::{
    backtest_config_from, instrument_from, strategy_kind_from, validate_config,
};
use crate::domain::error::TradesimError;
use crate::domain::instrument::InstrumentSpec;
use crate::domain::metrics::Metrics;
use crate::domain::position::ClosedTrade;
use crate::domain::sizing::{DEFAULT_RISK_TOLERANCE, SizingOutcome, size_or_fallback};
use crate::domain::strategy::{Strategy, StrategyKind};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;

#[derive(Parser, Debug)]
#[command(name = "tradesim", about = "Bar-by-bar strategy backtester")]
pub struct Cli {
    /// Debug-level logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a backtest
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Directory holding <SYMBOL>.csv bar files
        #[arg(short, long)]
        data_dir: PathBuf,
        /// Write the trade log as CSV
        #[arg(long)]
        trades_out: Option<PathBuf>,
    },
    /// Validate a configuration without running it
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Size one position and print the diagnostics
    Size {
        #[arg(long)]
        balance: f64,
        /// Fraction of balance to risk, e.g. 0.02
        #[arg(long)]
        risk: f64,
        #[arg(long)]
        entry: f64,
        #[arg(long)]
        stop: f64,
        #[arg(long)]
        symbol: String,
        /// Read instrument facts from this config
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        preset: Option<InstrumentPreset>,
        #[arg(long, default_value_t = DEFAULT_RISK_TOLERANCE)]
        tolerance: f64,
    },
    /// Print a strategy's parameter table
    Params {
        /// range_breakout, ma_crossover, ensemble or candle_pattern
        kind: String,
    },
    /// List symbols with bar files in a directory
    ListSymbols {
        #[arg(short, long)]
        data_dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InstrumentPreset {
    Forex,
    Metal,
    Index,
}

impl InstrumentPreset {
    pub fn spec(self, symbol: &str) -> InstrumentSpec {
        match self {
            InstrumentPreset::Forex => InstrumentSpec::forex(symbol),
            InstrumentPreset::Metal => InstrumentSpec::metal(symbol),
            InstrumentPreset::Index => InstrumentSpec::index(symbol),
        }
    }
}

/// Install the stderr subscriber. `RUST_LOG` applies unless `verbose`.
pub fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Backtest {
            config,
            data_dir,
            trades_out,
        } => run_backtest_command(&config, data_dir, trades_out.as_deref()),
        Command::Validate { config } => run_validate(&config),
        Command::Size {
            balance,
            risk,
            entry,
            stop,
            symbol,
            config,
            preset,
            tolerance,
        } => run_size(SizeRequest {
            balance,
            risk,
            entry,
            stop,
            symbol,
            config,
            preset,
            tolerance,
        }),
        Command::Params { kind } => run_params(&kind),
        Command::ListSymbols { data_dir } => run_list_symbols(data_dir),
    }
}

fn fail(err: TradesimError) -> ExitCode {
    eprintln!("error: {err}");
    (&err).into()
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(fail)
}

pub fn build_strategy(config: &dyn ConfigPort) -> Result<Box<dyn Strategy>, TradesimError> {
    strategy_kind_from(config)?.build(config)
}

pub struct PipelineOutput {
    pub result: BacktestResult,
    pub metrics: Metrics,
}

/// Config to metrics, with bars from `data`.
pub fn run_backtest_pipeline(
    config: &dyn ConfigPort,
    data: &dyn DataPort,
) -> Result<PipelineOutput, TradesimError> {
    let bt_config = backtest_config_from(config)?;
    let instrument = instrument_from(config, &bt_config.symbol)?;
    let mut strategy = build_strategy(config)?;

    let bars = data.fetch_bars(&bt_config.symbol, bt_config.start, bt_config.end)?;
    let result = run_backtest(strategy.as_mut(), &bars, instrument.as_ref(), &bt_config)?;
    let metrics = Metrics::compute(&result, bt_config.risk_free_rate, bt_config.periods_per_year);
    Ok(PipelineOutput { result, metrics })
}

fn run_backtest_command(config_path: &Path, data_dir: PathBuf, trades_out: Option<&Path>) -> ExitCode {
    // Stage 1: Load config
    eprintln!("Loading config from {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    // Stage 2: Validate before touching data
    if let Err(e) = validate_config(&adapter) {
        return fail(e);
    }

    // Stage 3: Run
    eprintln!("Reading bars from {}", data_dir.display());
    let data = CsvAdapter::new(data_dir);
    let output = match run_backtest_pipeline(&adapter, &data) {
        Ok(o) => o,
        Err(e) => return fail(e),
    };

    // Stage 4: Report
    print_summary(&output.result, &output.metrics);

    if let Some(path) = trades_out {
        if let Err(e) = write_trade_log_file(&output.result.trades, &output.result.instrument, path) {
            return fail(e);
        }
        eprintln!("\nTrade log written to: {}", path.display());
    }

    ExitCode::SUCCESS
}

pub fn print_summary(result: &BacktestResult, metrics: &Metrics) {
    eprintln!(
        "\n=== {} on {} ===",
        result.strategy_name, result.symbol
    );
    eprintln!("Initial Capital:  {:.2}", result.initial_capital);
    eprintln!("Final Balance:    {:.2}", result.final_balance);
    eprintln!("Final Equity:     {:.2}", result.final_equity);
    eprintln!("Total Return:     {:.2}%", metrics.total_return * 100.0);
    eprintln!("Annual Return:    {:.2}%", metrics.annualized_return * 100.0);
    eprintln!("Sharpe Ratio:     {:.2}", metrics.sharpe_ratio);
    eprintln!("Sortino Ratio:    {:.2}", metrics.sortino_ratio);
    eprintln!(
        "Max Drawdown:     -{:.1}% ({} bars)",
        metrics.max_drawdown * 100.0,
        metrics.max_drawdown_duration
    );
    eprintln!("Total Trades:     {}", metrics.total_trades);
    eprintln!(
        "Won / Lost / BE:  {} / {} / {}",
        metrics.trades_won, metrics.trades_lost, metrics.trades_breakeven
    );
    eprintln!("Win Rate:         {:.1}%", metrics.win_rate * 100.0);
    eprintln!("Profit Factor:    {:.2}", metrics.profit_factor);
    eprintln!("Expectancy:       {:.2}", metrics.expectancy);
    eprintln!(
        "Avg Win / Loss:   {:.2} / {:.2}",
        metrics.avg_win, metrics.avg_loss
    );
    eprintln!(
        "Max Streaks:      {} wins, {} losses",
        metrics.max_consecutive_wins, metrics.max_consecutive_losses
    );
    eprintln!(
        "Avg MAE / MFE:    {:.2} / {:.2}",
        metrics.avg_mae, metrics.avg_mfe
    );
    eprintln!("Avg Duration:     {:.1} bars", metrics.avg_trade_duration);
    eprintln!(
        "Costs:            commission {:.2}, slippage {:.2}, spread {:.2}",
        metrics.total_commission, metrics.total_slippage, metrics.total_spread_cost
    );
    eprintln!("Recovery Factor:  {:.2}", metrics.recovery_factor);
    eprintln!("Calmar Ratio:     {:.2}", metrics.calmar_ratio);

    let skipped = &result.skipped;
    eprintln!(
        "\nSignals: {} generated, {} skipped \
         (capacity {}, conflicting {}, margin {}, size {}, unmatched {}, final bar {})",
        result.signals_generated,
        skipped.total(),
        skipped.capacity,
        skipped.conflicting,
        skipped.margin,
        skipped.invalid_size,
        skipped.unmatched,
        skipped.final_bar
    );
    let fallbacks = result.sizing.iter().filter(|r| r.outcome.is_fallback()).count();
    if fallbacks > 0 {
        eprintln!("Sizing fallbacks: {fallbacks}");
    }
    if result.margin_calls > 0 || result.stop_outs > 0 {
        eprintln!(
            "Margin calls: {}, stop-outs: {}",
            result.margin_calls, result.stop_outs
        );
    }
    if metrics.forced_exits > 0 {
        eprintln!("Forced exits:     {}", metrics.forced_exits);
    }
}

const TRADE_LOG_HEADER: [&str; 17] = [
    "position_id",
    "symbol",
    "direction",
    "size",
    "entry_time",
    "exit_time",
    "entry_price",
    "exit_price",
    "pnl",
    "pnl_pct",
    "commission",
    "slippage",
    "spread_cost",
    "exit_reason",
    "mae",
    "mfe",
    "duration_bars",
];

/// Prices are written at the instrument's price precision and sizes at the
/// precision of its volume step.
pub fn write_trade_log<W: io::Write>(
    trades: &[ClosedTrade],
    instrument: &InstrumentSpec,
    writer: W,
) -> Result<(), TradesimError> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(TRADE_LOG_HEADER)?;
    for t in trades {
        wtr.write_record([
            t.position_id.to_string(),
            t.symbol.clone(),
            t.direction.to_string(),
            instrument.format_volume(t.size),
            t.entry_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            t.exit_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            instrument.format_price(t.entry_price),
            instrument.format_price(t.exit_price),
            format!("{:.2}", t.pnl),
            format!("{:.4}", t.pnl_pct),
            format!("{:.2}", t.commission),
            format!("{:.2}", t.slippage),
            format!("{:.2}", t.spread_cost),
            t.exit_reason.as_str().to_string(),
            format!("{:.2}", t.mae),
            format!("{:.2}", t.mfe),
            t.duration_bars.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_trade_log_file(
    trades: &[ClosedTrade],
    instrument: &InstrumentSpec,
    path: &Path,
) -> Result<(), TradesimError> {
    let file = std::fs::File::create(path)?;
    write_trade_log(trades, instrument, file)
}

fn run_validate(config_path: &Path) -> ExitCode {
    eprintln!("Validating config: {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    if let Err(e) = validate_config(&adapter) {
        return fail(e);
    }

    // validate_config succeeded, so these re-reads cannot fail.
    if let Ok(bt) = backtest_config_from(&adapter) {
        eprintln!("\nBacktest:");
        eprintln!("  symbol:          {}", bt.symbol);
        eprintln!("  initial_capital: {:.2}", bt.initial_capital);
        eprintln!("  leverage:        {}", bt.execution.leverage);
        eprintln!("  intrabar_policy: {:?}", bt.intrabar_policy);
        match instrument_from(&adapter, &bt.symbol) {
            Ok(Some(spec)) => eprintln!(
                "  instrument:      point {} contract {} volume {}..{} step {}",
                spec.point_size, spec.contract_size, spec.volume_min, spec.volume_max, spec.volume_step
            ),
            _ => eprintln!("  instrument:      none (conservative default will be used)"),
        }
    }
    if let Ok(strategy) = build_strategy(&adapter) {
        eprintln!("\nStrategy: {}", strategy.name());
        let risk = strategy.risk_settings();
        eprintln!("  risk_per_trade:  {}", risk.risk_fraction);
        eprintln!("  max_positions:   {}", strategy.max_positions());
    }

    eprintln!("\nConfiguration is valid.");
    ExitCode::SUCCESS
}

pub struct SizeRequest {
    pub balance: f64,
    pub risk: f64,
    pub entry: f64,
    pub stop: f64,
    pub symbol: String,
    pub config: Option<PathBuf>,
    pub preset: Option<InstrumentPreset>,
    pub tolerance: f64,
}

/// Instrument facts for `size`: config section, then preset, then the
/// conservative default.
pub fn resolve_instrument(
    symbol: &str,
    config: Option<&dyn ConfigPort>,
    preset: Option<InstrumentPreset>,
) -> Result<InstrumentSpec, TradesimError> {
    if let Some(config) = config
        && let Some(spec) = instrument_from(config, symbol)?
    {
        return Ok(spec);
    }
    if let Some(preset) = preset {
        return Ok(preset.spec(symbol));
    }
    warn!(symbol, "no instrument facts, using conservative defaults");
    Ok(InstrumentSpec::conservative_default(symbol))
}

pub fn size_position(req: &SizeRequest, spec: &InstrumentSpec) -> SizingOutcome {
    size_or_fallback(req.balance, req.risk, req.entry, req.stop, spec, req.tolerance)
}

fn run_size(req: SizeRequest) -> ExitCode {
    let adapter = match req.config.as_deref().map(load_config).transpose() {
        Ok(a) => a,
        Err(code) => return code,
    };
    let spec = match resolve_instrument(
        &req.symbol,
        adapter.as_ref().map(|a| a as &dyn ConfigPort),
        req.preset,
    ) {
        Ok(s) => s,
        Err(e) => return fail(e),
    };

    let outcome = size_position(&req, &spec);
    println!("symbol:          {}", spec.symbol);
    println!(
        "instrument:      point {} contract {} value/unit/lot {}",
        spec.point_size,
        spec.contract_size,
        spec.value_per_unit_per_lot()
    );
    println!("stop distance:   {:.1} units", outcome.stop_distance_units);
    println!("raw lots:        {:.4}", outcome.raw_lots);
    println!("lots:            {}", spec.format_volume(outcome.lots));
    println!("requested risk:  {:.2}", outcome.requested_risk);
    println!("actual risk:     {:.2}", outcome.actual_risk);
    println!("deviation:       {:.1}%", outcome.risk_deviation() * 100.0);
    if outcome.clamped {
        println!("note:            clamped to volume limits");
    }
    if !outcome.within_tolerance {
        println!("note:            outside {:.0}% tolerance", req.tolerance * 100.0);
    }
    if let Some(reason) = &outcome.fallback_reason {
        println!("fallback:        {reason}");
    }
    ExitCode::SUCCESS
}

fn run_params(kind: &str) -> ExitCode {
    let Some(kind) = StrategyKind::parse(kind) else {
        return fail(TradesimError::invalid(
            "strategy",
            "kind",
            format!("unknown strategy '{kind}'"),
        ));
    };
    println!(
        "{:<28} {:>10} {:>10} {:>8} {:>10}",
        "name", "min", "max", "step", "default"
    );
    for range in kind.parameter_ranges() {
        println!("{range}");
    }
    ExitCode::SUCCESS
}

fn run_list_symbols(data_dir: PathBuf) -> ExitCode {
    let adapter = CsvAdapter::new(data_dir.clone());
    let symbols = match adapter.list_symbols() {
        Ok(s) => s,
        Err(e) => return fail(e),
    };

    if symbols.is_empty() {
        eprintln!("No symbols found in {}", data_dir.display());
    } else {
        for symbol in &symbols {
            println!("{}", symbol);
        }
        eprintln!("{} symbols found", symbols.len());
    }
    ExitCode::SUCCESS
}
