//! Backtest engine.
//!
//! A run is a sequential fold over bars in timestamp order. Per bar:
//! 1. widen the running extremes of positions opened on earlier bars,
//! 2. apply the strategy's exit decision for each of them,
//! 3. check the margin level (margin call warning, stop-out),
//! 4. open positions for signals stamped with this bar,
//! 5. sample the equity curve.
//!
//! Positions still open at the final bar are closed at its close with
//! [`ExitReason::EndOfData`].

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use super::account::{Account, EquityPoint};
use super::error::{StrategyError, StrategyStage, TradesimError};
use super::exit::{ExitDecision, IntrabarPolicy};
use super::execution::{
    ExecutionConfig, close_position, open_position, partial_close, required_margin,
};
use super::instrument::InstrumentSpec;
use super::ohlcv::OhlcvBar;
use super::position::{ClosedTrade, ExitReason};
use super::signal::{Signal, SignalType};
use super::sizing::SizingOutcome;
use super::strategy::Strategy;

/// Share of equity that used margin may reach after a new entry.
pub const MAX_MARGIN_USAGE: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub symbol: String,
    pub initial_capital: f64,
    pub execution: ExecutionConfig,
    /// Equity / used margin below which a margin call is logged.
    pub margin_call_level: f64,
    /// Equity / used margin below which every position is closed.
    pub stop_out_level: f64,
    pub intrabar_policy: IntrabarPolicy,
    pub risk_free_rate: f64,
    /// Bars per year, for annualizing returns and ratios.
    pub periods_per_year: f64,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            symbol: String::new(),
            initial_capital: 10_000.0,
            execution: ExecutionConfig::default(),
            margin_call_level: 0.5,
            stop_out_level: 0.2,
            intrabar_policy: IntrabarPolicy::default(),
            risk_free_rate: 0.02,
            periods_per_year: 252.0,
            start: None,
            end: None,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), TradesimError> {
        let positive = |key: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(TradesimError::invalid("backtest", key, format!("must be positive, got {v}")))
            }
        };
        let non_negative = |key: &str, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(TradesimError::invalid(
                    "backtest",
                    key,
                    format!("must be non-negative, got {v}"),
                ))
            }
        };

        positive("initial_capital", self.initial_capital)?;
        positive("leverage", self.execution.leverage)?;
        positive("periods_per_year", self.periods_per_year)?;
        non_negative("commission_per_trade", self.execution.commission_per_trade)?;
        non_negative("commission_pct", self.execution.commission_pct)?;
        non_negative("slippage_pct", self.execution.slippage_pct)?;
        non_negative("default_spread_points", self.execution.default_spread_points)?;
        positive("stop_out_level", self.stop_out_level)?;
        positive("margin_call_level", self.margin_call_level)?;
        if self.stop_out_level >= self.margin_call_level {
            return Err(TradesimError::invalid(
                "backtest",
                "stop_out_level",
                format!(
                    "must be below margin_call_level ({} >= {})",
                    self.stop_out_level, self.margin_call_level
                ),
            ));
        }
        if let (Some(start), Some(end)) = (self.start, self.end)
            && start > end
        {
            return Err(TradesimError::invalid(
                "backtest",
                "start",
                format!("start {start} is after end {end}"),
            ));
        }
        Ok(())
    }
}

/// Sizing diagnostic for one opened position.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingRecord {
    pub timestamp: NaiveDateTime,
    pub signal_type: SignalType,
    pub outcome: SizingOutcome,
}

/// Why signals did not become positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkippedSignals {
    /// The strategy's position limit was reached.
    pub capacity: usize,
    /// An opposite-direction position was open.
    pub conflicting: usize,
    /// The entry would push used margin past the limit.
    pub margin: usize,
    /// Risk management produced no usable size.
    pub invalid_size: usize,
    /// Stamped with a timestamp that matches no bar.
    pub unmatched: usize,
    /// Stamped on the final bar.
    pub final_bar: usize,
}

impl SkippedSignals {
    pub fn total(&self) -> usize {
        self.capacity
            + self.conflicting
            + self.margin
            + self.invalid_size
            + self.unmatched
            + self.final_bar
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestResult {
    pub strategy_name: String,
    pub symbol: String,
    /// Instrument facts the run used, after any fallback.
    pub instrument: InstrumentSpec,
    pub trades: Vec<ClosedTrade>,
    pub equity_curve: Vec<EquityPoint>,
    pub initial_capital: f64,
    pub final_balance: f64,
    pub final_equity: f64,
    pub sizing: Vec<SizingRecord>,
    pub signals_generated: usize,
    pub skipped: SkippedSignals,
    pub margin_calls: usize,
    pub stop_outs: usize,
}

impl BacktestResult {
    pub fn total_return(&self) -> f64 {
        (self.final_equity - self.initial_capital) / self.initial_capital
    }

    pub fn forced_exits(&self) -> usize {
        self.trades
            .iter()
            .filter(|t| t.exit_reason.is_forced())
            .count()
    }
}

/// Timestamps must strictly increase.
pub fn check_bar_order(bars: &[OhlcvBar]) -> Result<(), TradesimError> {
    for (i, pair) in bars.windows(2).enumerate() {
        if pair[1].timestamp <= pair[0].timestamp {
            let reason = if pair[1].timestamp == pair[0].timestamp {
                "duplicate timestamp".to_string()
            } else {
                format!("timestamp goes backwards from {}", pair[0].timestamp)
            };
            return Err(TradesimError::DataAnomaly {
                index: i + 1,
                timestamp: pair[1].timestamp,
                reason,
            });
        }
    }
    Ok(())
}

struct StrategyFailure<'a> {
    strategy: &'a str,
    account: &'a Account,
    contract_size: f64,
}

impl StrategyFailure<'_> {
    fn wrap(
        &self,
        stage: StrategyStage,
        bar: Option<(usize, &OhlcvBar)>,
        err: StrategyError,
    ) -> TradesimError {
        let equity = match bar {
            Some((_, b)) => self.account.equity(b.close, self.contract_size),
            None => self.account.balance,
        };
        TradesimError::Strategy {
            strategy: self.strategy.to_string(),
            stage,
            bar_index: bar.map(|(i, _)| i),
            timestamp: bar.map(|(_, b)| b.timestamp),
            reason: err.message,
            balance: self.account.balance,
            equity,
        }
    }
}

/// Replay `bars` through `strategy`. Missing instrument facts fall back to
/// the conservative currency-pair defaults with a warning.
pub fn run_backtest(
    strategy: &mut dyn Strategy,
    bars: &[OhlcvBar],
    instrument: Option<&InstrumentSpec>,
    config: &BacktestConfig,
) -> Result<BacktestResult, TradesimError> {
    config.validate()?;
    let instrument = match instrument {
        Some(spec) => spec.clone(),
        None => {
            warn!(
                symbol = %config.symbol,
                "no instrument facts, using conservative defaults; results are approximate"
            );
            InstrumentSpec::conservative_default(config.symbol.clone())
        }
    };
    instrument
        .validate()
        .map_err(|e| TradesimError::invalid("instrument", &instrument.symbol, e.to_string()))?;

    if bars.is_empty() {
        return Err(TradesimError::NoData {
            symbol: config.symbol.clone(),
        });
    }
    check_bar_order(bars)?;

    strategy.reset();
    let strategy_name = strategy.name().to_string();
    let contract = instrument.contract_size;
    let exec = &config.execution;
    let mut account = Account::new(config.initial_capital);

    info!(
        strategy = %strategy_name,
        symbol = %config.symbol,
        bars = bars.len(),
        "starting backtest"
    );

    let frame = match strategy.calculate_indicators(bars) {
        Ok(frame) if frame.len() == bars.len() => frame,
        Ok(frame) => {
            let err = StrategyError::new(format!(
                "indicator frame has {} bars, expected {}",
                frame.len(),
                bars.len()
            ));
            return Err(failure(&strategy_name, &account, contract).wrap(
                StrategyStage::CalculateIndicators,
                None,
                err,
            ));
        }
        Err(err) => {
            return Err(failure(&strategy_name, &account, contract).wrap(
                StrategyStage::CalculateIndicators,
                None,
                err,
            ));
        }
    };
    let signals = strategy.generate_signals(&frame).map_err(|err| {
        failure(&strategy_name, &account, contract).wrap(StrategyStage::GenerateSignals, None, err)
    })?;

    let signals_generated = signals.len();
    let mut skipped = SkippedSignals::default();
    let mut by_time: BTreeMap<NaiveDateTime, Vec<Signal>> = BTreeMap::new();
    for signal in signals {
        by_time.entry(signal.timestamp).or_default().push(signal);
    }
    let matched: usize = bars
        .iter()
        .filter_map(|b| by_time.get(&b.timestamp).map(Vec::len))
        .sum();
    skipped.unmatched = signals_generated - matched;
    if skipped.unmatched > 0 {
        warn!(count = skipped.unmatched, "signals with no matching bar ignored");
    }

    let mut sizing = Vec::new();
    let mut margin_calls = 0;
    let mut stop_outs = 0;
    let last = bars.len() - 1;

    for (i, bar) in bars.iter().enumerate() {
        for position in account.positions.iter_mut().filter(|p| p.entry_bar < i) {
            position.update_extremes(bar);
            position.bars_held += 1;
        }

        let mut idx = 0;
        while idx < account.positions.len() {
            if account.positions[idx].entry_bar == i {
                idx += 1;
                continue;
            }
            let decision = strategy
                .check_exit_conditions(&account.positions[idx], bar, config.intrabar_policy)
                .map_err(|err| {
                    failure(&strategy_name, &account, contract).wrap(
                        StrategyStage::CheckExitConditions,
                        Some((i, bar)),
                        err,
                    )
                })?;
            match decision {
                ExitDecision::Hold => idx += 1,
                ExitDecision::Close { price, reason } => {
                    if let Some(trade) =
                        close_position(&mut account, idx, price, bar, reason, &instrument, exec)
                    {
                        info!(
                            position_id = trade.position_id,
                            reason = %trade.exit_reason,
                            exit_price = trade.exit_price,
                            pnl = trade.pnl,
                            "closed position"
                        );
                    }
                }
                ExitDecision::PartialClose { fraction, price } => {
                    if let Some(trade) =
                        partial_close(&mut account, idx, fraction, price, bar, &instrument, exec)
                    {
                        info!(
                            position_id = trade.position_id,
                            lots = trade.size,
                            pnl = trade.pnl,
                            "partial take-profit"
                        );
                    }
                    idx += 1;
                }
                ExitDecision::MoveStop { new_stop, stage } => {
                    let position = &mut account.positions[idx];
                    if position.improves_stop(new_stop) {
                        debug!(
                            position_id = position.id,
                            from = ?position.stop_loss,
                            to = new_stop,
                            ?stage,
                            "stop moved"
                        );
                        position.stop_loss = Some(new_stop);
                        position.stage = position.stage.max(stage);
                    }
                    idx += 1;
                }
            }
        }

        if let Some(level) = account.margin_level(bar.close, contract, exec.leverage) {
            if level < config.stop_out_level {
                warn!(
                    timestamp = %bar.timestamp,
                    margin_level = level,
                    positions = account.position_count(),
                    "stop-out, closing all positions"
                );
                stop_outs += 1;
                while account.has_positions() {
                    close_position(
                        &mut account,
                        0,
                        bar.close,
                        bar,
                        ExitReason::StopOut,
                        &instrument,
                        exec,
                    );
                }
            } else if level < config.margin_call_level {
                warn!(timestamp = %bar.timestamp, margin_level = level, "margin call");
                margin_calls += 1;
            }
        }

        if let Some(bar_signals) = by_time.get(&bar.timestamp) {
            for signal in bar_signals {
                if i == last {
                    skipped.final_bar += 1;
                    continue;
                }
                if account.position_count() >= strategy.max_positions() {
                    debug!(timestamp = %bar.timestamp, "position limit reached, signal skipped");
                    skipped.capacity += 1;
                    continue;
                }
                let direction = signal.direction();
                if account.positions.iter().any(|p| p.direction != direction) {
                    debug!(timestamp = %bar.timestamp, "opposite position open, signal skipped");
                    skipped.conflicting += 1;
                    continue;
                }

                let managed =
                    strategy.manage_risk(signal.clone(), bar.close, account.balance, &instrument);
                let lots = managed.signal.position_size.unwrap_or(0.0);
                if !(lots.is_finite() && lots > 0.0) {
                    warn!(timestamp = %bar.timestamp, lots, "unusable position size, signal skipped");
                    skipped.invalid_size += 1;
                    continue;
                }

                let required = required_margin(managed.signal.price, lots, &instrument, exec.leverage);
                let used = account.used_margin(bar.close, contract, exec.leverage);
                let equity = account.equity(bar.close, contract);
                if used + required > MAX_MARGIN_USAGE * equity {
                    warn!(
                        timestamp = %bar.timestamp,
                        required_margin = required,
                        used_margin = used,
                        equity,
                        "insufficient margin, signal skipped"
                    );
                    skipped.margin += 1;
                    continue;
                }

                let position = open_position(
                    &mut account,
                    &managed.signal,
                    lots,
                    bar,
                    i,
                    &instrument,
                    exec,
                );
                info!(
                    position_id = position.id,
                    direction = %position.direction,
                    entry_price = position.entry_price,
                    lots,
                    stop_loss = ?position.stop_loss,
                    take_profit = ?position.take_profit,
                    "opened position"
                );
                if let Some(outcome) = managed.sizing {
                    sizing.push(SizingRecord {
                        timestamp: bar.timestamp,
                        signal_type: managed.signal.signal_type,
                        outcome,
                    });
                }
            }
        }

        if i == last {
            while account.has_positions() {
                if let Some(trade) = close_position(
                    &mut account,
                    0,
                    bar.close,
                    bar,
                    ExitReason::EndOfData,
                    &instrument,
                    exec,
                ) {
                    info!(position_id = trade.position_id, pnl = trade.pnl, "forced exit at end of data");
                }
            }
        }

        account.record_equity(bar.timestamp, bar.close, contract);
    }

    let final_equity = account.equity(bars[last].close, contract);
    info!(
        trades = account.closed_trades.len(),
        final_balance = account.balance,
        skipped = skipped.total(),
        "backtest finished"
    );

    Ok(BacktestResult {
        strategy_name,
        symbol: config.symbol.clone(),
        instrument,
        trades: account.closed_trades,
        equity_curve: account.equity_curve,
        initial_capital: account.initial_capital,
        final_balance: account.balance,
        final_equity,
        sizing,
        signals_generated,
        skipped,
        margin_calls,
        stop_outs,
    })
}

fn failure<'a>(strategy: &'a str, account: &'a Account, contract_size: f64) -> StrategyFailure<'a> {
    StrategyFailure {
        strategy,
        account,
        contract_size,
    }
}
