//! Strategy contract and the built-in strategy variants.
//!
//! A [`Strategy`] owns all of its state. Indicator calculation and signal
//! generation must be causal: anything computed for bar `i` may only read bars
//! `0..=i`. Risk management and exit checks have shared default
//! implementations that variants may override.

pub mod candle_pattern;
pub mod ensemble;
pub mod ma_crossover;
pub mod range_breakout;

use std::collections::BTreeMap;
use std::fmt;

use crate::domain::config_validation::number;
use crate::domain::error::{StrategyError, TradesimError};
use crate::domain::exit::{ExitDecision, ExitRules, IntrabarPolicy, evaluate_exit};
use crate::domain::instrument::InstrumentSpec;
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::position::Position;
use crate::domain::risk::{ManagedSignal, RiskSettings, manage_risk_default};
use crate::domain::signal::Signal;
use crate::ports::config_port::ConfigPort;

pub use candle_pattern::CandlePattern;
pub use ensemble::EnsembleStrategy;
pub use ma_crossover::MaCrossover;
pub use range_breakout::RangeBreakout;

/// Bars plus named derived columns of the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorFrame {
    pub bars: Vec<OhlcvBar>,
    columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl IndicatorFrame {
    pub fn new(bars: &[OhlcvBar]) -> Self {
        IndicatorFrame {
            bars: bars.to_vec(),
            columns: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn insert(&mut self, name: &str, column: Vec<Option<f64>>) -> Result<(), StrategyError> {
        if column.len() != self.bars.len() {
            return Err(StrategyError::new(format!(
                "column '{name}' has {} values for {} bars",
                column.len(),
                self.bars.len()
            )));
        }
        self.columns.insert(name.to_string(), column);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Like [`column`](Self::column), but a missing column is an error.
    pub fn require(&self, name: &str) -> Result<&[Option<f64>], StrategyError> {
        self.column(name)
            .ok_or_else(|| StrategyError::new(format!("indicator column '{name}' is missing")))
    }

    pub fn value(&self, name: &str, index: usize) -> Option<f64> {
        self.columns
            .get(name)
            .and_then(|c| c.get(index).copied().flatten())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}

/// Documented valid range of one tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamRange {
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub default: f64,
}

impl ParamRange {
    pub const fn new(name: &'static str, min: f64, max: f64, step: f64, default: f64) -> Self {
        ParamRange {
            name,
            min,
            max,
            step,
            default,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl fmt::Display for ParamRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<28} {:>10} {:>10} {:>8} {:>10}",
            self.name, self.min, self.max, self.step, self.default
        )
    }
}

pub fn find_range<'a>(ranges: &'a [ParamRange], name: &str) -> Option<&'a ParamRange> {
    ranges.iter().find(|r| r.name == name)
}

/// Check `value` against the range named `name`.
pub fn check_param(ranges: &[ParamRange], name: &str, value: f64) -> Result<(), TradesimError> {
    let range = find_range(ranges, name)
        .ok_or_else(|| TradesimError::invalid("strategy", name, "unknown parameter"))?;
    if !value.is_finite() || !range.contains(value) {
        return Err(TradesimError::invalid(
            "strategy",
            name,
            format!("{value} outside [{}, {}]", range.min, range.max),
        ));
    }
    Ok(())
}

/// Read parameter `name` from `[strategy]`, defaulting to the table value and
/// rejecting non-numeric or out-of-range input.
pub fn read_param(
    config: &dyn ConfigPort,
    ranges: &[ParamRange],
    name: &str,
) -> Result<f64, TradesimError> {
    let range = find_range(ranges, name)
        .ok_or_else(|| TradesimError::invalid("strategy", name, "unknown parameter"))?;
    let value = number(config, "strategy", name, range.default)?;
    check_param(ranges, name, value)?;
    Ok(value)
}

/// Shared `[strategy]` risk keys on top of `defaults`.
pub fn read_risk_settings(
    config: &dyn ConfigPort,
    defaults: RiskSettings,
) -> Result<RiskSettings, TradesimError> {
    let settings = RiskSettings {
        risk_fraction: number(config, "strategy", "risk_per_trade", defaults.risk_fraction)?,
        atr_stop_multiplier: number(
            config,
            "strategy",
            "atr_stop_multiplier",
            defaults.atr_stop_multiplier,
        )?,
        fixed_stop_pct: number(config, "strategy", "fixed_stop_pct", defaults.fixed_stop_pct)?,
        risk_reward_ratio: number(
            config,
            "strategy",
            "risk_reward_ratio",
            defaults.risk_reward_ratio,
        )?,
        risk_tolerance: number(config, "backtest", "risk_tolerance", defaults.risk_tolerance)?,
    };
    settings.validate()?;
    Ok(settings)
}

pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Attach derived columns to `bars`. Must not look ahead.
    fn calculate_indicators(&mut self, bars: &[OhlcvBar]) -> Result<IndicatorFrame, StrategyError>;

    /// Signals in bar order. The signal for bar `i` may only depend on bars
    /// `0..=i` of `frame`.
    fn generate_signals(&mut self, frame: &IndicatorFrame) -> Result<Vec<Signal>, StrategyError>;

    fn risk_settings(&self) -> &RiskSettings;

    fn exit_rules(&self) -> ExitRules {
        ExitRules::default()
    }

    /// Fill missing stop-loss, take-profit and size on `signal`.
    fn manage_risk(
        &self,
        signal: Signal,
        current_price: f64,
        balance: f64,
        instrument: &InstrumentSpec,
    ) -> ManagedSignal {
        manage_risk_default(
            signal,
            current_price,
            balance,
            instrument,
            self.risk_settings(),
        )
    }

    fn check_exit_conditions(
        &self,
        position: &Position,
        bar: &OhlcvBar,
        policy: IntrabarPolicy,
    ) -> Result<ExitDecision, StrategyError> {
        Ok(evaluate_exit(position, bar, &self.exit_rules(), policy))
    }

    fn max_positions(&self) -> usize {
        1
    }

    /// Drop any state carried over from a previous run.
    fn reset(&mut self) {}

    fn parameter_ranges(&self) -> &'static [ParamRange];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RangeBreakout,
    MaCrossover,
    Ensemble,
    CandlePattern,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::RangeBreakout,
        StrategyKind::MaCrossover,
        StrategyKind::Ensemble,
        StrategyKind::CandlePattern,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "range_breakout" => Some(StrategyKind::RangeBreakout),
            "ma_crossover" => Some(StrategyKind::MaCrossover),
            "ensemble" => Some(StrategyKind::Ensemble),
            "candle_pattern" => Some(StrategyKind::CandlePattern),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::RangeBreakout => "range_breakout",
            StrategyKind::MaCrossover => "ma_crossover",
            StrategyKind::Ensemble => "ensemble",
            StrategyKind::CandlePattern => "candle_pattern",
        }
    }

    pub fn parameter_ranges(self) -> &'static [ParamRange] {
        match self {
            StrategyKind::RangeBreakout => range_breakout::PARAM_RANGES,
            StrategyKind::MaCrossover => ma_crossover::PARAM_RANGES,
            StrategyKind::Ensemble => ensemble::PARAM_RANGES,
            StrategyKind::CandlePattern => candle_pattern::PARAM_RANGES,
        }
    }

    /// Build the strategy from the `[strategy]` section.
    pub fn build(self, config: &dyn ConfigPort) -> Result<Box<dyn Strategy>, TradesimError> {
        Ok(match self {
            StrategyKind::RangeBreakout => Box::new(RangeBreakout::from_config(config)?),
            StrategyKind::MaCrossover => Box::new(MaCrossover::from_config(config)?),
            StrategyKind::Ensemble => Box::new(EnsembleStrategy::from_config(config)?),
            StrategyKind::CandlePattern => Box::new(CandlePattern::from_config(config)?),
        })
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;
    use test_support::bars_from_closes;

    const RANGES: &[ParamRange] = &[ParamRange::new("fast_period", 2.0, 50.0, 1.0, 10.0)];

    #[test]
    fn frame_rejects_mismatched_column() {
        let mut frame = IndicatorFrame::new(&bars_from_closes(&[1.0, 2.0]));
        assert!(frame.insert("x", vec![Some(1.0)]).is_err());
        assert!(frame.insert("x", vec![None, Some(1.0)]).is_ok());
        assert_eq!(frame.value("x", 0), None);
        assert_eq!(frame.value("x", 1), Some(1.0));
        assert_eq!(frame.value("x", 5), None);
        assert!(frame.require("y").is_err());
        assert_eq!(frame.column_names().collect::<Vec<_>>(), vec!["x"]);
    }

    #[test]
    fn read_param_defaults_and_validates() {
        let empty = FileConfigAdapter::from_string("[strategy]\n").unwrap();
        assert_eq!(read_param(&empty, RANGES, "fast_period").unwrap(), 10.0);

        let set = FileConfigAdapter::from_string("[strategy]\nfast_period = 12\n").unwrap();
        assert_eq!(read_param(&set, RANGES, "fast_period").unwrap(), 12.0);

        let high = FileConfigAdapter::from_string("[strategy]\nfast_period = 500\n").unwrap();
        let err = read_param(&high, RANGES, "fast_period").unwrap_err();
        assert!(matches!(err, TradesimError::ConfigInvalid { .. }));

        let junk = FileConfigAdapter::from_string("[strategy]\nfast_period = ten\n").unwrap();
        assert!(read_param(&junk, RANGES, "fast_period").is_err());
    }

    #[test]
    fn risk_settings_from_config() {
        let config = FileConfigAdapter::from_string(
            "[strategy]\nrisk_per_trade = 0.01\nrisk_reward_ratio = 3\n",
        )
        .unwrap();
        let settings = read_risk_settings(&config, RiskSettings::default()).unwrap();
        assert_eq!(settings.risk_fraction, 0.01);
        assert_eq!(settings.risk_reward_ratio, 3.0);
        assert_eq!(settings.atr_stop_multiplier, 2.0);

        let bad = FileConfigAdapter::from_string("[strategy]\nrisk_per_trade = 0\n").unwrap();
        assert!(read_risk_settings(&bad, RiskSettings::default()).is_err());
    }

    #[test]
    fn non_numeric_risk_keys_are_rejected() {
        for line in [
            "[strategy]\nrisk_per_trade = 2%\n",
            "[strategy]\nrisk_per_trade = abc\n",
            "[strategy]\natr_stop_multiplier = two\n",
            "[backtest]\nrisk_tolerance = 0,1\n",
        ] {
            let config = FileConfigAdapter::from_string(line).unwrap();
            let result = read_risk_settings(&config, RiskSettings::default());
            assert!(
                matches!(result, Err(TradesimError::ConfigInvalid { .. })),
                "{line:?} was accepted"
            );
        }
    }

    #[test]
    fn strategy_kind_parse_round_trip() {
        for kind in StrategyKind::ALL {
            assert_eq!(StrategyKind::parse(kind.as_str()), Some(kind));
            assert!(!kind.parameter_ranges().is_empty());
        }
        assert_eq!(StrategyKind::parse("martingale"), None);
    }

    #[test]
    fn every_table_default_is_in_range() {
        for kind in StrategyKind::ALL {
            for range in kind.parameter_ranges() {
                assert!(range.min <= range.max, "{}", range.name);
                assert!(range.step > 0.0, "{}", range.name);
                assert!(range.contains(range.default), "{} default", range.name);
            }
        }
    }

    #[test]
    fn build_each_kind_from_empty_config() {
        let config = FileConfigAdapter::from_string("[strategy]\n").unwrap();
        for kind in StrategyKind::ALL {
            let strategy = kind.build(&config).unwrap();
            assert!(!strategy.name().is_empty());
        }
    }
}
