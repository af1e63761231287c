//! Reading and validating run configuration.
//!
//! Every numeric key is parsed strictly: a value that is present but not a
//! number is a `ConfigInvalid` error rather than a silent default.

use chrono::{NaiveDate, NaiveDateTime};

use crate::domain::backtest::BacktestConfig;
use crate::domain::error::TradesimError;
use crate::domain::execution::ExecutionConfig;
use crate::domain::exit::IntrabarPolicy;
use crate::domain::instrument::{
    DEFAULT_VOLUME_MAX, DEFAULT_VOLUME_MIN, DEFAULT_VOLUME_STEP, InstrumentSpec,
};
use crate::domain::strategy::StrategyKind;
use crate::ports::config_port::ConfigPort;

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Parse `YYYY-MM-DD[ HH:MM[:SS]]`. A bare date is midnight.
pub fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

pub(crate) fn number(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<f64, TradesimError> {
    match config.get_string(section, key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| TradesimError::invalid(section, key, format!("'{raw}' is not a number"))),
    }
}

pub(crate) fn flag(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: bool,
) -> Result<bool, TradesimError> {
    match config.get_string(section, key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            _ => Err(TradesimError::invalid(section, key, format!("'{raw}' is not a boolean"))),
        },
    }
}

fn datetime(config: &dyn ConfigPort, key: &str) -> Result<Option<NaiveDateTime>, TradesimError> {
    match config.get_string("backtest", key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => parse_datetime(&raw).map(Some).ok_or_else(|| {
            TradesimError::invalid(
                "backtest",
                key,
                format!("'{raw}' is not a datetime, expected YYYY-MM-DD[ HH:MM:SS]"),
            )
        }),
    }
}

pub fn symbol_from(config: &dyn ConfigPort) -> Result<String, TradesimError> {
    match config.get_string("backtest", "symbol") {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(TradesimError::ConfigMissing {
            section: "backtest".to_string(),
            key: "symbol".to_string(),
        }),
    }
}

/// Build and validate the `[backtest]` section.
pub fn backtest_config_from(config: &dyn ConfigPort) -> Result<BacktestConfig, TradesimError> {
    let defaults = BacktestConfig::default();
    let exec_defaults = ExecutionConfig::default();

    let intrabar_policy = match config.get_string("backtest", "intrabar_policy") {
        None => defaults.intrabar_policy,
        Some(raw) => IntrabarPolicy::parse(&raw).ok_or_else(|| {
            TradesimError::invalid(
                "backtest",
                "intrabar_policy",
                format!("'{raw}' is not one of stop_first, target_first"),
            )
        })?,
    };

    let execution = ExecutionConfig {
        commission_per_trade: number(
            config,
            "backtest",
            "commission_per_trade",
            exec_defaults.commission_per_trade,
        )?,
        commission_pct: number(config, "backtest", "commission_pct", exec_defaults.commission_pct)?,
        slippage_pct: number(config, "backtest", "slippage_pct", exec_defaults.slippage_pct)?,
        use_spread: flag(config, "backtest", "use_spread", exec_defaults.use_spread)?,
        default_spread_points: number(
            config,
            "backtest",
            "default_spread_points",
            exec_defaults.default_spread_points,
        )?,
        leverage: number(config, "backtest", "leverage", exec_defaults.leverage)?,
    };

    let risk_free_rate = number(config, "backtest", "risk_free_rate", defaults.risk_free_rate)?;
    if !(0.0..1.0).contains(&risk_free_rate) {
        return Err(TradesimError::invalid(
            "backtest",
            "risk_free_rate",
            "risk_free_rate must be between 0 and 1",
        ));
    }

    let backtest = BacktestConfig {
        symbol: symbol_from(config)?,
        initial_capital: number(config, "backtest", "initial_capital", defaults.initial_capital)?,
        execution,
        margin_call_level: number(
            config,
            "backtest",
            "margin_call_level",
            defaults.margin_call_level,
        )?,
        stop_out_level: number(config, "backtest", "stop_out_level", defaults.stop_out_level)?,
        intrabar_policy,
        risk_free_rate,
        periods_per_year: number(config, "backtest", "periods_per_year", defaults.periods_per_year)?,
        start: datetime(config, "start")?,
        end: datetime(config, "end")?,
    };
    backtest.validate()?;
    Ok(backtest)
}

const INSTRUMENT_KEYS: &[&str] = &[
    "point_size",
    "contract_size",
    "volume_min",
    "volume_max",
    "volume_step",
];

fn required(config: &dyn ConfigPort, section: &str, key: &str) -> Result<f64, TradesimError> {
    if config.get_string(section, key).is_none() {
        return Err(TradesimError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        });
    }
    number(config, section, key, 0.0)
}

/// Instrument facts from `[instrument.<symbol>]`, else `[instrument]`.
/// A section counts as present when it sets any instrument key; it must then
/// carry both `point_size` and `contract_size`. `Ok(None)` when neither
/// section is present.
pub fn instrument_from(
    config: &dyn ConfigPort,
    symbol: &str,
) -> Result<Option<InstrumentSpec>, TradesimError> {
    let present = |section: &str| {
        INSTRUMENT_KEYS
            .iter()
            .any(|key| config.get_string(section, key).is_some())
    };
    let scoped = format!("instrument.{symbol}");
    let section = if present(&scoped) {
        scoped
    } else if present("instrument") {
        "instrument".to_string()
    } else {
        return Ok(None);
    };

    let point_size = required(config, &section, "point_size")?;
    let contract_size = required(config, &section, "contract_size")?;

    let spec = InstrumentSpec {
        symbol: symbol.to_string(),
        point_size,
        contract_size,
        volume_min: number(config, &section, "volume_min", DEFAULT_VOLUME_MIN)?,
        volume_max: number(config, &section, "volume_max", DEFAULT_VOLUME_MAX)?,
        volume_step: number(config, &section, "volume_step", DEFAULT_VOLUME_STEP)?,
    };
    spec.validate()
        .map_err(|e| TradesimError::invalid(&section, "point_size", e.to_string()))?;
    Ok(Some(spec))
}

pub fn strategy_kind_from(config: &dyn ConfigPort) -> Result<StrategyKind, TradesimError> {
    let raw = config
        .get_string("strategy", "kind")
        .ok_or_else(|| TradesimError::ConfigMissing {
            section: "strategy".to_string(),
            key: "kind".to_string(),
        })?;
    StrategyKind::parse(&raw).ok_or_else(|| {
        let known: Vec<&str> = StrategyKind::ALL.iter().map(|k| k.as_str()).collect();
        TradesimError::invalid(
            "strategy",
            "kind",
            format!("unknown strategy '{raw}', expected one of {}", known.join(", ")),
        )
    })
}

/// Check every section a backtest reads without running anything.
pub fn validate_config(config: &dyn ConfigPort) -> Result<(), TradesimError> {
    let backtest = backtest_config_from(config)?;
    instrument_from(config, &backtest.symbol)?;
    strategy_kind_from(config)?.build(config)?;
    Ok(())
}
