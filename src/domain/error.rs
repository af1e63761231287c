//! Domain error types.

use chrono::NaiveDateTime;
use std::fmt;

/// Where in a run a strategy hook failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyStage {
    CalculateIndicators,
    GenerateSignals,
    CheckExitConditions,
}

impl fmt::Display for StrategyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyStage::CalculateIndicators => write!(f, "calculate_indicators"),
            StrategyStage::GenerateSignals => write!(f, "generate_signals"),
            StrategyStage::CheckExitConditions => write!(f, "check_exit_conditions"),
        }
    }
}

/// Error raised from inside a strategy hook. Always a logic bug in the
/// strategy, never an expected runtime condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct StrategyError {
    pub message: String,
}

impl StrategyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level error type for tradesim.
#[derive(Debug, thiserror::Error)]
pub enum TradesimError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error("no data for {symbol}")]
    NoData { symbol: String },

    #[error("data anomaly at bar {index} ({timestamp}): {reason}")]
    DataAnomaly {
        index: usize,
        timestamp: NaiveDateTime,
        reason: String,
    },

    #[error(
        "strategy '{strategy}' failed in {stage}{location}: {reason} \
         (balance {balance:.2}, equity {equity:.2})",
        location = format_location(*bar_index, *timestamp)
    )]
    Strategy {
        strategy: String,
        stage: StrategyStage,
        bar_index: Option<usize>,
        timestamp: Option<NaiveDateTime>,
        reason: String,
        balance: f64,
        equity: f64,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_location(bar_index: Option<usize>, timestamp: Option<NaiveDateTime>) -> String {
    match (bar_index, timestamp) {
        (Some(i), Some(ts)) => format!(" at bar {i} ({ts})"),
        (Some(i), None) => format!(" at bar {i}"),
        (None, Some(ts)) => format!(" at {ts}"),
        (None, None) => String::new(),
    }
}

impl TradesimError {
    pub fn invalid(section: &str, key: &str, reason: impl Into<String>) -> Self {
        TradesimError::ConfigInvalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<&TradesimError> for std::process::ExitCode {
    fn from(err: &TradesimError) -> Self {
        let code: u8 = match err {
            TradesimError::Io(_) | TradesimError::Csv(_) => 1,
            TradesimError::ConfigParse { .. }
            | TradesimError::ConfigMissing { .. }
            | TradesimError::ConfigInvalid { .. } => 2,
            TradesimError::Data { .. } | TradesimError::NoData { .. } => 5,
            TradesimError::DataAnomaly { .. } => 6,
            TradesimError::Strategy { .. } => 7,
        };
        std::process::ExitCode::from(code)
    }
}
