#![allow(dead_code)]

use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use tradesim::domain::backtest::BacktestConfig;
use tradesim::domain::error::{StrategyError, TradesimError};
use tradesim::domain::execution::ExecutionConfig;
use tradesim::domain::exit::ExitRules;
pub use tradesim::domain::ohlcv::OhlcvBar;
use tradesim::domain::risk::RiskSettings;
use tradesim::domain::signal::{Signal, SignalType};
use tradesim::domain::strategy::{IndicatorFrame, ParamRange, Strategy};
use tradesim::ports::data_port::DataPort;

pub struct MockDataPort {
    pub data: HashMap<String, Vec<OhlcvBar>>,
    pub errors: HashMap<String, String>,
}

impl MockDataPort {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn with_bars(mut self, symbol: &str, bars: Vec<OhlcvBar>) -> Self {
        self.data.insert(symbol.to_string(), bars);
        self
    }

    pub fn with_error(mut self, symbol: &str, reason: &str) -> Self {
        self.errors.insert(symbol.to_string(), reason.to_string());
        self
    }
}

impl DataPort for MockDataPort {
    fn fetch_bars(
        &self,
        symbol: &str,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<Vec<OhlcvBar>, TradesimError> {
        if let Some(reason) = self.errors.get(symbol) {
            return Err(TradesimError::Data {
                reason: reason.clone(),
            });
        }
        let bars = self.data.get(symbol).ok_or_else(|| TradesimError::NoData {
            symbol: symbol.to_string(),
        })?;
        Ok(bars
            .iter()
            .filter(|b| start.is_none_or(|s| b.timestamp >= s))
            .filter(|b| end.is_none_or(|e| b.timestamp <= e))
            .cloned()
            .collect())
    }

    fn list_symbols(&self) -> Result<Vec<String>, TradesimError> {
        let mut symbols: Vec<String> = self.data.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }
}

pub fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 4)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Timestamp of hourly bar `i`.
pub fn ts(i: usize) -> NaiveDateTime {
    start() + Duration::hours(i as i64)
}

pub fn make_bar(i: usize, open: f64, high: f64, low: f64, close: f64) -> OhlcvBar {
    OhlcvBar {
        timestamp: ts(i),
        open,
        high,
        low,
        close,
        volume: 1000.0,
        spread: None,
    }
}

pub fn flat_bars(n: usize, price: f64) -> Vec<OhlcvBar> {
    (0..n).map(|i| make_bar(i, price, price + 1.0, price - 1.0, price)).collect()
}

/// Hourly bars that open at the previous close.
pub fn bars_from_closes(closes: &[f64]) -> Vec<OhlcvBar> {
    let mut prev = closes.first().copied().unwrap_or(0.0);
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let bar = make_bar(i, prev, prev.max(c) + 0.5, prev.min(c) - 0.5, c);
            prev = c;
            bar
        })
        .collect()
}

/// Deterministic zig-zag walk around `base` with amplitude `swing`.
pub fn wave_bars(n: usize, base: f64, swing: f64) -> Vec<OhlcvBar> {
    let closes: Vec<f64> = (0..n)
        .map(|i| {
            let t = i as f64;
            base + swing * (t / 7.0).sin() + swing * 0.4 * (t / 2.3).cos()
        })
        .collect();
    bars_from_closes(&closes)
}

pub fn index_config(symbol: &str) -> BacktestConfig {
    BacktestConfig {
        symbol: symbol.to_string(),
        execution: ExecutionConfig {
            use_spread: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn buy(i: usize, price: f64, stop: f64, target: f64) -> Signal {
    Signal::new(ts(i), SignalType::Buy, price)
        .with_stop_loss(stop)
        .with_take_profit(target)
}

/// Replays a fixed signal list; optionally fails in `generate_signals`.
pub struct ScriptedStrategy {
    pub signals: Vec<Signal>,
    pub risk: RiskSettings,
    pub rules: ExitRules,
    pub fail: bool,
}

impl ScriptedStrategy {
    pub fn new(signals: Vec<Signal>) -> Self {
        Self {
            signals,
            risk: RiskSettings::default(),
            rules: ExitRules::default(),
            fail: false,
        }
    }

    pub fn with_rules(mut self, rules: ExitRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }
}

impl Strategy for ScriptedStrategy {
    fn name(&self) -> &str {
        "scripted"
    }

    fn calculate_indicators(&mut self, bars: &[OhlcvBar]) -> Result<IndicatorFrame, StrategyError> {
        Ok(IndicatorFrame::new(bars))
    }

    fn generate_signals(&mut self, _frame: &IndicatorFrame) -> Result<Vec<Signal>, StrategyError> {
        if self.fail {
            return Err(StrategyError::new("indicator column misaligned"));
        }
        Ok(self.signals.clone())
    }

    fn risk_settings(&self) -> &RiskSettings {
        &self.risk
    }

    fn exit_rules(&self) -> ExitRules {
        self.rules.clone()
    }

    fn parameter_ranges(&self) -> &'static [ParamRange] {
        &[]
    }
}

pub const SAMPLE_INI: &str = r#"
[backtest]
symbol = US30
initial_capital = 10000
leverage = 100
use_spread = false

[instrument.US30]
point_size = 1
contract_size = 1
volume_min = 0.01
volume_max = 100
volume_step = 0.01

[strategy]
kind = ma_crossover
ma_type = sma
fast_period = 5
slow_period = 20
rsi_period = 10
rsi_overbought = 80
rsi_oversold = 20
atr_period = 7
"#;
