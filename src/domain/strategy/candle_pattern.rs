//! Two bearish candles followed by a larger bullish candle. Long only.

use super::{IndicatorFrame, ParamRange, Strategy, read_param, read_risk_settings};
use crate::domain::error::{StrategyError, TradesimError};
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::risk::RiskSettings;
use crate::domain::signal::{Signal, SignalType};
use crate::ports::config_port::ConfigPort;

pub const PARAM_RANGES: &[ParamRange] = &[
    ParamRange::new("risk_reward", 1.5, 3.0, 0.5, 2.0),
    ParamRange::new("min_body_ratio", 0.5, 2.0, 0.25, 1.0),
    ParamRange::new("risk_per_trade", 0.01, 0.03, 0.005, 0.02),
];

#[derive(Debug, Clone, PartialEq)]
pub struct CandlePatternParams {
    pub risk_reward: f64,
    /// Bullish body must be at least this multiple of the second bearish body.
    pub min_body_ratio: f64,
    pub risk_per_trade: f64,
}

impl Default for CandlePatternParams {
    fn default() -> Self {
        CandlePatternParams {
            risk_reward: 2.0,
            min_body_ratio: 1.0,
            risk_per_trade: 0.02,
        }
    }
}

impl CandlePatternParams {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, TradesimError> {
        Ok(CandlePatternParams {
            risk_reward: read_param(config, PARAM_RANGES, "risk_reward")?,
            min_body_ratio: read_param(config, PARAM_RANGES, "min_body_ratio")?,
            risk_per_trade: read_param(config, PARAM_RANGES, "risk_per_trade")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CandlePattern {
    params: CandlePatternParams,
    risk: RiskSettings,
}

impl CandlePattern {
    pub fn new(params: CandlePatternParams, risk: RiskSettings) -> Self {
        CandlePattern { params, risk }
    }

    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, TradesimError> {
        let params = CandlePatternParams::from_config(config)?;
        let defaults = RiskSettings {
            risk_fraction: params.risk_per_trade,
            risk_reward_ratio: params.risk_reward,
            ..RiskSettings::default()
        };
        let risk = read_risk_settings(config, defaults)?;
        Ok(Self::new(params, risk))
    }
}

impl Strategy for CandlePattern {
    fn name(&self) -> &str {
        "candle_pattern"
    }

    fn calculate_indicators(&mut self, bars: &[OhlcvBar]) -> Result<IndicatorFrame, StrategyError> {
        let mut frame = IndicatorFrame::new(bars);
        frame.insert("body", bars.iter().map(|b| Some(b.body())).collect())?;
        Ok(frame)
    }

    fn generate_signals(&mut self, frame: &IndicatorFrame) -> Result<Vec<Signal>, StrategyError> {
        let body = frame.require("body")?;
        let mut signals = Vec::new();

        for i in 2..frame.len() {
            let (first, second, current) = (&frame.bars[i - 2], &frame.bars[i - 1], &frame.bars[i]);
            if !(first.is_bearish() && second.is_bearish() && current.is_bullish()) {
                continue;
            }
            let (Some(second_body), Some(current_body)) = (body[i - 1], body[i]) else {
                continue;
            };
            if second_body == 0.0 {
                continue;
            }
            let ratio = current_body / second_body;
            if ratio < self.params.min_body_ratio {
                continue;
            }

            let entry = current.close;
            let stop = second.low;
            let risk = entry - stop;
            if risk <= 0.0 {
                continue;
            }
            signals.push(
                Signal::new(current.timestamp, SignalType::Buy, entry)
                    .with_stop_loss(stop)
                    .with_take_profit(entry + risk * self.params.risk_reward)
                    .with_number("body_ratio", ratio)
                    .with_text("pattern", "two_bearish_reversal"),
            );
        }
        Ok(signals)
    }

    fn risk_settings(&self) -> &RiskSettings {
        &self.risk
    }

    fn parameter_ranges(&self) -> &'static [ParamRange] {
        PARAM_RANGES
    }
}
