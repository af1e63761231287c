//! Moving-average crossover with an RSI filter.
//!
//! Buy when the fast average crosses above the slow one while RSI is below
//! the overbought level; sell on the mirror cross while RSI is above the
//! oversold level. Stops sit `atr_multiplier` ATRs from the close and
//! targets `risk_reward` stop distances away.

use super::{IndicatorFrame, ParamRange, Strategy, read_param, read_risk_settings};
use crate::domain::error::{StrategyError, TradesimError};
use crate::domain::indicator::{calculate_atr, calculate_ema, calculate_rsi, calculate_sma};
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::risk::{ATR_METADATA_KEY, RiskSettings};
use crate::domain::signal::{Signal, SignalType};
use crate::ports::config_port::ConfigPort;

pub const PARAM_RANGES: &[ParamRange] = &[
    ParamRange::new("fast_period", 5.0, 20.0, 1.0, 10.0),
    ParamRange::new("slow_period", 20.0, 50.0, 2.0, 30.0),
    ParamRange::new("rsi_period", 10.0, 20.0, 2.0, 14.0),
    ParamRange::new("rsi_overbought", 60.0, 80.0, 5.0, 70.0),
    ParamRange::new("rsi_oversold", 20.0, 40.0, 5.0, 30.0),
    ParamRange::new("atr_period", 7.0, 21.0, 1.0, 14.0),
    ParamRange::new("atr_multiplier", 1.5, 3.0, 0.25, 2.0),
    ParamRange::new("risk_reward", 1.5, 3.5, 0.25, 2.5),
];

/// ATR fallback as a fraction of the close while ATR is warming up.
const ATR_FALLBACK_PCT: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaType {
    Sma,
    Ema,
}

impl MaType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sma" => Some(MaType::Sma),
            "ema" => Some(MaType::Ema),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaCrossoverParams {
    pub fast_period: usize,
    pub slow_period: usize,
    pub ma_type: MaType,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub risk_reward: f64,
}

impl Default for MaCrossoverParams {
    fn default() -> Self {
        MaCrossoverParams {
            fast_period: 10,
            slow_period: 30,
            ma_type: MaType::Ema,
            rsi_period: 14,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            atr_period: 14,
            atr_multiplier: 2.0,
            risk_reward: 2.5,
        }
    }
}

impl MaCrossoverParams {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, TradesimError> {
        let p = |name: &str| read_param(config, PARAM_RANGES, name);
        let ma_type = match config.get_string("strategy", "ma_type") {
            None => MaType::Ema,
            Some(raw) => MaType::parse(&raw).ok_or_else(|| {
                TradesimError::invalid("strategy", "ma_type", format!("'{raw}' is not sma or ema"))
            })?,
        };
        let params = MaCrossoverParams {
            fast_period: p("fast_period")? as usize,
            slow_period: p("slow_period")? as usize,
            ma_type,
            rsi_period: p("rsi_period")? as usize,
            rsi_overbought: p("rsi_overbought")?,
            rsi_oversold: p("rsi_oversold")?,
            atr_period: p("atr_period")? as usize,
            atr_multiplier: p("atr_multiplier")?,
            risk_reward: p("risk_reward")?,
        };
        if params.fast_period >= params.slow_period {
            return Err(TradesimError::invalid(
                "strategy",
                "fast_period",
                "must be less than slow_period",
            ));
        }
        Ok(params)
    }
}

#[derive(Debug, Clone)]
pub struct MaCrossover {
    params: MaCrossoverParams,
    risk: RiskSettings,
}

impl MaCrossover {
    pub fn new(params: MaCrossoverParams, risk: RiskSettings) -> Self {
        MaCrossover { params, risk }
    }

    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, TradesimError> {
        let params = MaCrossoverParams::from_config(config)?;
        let defaults = RiskSettings {
            atr_stop_multiplier: params.atr_multiplier,
            risk_reward_ratio: params.risk_reward,
            ..RiskSettings::default()
        };
        let risk = read_risk_settings(config, defaults)?;
        Ok(Self::new(params, risk))
    }

    fn moving_average(&self, bars: &[OhlcvBar], period: usize) -> Vec<Option<f64>> {
        match self.params.ma_type {
            MaType::Sma => calculate_sma(bars, period).to_column(),
            MaType::Ema => calculate_ema(bars, period).to_column(),
        }
    }
}

impl Strategy for MaCrossover {
    fn name(&self) -> &str {
        "ma_crossover"
    }

    fn calculate_indicators(&mut self, bars: &[OhlcvBar]) -> Result<IndicatorFrame, StrategyError> {
        let mut frame = IndicatorFrame::new(bars);
        frame.insert("fast_ma", self.moving_average(bars, self.params.fast_period))?;
        frame.insert("slow_ma", self.moving_average(bars, self.params.slow_period))?;
        frame.insert("rsi", calculate_rsi(bars, self.params.rsi_period).to_column())?;
        frame.insert("atr", calculate_atr(bars, self.params.atr_period).to_column())?;
        Ok(frame)
    }

    fn generate_signals(&mut self, frame: &IndicatorFrame) -> Result<Vec<Signal>, StrategyError> {
        let mut signals = Vec::new();
        for i in 1..frame.len() {
            let (Some(fast), Some(slow), Some(prev_fast), Some(prev_slow), Some(rsi)) = (
                frame.value("fast_ma", i),
                frame.value("slow_ma", i),
                frame.value("fast_ma", i - 1),
                frame.value("slow_ma", i - 1),
                frame.value("rsi", i),
            ) else {
                continue;
            };

            let crossed_up = prev_fast <= prev_slow && fast > slow;
            let crossed_down = prev_fast >= prev_slow && fast < slow;
            let signal_type = if crossed_up && rsi < self.params.rsi_overbought {
                SignalType::Buy
            } else if crossed_down && rsi > self.params.rsi_oversold {
                SignalType::Sell
            } else {
                continue;
            };

            let bar = &frame.bars[i];
            let atr = frame
                .value("atr", i)
                .unwrap_or(bar.close * ATR_FALLBACK_PCT);
            let sign = signal_type.direction().sign();
            let stop_distance = atr * self.params.atr_multiplier;

            signals.push(
                Signal::new(bar.timestamp, signal_type, bar.close)
                    .with_stop_loss(bar.close - sign * stop_distance)
                    .with_take_profit(bar.close + sign * stop_distance * self.params.risk_reward)
                    .with_number("fast_ma", fast)
                    .with_number("slow_ma", slow)
                    .with_number("rsi", rsi)
                    .with_number(ATR_METADATA_KEY, atr),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;
    use crate::domain::strategy::find_range;
    use crate::domain::strategy::test_support::bars_from_closes;
    use approx::assert_relative_eq;

    fn small(overbought: f64, oversold: f64) -> MaCrossover {
        let params = MaCrossoverParams {
            fast_period: 2,
            slow_period: 4,
            ma_type: MaType::Sma,
            rsi_period: 2,
            rsi_overbought: overbought,
            rsi_oversold: oversold,
            atr_period: 3,
            atr_multiplier: 2.0,
            risk_reward: 2.5,
        };
        MaCrossover::new(params, RiskSettings::default())
    }

    fn run(strategy: &mut MaCrossover, closes: &[f64]) -> (IndicatorFrame, Vec<Signal>) {
        let frame = strategy
            .calculate_indicators(&bars_from_closes(closes))
            .unwrap();
        let signals = strategy.generate_signals(&frame).unwrap();
        (frame, signals)
    }

    #[test]
    fn defaults_match_parameter_table() {
        let p = MaCrossoverParams::default();
        let d = |name| find_range(PARAM_RANGES, name).unwrap().default;
        assert_eq!(p.fast_period as f64, d("fast_period"));
        assert_eq!(p.slow_period as f64, d("slow_period"));
        assert_eq!(p.rsi_overbought, d("rsi_overbought"));
        assert_eq!(p.atr_multiplier, d("atr_multiplier"));
        assert_eq!(p.risk_reward, d("risk_reward"));

        let config = FileConfigAdapter::from_string("[strategy]\n").unwrap();
        assert_eq!(MaCrossoverParams::from_config(&config).unwrap(), p);
    }

    #[test]
    fn bullish_cross_with_atr_stop() {
        // SMA(2) crosses above SMA(4) at index 6; RSI(2) there is 83.3.
        let closes = [10.0, 9.0, 8.0, 7.0, 6.0, 7.0, 9.0, 11.0];
        let (frame, signals) = run(&mut small(90.0, 10.0), &closes);
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.signal_type, SignalType::Buy);
        assert_eq!(s.timestamp, frame.bars[6].timestamp);
        assert_relative_eq!(s.price, 9.0);

        let atr = frame.value("atr", 6).unwrap();
        assert_relative_eq!(s.stop_loss.unwrap(), 9.0 - 2.0 * atr, epsilon = 1e-12);
        assert_relative_eq!(s.take_profit.unwrap(), 9.0 + 5.0 * atr, epsilon = 1e-12);
        assert_relative_eq!(s.number("rsi").unwrap(), 100.0 - 100.0 / 6.0, epsilon = 1e-9);
    }

    #[test]
    fn overbought_rsi_blocks_buy() {
        let closes = [10.0, 9.0, 8.0, 7.0, 6.0, 7.0, 9.0, 11.0];
        let (_, signals) = run(&mut small(70.0, 30.0), &closes);
        assert!(signals.is_empty());
    }

    #[test]
    fn bearish_cross_respects_oversold() {
        let closes = [5.0, 6.0, 7.0, 8.0, 9.0, 8.0, 6.0, 4.0];
        let (_, blocked) = run(&mut small(90.0, 30.0), &closes);
        assert!(blocked.is_empty());

        let (_, signals) = run(&mut small(90.0, 10.0), &closes);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::Sell);
        assert!(signals[0].stop_loss.unwrap() > signals[0].price);
    }

    #[test]
    fn too_few_bars_yields_nothing() {
        let (_, signals) = run(&mut small(90.0, 10.0), &[10.0, 9.0, 11.0]);
        assert!(signals.is_empty());
    }

    #[test]
    fn fast_must_be_below_slow() {
        let config =
            FileConfigAdapter::from_string("[strategy]\nfast_period = 20\nslow_period = 20\n")
                .unwrap();
        assert!(MaCrossoverParams::from_config(&config).is_err());

        let config = FileConfigAdapter::from_string("[strategy]\nma_type = wma\n").unwrap();
        assert!(MaCrossoverParams::from_config(&config).is_err());
    }
}
