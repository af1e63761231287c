//! Ensemble of predictors voting on direction.
//!
//! Each available [`Predictor`] votes a direction in `{-1, 0, 1}` with a
//! confidence. The ensemble direction is the median vote and the confidence is
//! the mean. A signal needs enough confidence, volatility (ATR / close) inside
//! the configured band, and a market regime that does not oppose it.

use std::fmt;

use tracing::debug;

use super::{IndicatorFrame, ParamRange, Strategy, read_param, read_risk_settings};
use crate::domain::error::{StrategyError, TradesimError};
use crate::domain::indicator::{calculate_atr, calculate_rsi, calculate_sma};
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::risk::{ATR_METADATA_KEY, RiskSettings};
use crate::domain::signal::{Signal, SignalType};
use crate::ports::config_port::ConfigPort;

pub const PARAM_RANGES: &[ParamRange] = &[
    ParamRange::new("prediction_threshold", 0.5, 0.9, 0.05, 0.55),
    ParamRange::new("min_volatility", 0.0001, 0.002, 0.0001, 0.0005),
    ParamRange::new("max_volatility", 0.02, 0.1, 0.01, 0.05),
    ParamRange::new("regime_window", 20.0, 100.0, 10.0, 50.0),
    ParamRange::new("trend_threshold", 0.005, 0.05, 0.005, 0.02),
    ParamRange::new("lookback_period", 20.0, 120.0, 10.0, 60.0),
    ParamRange::new("atr_period", 7.0, 21.0, 1.0, 14.0),
    ParamRange::new("atr_multiplier", 1.0, 4.0, 0.25, 2.0),
    ParamRange::new("reward_multiple", 1.0, 4.0, 0.5, 2.0),
    ParamRange::new("max_positions", 1.0, 5.0, 1.0, 3.0),
    ParamRange::new("momentum_lookback", 5.0, 30.0, 1.0, 10.0),
    ParamRange::new("trend_fast_period", 5.0, 20.0, 1.0, 10.0),
    ParamRange::new("trend_slow_period", 20.0, 60.0, 5.0, 30.0),
    ParamRange::new("rsi_period", 10.0, 20.0, 2.0, 14.0),
];

pub const DEFAULT_MEMBERS: &str = "momentum,trend,mean_reversion";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// -1 short, 0 neutral, 1 long.
    pub direction: i8,
    pub confidence: f64,
}

/// One ensemble member. Only [`predict`](Predictor::predict) results are
/// consumed, so any model backend can sit behind this trait.
pub trait Predictor: Send {
    fn name(&self) -> &str;

    /// Members whose backend is unavailable are skipped when voting.
    fn is_available(&self) -> bool {
        true
    }

    /// Vote for bar `index`, reading only `0..=index` of `frame`.
    fn predict(&self, frame: &IndicatorFrame, index: usize) -> Option<Prediction>;
}

/// Fraction of rising closes over the last `lookback` bars.
#[derive(Debug, Clone)]
pub struct MomentumVote {
    pub lookback: usize,
}

impl Predictor for MomentumVote {
    fn name(&self) -> &str {
        "momentum"
    }

    fn predict(&self, frame: &IndicatorFrame, index: usize) -> Option<Prediction> {
        if self.lookback == 0 || index < self.lookback {
            return None;
        }
        let bars = &frame.bars[index - self.lookback..=index];
        let ups = bars.windows(2).filter(|w| w[1].close > w[0].close).count();
        let p_up = ups as f64 / self.lookback as f64;
        let direction = if p_up > 0.5 {
            1
        } else if p_up < 0.5 {
            -1
        } else {
            0
        };
        Some(Prediction {
            direction,
            confidence: p_up.max(1.0 - p_up),
        })
    }
}

/// Fast versus slow moving average, scaled by ATR.
#[derive(Debug, Clone, Default)]
pub struct TrendVote;

impl Predictor for TrendVote {
    fn name(&self) -> &str {
        "trend"
    }

    fn predict(&self, frame: &IndicatorFrame, index: usize) -> Option<Prediction> {
        let fast = frame.value("trend_fast", index)?;
        let slow = frame.value("trend_slow", index)?;
        let atr = frame.value("atr", index).filter(|a| *a > 0.0)?;
        let gap = fast - slow;
        let direction = if gap > 0.0 {
            1
        } else if gap < 0.0 {
            -1
        } else {
            0
        };
        Some(Prediction {
            direction,
            confidence: 0.5 + (gap.abs() / atr * 0.5).min(0.5),
        })
    }
}

/// RSI extremes vote against the recent move.
#[derive(Debug, Clone)]
pub struct MeanReversionVote {
    pub oversold: f64,
    pub overbought: f64,
}

impl Default for MeanReversionVote {
    fn default() -> Self {
        MeanReversionVote {
            oversold: 30.0,
            overbought: 70.0,
        }
    }
}

impl Predictor for MeanReversionVote {
    fn name(&self) -> &str {
        "mean_reversion"
    }

    fn predict(&self, frame: &IndicatorFrame, index: usize) -> Option<Prediction> {
        let rsi = frame.value("rsi", index)?;
        let direction = if rsi < self.oversold {
            1
        } else if rsi > self.overbought {
            -1
        } else {
            0
        };
        Some(Prediction {
            direction,
            confidence: 0.5 + (rsi - 50.0).abs() / 100.0,
        })
    }
}

/// Median direction and mean confidence of `votes`.
pub fn aggregate(votes: &[Prediction]) -> Option<Prediction> {
    if votes.is_empty() {
        return None;
    }
    let mut directions: Vec<i16> = votes.iter().map(|p| p.direction as i16).collect();
    directions.sort_unstable();
    let n = directions.len();
    let median = if n % 2 == 1 {
        directions[n / 2]
    } else {
        (directions[n / 2 - 1] + directions[n / 2]) / 2
    };
    let confidence = votes.iter().map(|p| p.confidence).sum::<f64>() / n as f64;
    Some(Prediction {
        direction: median as i8,
        confidence,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    HighVolatility,
    Ranging,
    TrendingUp,
    TrendingDown,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::HighVolatility => "high_volatility",
            Regime::Ranging => "ranging",
            Regime::TrendingUp => "trending_up",
            Regime::TrendingDown => "trending_down",
        }
    }

    fn allows(self, signal_type: SignalType) -> bool {
        match self {
            Regime::HighVolatility => false,
            Regime::Ranging => true,
            Regime::TrendingUp => signal_type == SignalType::Buy,
            Regime::TrendingDown => signal_type == SignalType::Sell,
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleParams {
    pub prediction_threshold: f64,
    pub min_volatility: f64,
    pub max_volatility: f64,
    pub regime_window: usize,
    pub trend_threshold: f64,
    /// Bars of history required before the first vote.
    pub lookback_period: usize,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub reward_multiple: f64,
    pub max_positions: usize,
    pub momentum_lookback: usize,
    pub trend_fast_period: usize,
    pub trend_slow_period: usize,
    pub rsi_period: usize,
}

impl Default for EnsembleParams {
    fn default() -> Self {
        EnsembleParams {
            prediction_threshold: 0.55,
            min_volatility: 0.0005,
            max_volatility: 0.05,
            regime_window: 50,
            trend_threshold: 0.02,
            lookback_period: 60,
            atr_period: 14,
            atr_multiplier: 2.0,
            reward_multiple: 2.0,
            max_positions: 3,
            momentum_lookback: 10,
            trend_fast_period: 10,
            trend_slow_period: 30,
            rsi_period: 14,
        }
    }
}

impl EnsembleParams {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, TradesimError> {
        let p = |name: &str| read_param(config, PARAM_RANGES, name);
        let params = EnsembleParams {
            prediction_threshold: p("prediction_threshold")?,
            min_volatility: p("min_volatility")?,
            max_volatility: p("max_volatility")?,
            regime_window: p("regime_window")? as usize,
            trend_threshold: p("trend_threshold")?,
            lookback_period: p("lookback_period")? as usize,
            atr_period: p("atr_period")? as usize,
            atr_multiplier: p("atr_multiplier")?,
            reward_multiple: p("reward_multiple")?,
            max_positions: p("max_positions")? as usize,
            momentum_lookback: p("momentum_lookback")? as usize,
            trend_fast_period: p("trend_fast_period")? as usize,
            trend_slow_period: p("trend_slow_period")? as usize,
            rsi_period: p("rsi_period")? as usize,
        };
        Ok(params)
    }

    pub fn classify(&self, return_std: f64, trend: f64) -> Regime {
        if return_std > self.max_volatility {
            Regime::HighVolatility
        } else if trend.abs() < self.trend_threshold {
            Regime::Ranging
        } else if trend > 0.0 {
            Regime::TrendingUp
        } else {
            Regime::TrendingDown
        }
    }
}

/// Build the built-in members named in a comma-separated list.
pub fn members_from_names(
    names: &str,
    params: &EnsembleParams,
) -> Result<Vec<Box<dyn Predictor>>, TradesimError> {
    let mut members: Vec<Box<dyn Predictor>> = Vec::new();
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let member: Box<dyn Predictor> = match name.to_ascii_lowercase().as_str() {
            "momentum" => Box::new(MomentumVote {
                lookback: params.momentum_lookback,
            }),
            "trend" => Box::new(TrendVote),
            "mean_reversion" => Box::new(MeanReversionVote::default()),
            _ => {
                return Err(TradesimError::invalid(
                    "strategy",
                    "members",
                    format!("unknown ensemble member '{name}'"),
                ));
            }
        };
        members.push(member);
    }
    if members.is_empty() {
        return Err(TradesimError::invalid(
            "strategy",
            "members",
            "at least one member is required",
        ));
    }
    Ok(members)
}

/// Sample standard deviation of close-to-close returns over `window` returns
/// ending at each bar.
fn rolling_return_std(bars: &[OhlcvBar], window: usize) -> Vec<Option<f64>> {
    (0..bars.len())
        .map(|i| {
            if window < 2 || i < window {
                return None;
            }
            let returns: Vec<f64> = bars[i - window..=i]
                .windows(2)
                .map(|w| w[1].close / w[0].close - 1.0)
                .collect();
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / (returns.len() - 1) as f64;
            Some(var.sqrt())
        })
        .collect()
}

fn rolling_trend(bars: &[OhlcvBar], window: usize) -> Vec<Option<f64>> {
    (0..bars.len())
        .map(|i| {
            if i < window || window == 0 {
                None
            } else {
                Some(bars[i].close / bars[i - window].close - 1.0)
            }
        })
        .collect()
}

pub struct EnsembleStrategy {
    params: EnsembleParams,
    risk: RiskSettings,
    members: Vec<Box<dyn Predictor>>,
}

impl EnsembleStrategy {
    pub fn with_members(
        params: EnsembleParams,
        risk: RiskSettings,
        members: Vec<Box<dyn Predictor>>,
    ) -> Self {
        EnsembleStrategy {
            params,
            risk,
            members,
        }
    }

    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, TradesimError> {
        let params = EnsembleParams::from_config(config)?;
        let names = config
            .get_string("strategy", "members")
            .unwrap_or_else(|| DEFAULT_MEMBERS.to_string());
        let members = members_from_names(&names, &params)?;
        let defaults = RiskSettings {
            atr_stop_multiplier: params.atr_multiplier,
            risk_reward_ratio: params.reward_multiple,
            ..RiskSettings::default()
        };
        let risk = read_risk_settings(config, defaults)?;
        Ok(Self::with_members(params, risk, members))
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name()).collect()
    }

    fn vote(&self, frame: &IndicatorFrame, index: usize) -> Option<Prediction> {
        let votes: Vec<Prediction> = self
            .members
            .iter()
            .filter(|m| m.is_available())
            .filter_map(|m| m.predict(frame, index))
            .collect();
        aggregate(&votes)
    }
}

impl Strategy for EnsembleStrategy {
    fn name(&self) -> &str {
        "ensemble"
    }

    fn calculate_indicators(&mut self, bars: &[OhlcvBar]) -> Result<IndicatorFrame, StrategyError> {
        let p = &self.params;
        let atr = calculate_atr(bars, p.atr_period).to_column();
        let volatility = atr
            .iter()
            .zip(bars)
            .map(|(a, b)| a.map(|a| a / b.close))
            .collect();

        let mut frame = IndicatorFrame::new(bars);
        frame.insert("atr", atr)?;
        frame.insert("volatility", volatility)?;
        frame.insert("return_std", rolling_return_std(bars, p.regime_window))?;
        frame.insert("trend", rolling_trend(bars, p.regime_window))?;
        frame.insert("trend_fast", calculate_sma(bars, p.trend_fast_period).to_column())?;
        frame.insert("trend_slow", calculate_sma(bars, p.trend_slow_period).to_column())?;
        frame.insert("rsi", calculate_rsi(bars, p.rsi_period).to_column())?;
        Ok(frame)
    }

    fn generate_signals(&mut self, frame: &IndicatorFrame) -> Result<Vec<Signal>, StrategyError> {
        let p = &self.params;
        let mut signals = Vec::new();

        for i in p.lookback_period..frame.len() {
            let (Some(atr), Some(volatility), Some(return_std), Some(trend)) = (
                frame.value("atr", i),
                frame.value("volatility", i),
                frame.value("return_std", i),
                frame.value("trend", i),
            ) else {
                continue;
            };
            if volatility < p.min_volatility || volatility > p.max_volatility {
                continue;
            }
            let regime = p.classify(return_std, trend);
            let Some(vote) = self.vote(frame, i) else {
                continue;
            };
            if vote.confidence < p.prediction_threshold {
                continue;
            }
            let signal_type = match vote.direction {
                d if d > 0 => SignalType::Buy,
                d if d < 0 => SignalType::Sell,
                _ => continue,
            };
            if !regime.allows(signal_type) {
                debug!(index = i, %regime, %signal_type, "vote blocked by regime");
                continue;
            }

            let bar = &frame.bars[i];
            let sign = signal_type.direction().sign();
            let stop_distance = atr * p.atr_multiplier;
            signals.push(
                Signal::new(bar.timestamp, signal_type, bar.close)
                    .with_stop_loss(bar.close - sign * stop_distance)
                    .with_take_profit(bar.close + sign * stop_distance * p.reward_multiple)
                    .with_number("confidence", vote.confidence)
                    .with_number("direction", f64::from(vote.direction))
                    .with_text("regime", regime.as_str())
                    .with_number(ATR_METADATA_KEY, atr),
            );
        }
        Ok(signals)
    }

    fn risk_settings(&self) -> &RiskSettings {
        &self.risk
    }

    fn max_positions(&self) -> usize {
        self.params.max_positions
    }

    fn parameter_ranges(&self) -> &'static [ParamRange] {
        PARAM_RANGES
    }
}
