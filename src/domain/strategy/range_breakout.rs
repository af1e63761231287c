//! Session range breakout.
//!
//! Bar timestamps are UTC. Each bar is mapped to New York local time; the
//! high/low of the bars inside the session window (inclusive) forms that
//! day's range. After the window closes, the first bar whose high crosses
//! above the range high (low crosses below the range low) is a buy (sell)
//! at the range boundary, with fixed pip stop and target.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime, TimeZone};
use chrono_tz::America::New_York;
use tracing::debug;

use super::{IndicatorFrame, ParamRange, Strategy, read_param, read_risk_settings};
use crate::domain::config_validation::flag;
use crate::domain::error::{StrategyError, TradesimError};
use crate::domain::exit::{BreakevenRule, ExitRules, PartialTakeProfit, TrailingRule};
use crate::domain::indicator::calculate_atr;
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::risk::{ATR_METADATA_KEY, RiskSettings};
use crate::domain::signal::{Signal, SignalType};
use crate::ports::config_port::ConfigPort;

pub const PARAM_RANGES: &[ParamRange] = &[
    ParamRange::new("range_start_hour", 0.0, 23.0, 1.0, 21.0),
    ParamRange::new("range_start_minute", 0.0, 59.0, 5.0, 50.0),
    ParamRange::new("range_end_hour", 0.0, 23.0, 1.0, 22.0),
    ParamRange::new("range_end_minute", 0.0, 59.0, 5.0, 15.0),
    ParamRange::new("stop_loss_pips", 20.0, 50.0, 2.0, 34.0),
    ParamRange::new("take_profit_pips", 50.0, 150.0, 5.0, 83.0),
    ParamRange::new("pip_value", 0.00001, 10.0, 0.00001, 0.10),
    ParamRange::new("min_range_pips", 3.0, 15.0, 1.0, 5.0),
    ParamRange::new("max_range_pips", 30.0, 60.0, 5.0, 40.0),
    ParamRange::new("max_trades_per_day", 1.0, 5.0, 1.0, 1.0),
    ParamRange::new("atr_period", 7.0, 21.0, 1.0, 14.0),
    ParamRange::new("min_atr_multiple", 1.0, 2.0, 0.1, 1.2),
    ParamRange::new("partial_tp_pips", 35.0, 65.0, 5.0, 50.0),
    ParamRange::new("partial_fraction", 0.25, 0.75, 0.25, 0.5),
    ParamRange::new("breakeven_activation_pips", 30.0, 60.0, 5.0, 40.0),
    ParamRange::new("breakeven_offset_pips", 0.0, 10.0, 1.0, 5.0),
    ParamRange::new("trailing_pips", 15.0, 35.0, 2.0, 25.0),
    ParamRange::new("trailing_activation_pips", 35.0, 65.0, 5.0, 45.0),
];

#[derive(Debug, Clone, PartialEq)]
pub struct RangeBreakoutParams {
    pub range_start: NaiveTime,
    pub range_end: NaiveTime,
    pub stop_loss_pips: f64,
    pub take_profit_pips: f64,
    /// Price change of one pip.
    pub pip_value: f64,
    pub min_range_pips: f64,
    pub max_trades_per_day: usize,
    /// Enables the max-range and ATR filters plus partial, breakeven and
    /// trailing exits.
    pub enhanced: bool,
    pub max_range_pips: f64,
    pub atr_period: usize,
    pub min_atr_multiple: f64,
    pub partial_tp_pips: f64,
    pub partial_fraction: f64,
    pub breakeven_activation_pips: f64,
    pub breakeven_offset_pips: f64,
    pub trailing_pips: f64,
    pub trailing_activation_pips: f64,
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl Default for RangeBreakoutParams {
    fn default() -> Self {
        RangeBreakoutParams {
            range_start: hm(21, 50),
            range_end: hm(22, 15),
            stop_loss_pips: 34.0,
            take_profit_pips: 83.0,
            pip_value: 0.10,
            min_range_pips: 5.0,
            max_trades_per_day: 1,
            enhanced: false,
            max_range_pips: 40.0,
            atr_period: 14,
            min_atr_multiple: 1.2,
            partial_tp_pips: 50.0,
            partial_fraction: 0.5,
            breakeven_activation_pips: 40.0,
            breakeven_offset_pips: 5.0,
            trailing_pips: 25.0,
            trailing_activation_pips: 45.0,
        }
    }
}

impl RangeBreakoutParams {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, TradesimError> {
        let p = |name: &str| read_param(config, PARAM_RANGES, name);
        let start = hm(p("range_start_hour")? as u32, p("range_start_minute")? as u32);
        let end = hm(p("range_end_hour")? as u32, p("range_end_minute")? as u32);
        if start >= end {
            return Err(TradesimError::invalid(
                "strategy",
                "range_end_hour",
                format!("range end {end} must be after range start {start}"),
            ));
        }
        let params = RangeBreakoutParams {
            range_start: start,
            range_end: end,
            stop_loss_pips: p("stop_loss_pips")?,
            take_profit_pips: p("take_profit_pips")?,
            pip_value: p("pip_value")?,
            min_range_pips: p("min_range_pips")?,
            max_trades_per_day: p("max_trades_per_day")? as usize,
            enhanced: flag(config, "strategy", "enhanced", false)?,
            max_range_pips: p("max_range_pips")?,
            atr_period: p("atr_period")? as usize,
            min_atr_multiple: p("min_atr_multiple")?,
            partial_tp_pips: p("partial_tp_pips")?,
            partial_fraction: p("partial_fraction")?,
            breakeven_activation_pips: p("breakeven_activation_pips")?,
            breakeven_offset_pips: p("breakeven_offset_pips")?,
            trailing_pips: p("trailing_pips")?,
            trailing_activation_pips: p("trailing_activation_pips")?,
        };
        Ok(params)
    }

    fn pips(&self, pips: f64) -> f64 {
        pips * self.pip_value
    }
}

#[derive(Debug, Clone)]
pub struct RangeBreakout {
    params: RangeBreakoutParams,
    risk: RiskSettings,
    trades_per_day: BTreeMap<NaiveDate, usize>,
}

impl RangeBreakout {
    pub fn new(params: RangeBreakoutParams, risk: RiskSettings) -> Self {
        RangeBreakout {
            params,
            risk,
            trades_per_day: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, TradesimError> {
        Ok(Self::new(
            RangeBreakoutParams::from_config(config)?,
            read_risk_settings(config, RiskSettings::default())?,
        ))
    }

    pub fn params(&self) -> &RangeBreakoutParams {
        &self.params
    }

    fn passes_filters(&self, range_pips: f64, atr: Option<f64>) -> bool {
        if range_pips < self.params.min_range_pips {
            return false;
        }
        if !self.params.enhanced {
            return true;
        }
        if range_pips > self.params.max_range_pips {
            return false;
        }
        match atr {
            Some(atr) => atr / self.params.pip_value >= range_pips * self.params.min_atr_multiple,
            None => false,
        }
    }
}

fn local(bar: &OhlcvBar) -> (NaiveDate, NaiveTime) {
    let ny = New_York.from_utc_datetime(&bar.timestamp);
    (ny.date_naive(), ny.time())
}

impl Strategy for RangeBreakout {
    fn name(&self) -> &str {
        "range_breakout"
    }

    /// Adds `range_high`/`range_low` (the session range built from bars up
    /// to and including the current one), `after_range` (1.0 once the
    /// window has closed on the current New York date) and `atr`.
    fn calculate_indicators(&mut self, bars: &[OhlcvBar]) -> Result<IndicatorFrame, StrategyError> {
        let mut frame = IndicatorFrame::new(bars);
        let mut range_high = Vec::with_capacity(bars.len());
        let mut range_low = Vec::with_capacity(bars.len());
        let mut after_range = Vec::with_capacity(bars.len());
        let mut session: Option<(NaiveDate, f64, f64)> = None;

        for bar in bars {
            let (date, time) = local(bar);
            if session.is_some_and(|(d, _, _)| d != date) {
                session = None;
            }
            if time >= self.params.range_start && time <= self.params.range_end {
                session = Some(match session {
                    Some((d, h, l)) => (d, h.max(bar.high), l.min(bar.low)),
                    None => (date, bar.high, bar.low),
                });
            }
            range_high.push(session.map(|(_, h, _)| h));
            range_low.push(session.map(|(_, _, l)| l));
            after_range.push(Some(if time > self.params.range_end { 1.0 } else { 0.0 }));
        }

        frame.insert("range_high", range_high)?;
        frame.insert("range_low", range_low)?;
        frame.insert("after_range", after_range)?;
        frame.insert("atr", calculate_atr(bars, self.params.atr_period).to_column())?;
        Ok(frame)
    }

    fn generate_signals(&mut self, frame: &IndicatorFrame) -> Result<Vec<Signal>, StrategyError> {
        self.trades_per_day.clear();
        let mut signals = Vec::new();

        for i in 1..frame.len() {
            if frame.value("after_range", i) != Some(1.0) {
                continue;
            }
            let (Some(high), Some(low)) = (frame.value("range_high", i), frame.value("range_low", i))
            else {
                continue;
            };
            let bar = &frame.bars[i];
            let prev = &frame.bars[i - 1];
            let (date, _) = local(bar);

            let taken = self.trades_per_day.get(&date).copied().unwrap_or(0);
            if taken >= self.params.max_trades_per_day {
                continue;
            }

            let (signal_type, entry, label) = if prev.high <= high && bar.high > high {
                (SignalType::Buy, high, "bullish")
            } else if prev.low >= low && bar.low < low {
                (SignalType::Sell, low, "bearish")
            } else {
                continue;
            };

            let range_pips = (high - low) / self.params.pip_value;
            let atr = frame.value("atr", i);
            if !self.passes_filters(range_pips, atr) {
                debug!(timestamp = %bar.timestamp, range_pips, "breakout filtered");
                continue;
            }

            let sign = signal_type.direction().sign();
            let mut signal = Signal::new(bar.timestamp, signal_type, entry)
                .with_stop_loss(entry - sign * self.params.pips(self.params.stop_loss_pips))
                .with_take_profit(entry + sign * self.params.pips(self.params.take_profit_pips))
                .with_number("range_high", high)
                .with_number("range_low", low)
                .with_number("range_pips", range_pips)
                .with_text("breakout_type", label);
            if let Some(atr) = atr {
                signal = signal.with_number(ATR_METADATA_KEY, atr);
            }
            signals.push(signal);
            *self.trades_per_day.entry(date).or_insert(0) += 1;
        }
        Ok(signals)
    }

    fn risk_settings(&self) -> &RiskSettings {
        &self.risk
    }

    fn exit_rules(&self) -> ExitRules {
        if !self.params.enhanced {
            return ExitRules::default();
        }
        let p = &self.params;
        ExitRules {
            breakeven: Some(BreakevenRule {
                activation: p.pips(p.breakeven_activation_pips),
                offset: p.pips(p.breakeven_offset_pips),
            }),
            trailing: Some(TrailingRule {
                distance: p.pips(p.trailing_pips),
                activation: p.pips(p.trailing_activation_pips),
            }),
            partial: Some(PartialTakeProfit {
                target_distance: p.pips(p.partial_tp_pips),
                fraction: p.partial_fraction,
            }),
            max_bars: None,
        }
    }

    fn reset(&mut self) {
        self.trades_per_day.clear();
    }

    fn parameter_ranges(&self) -> &'static [ParamRange] {
        PARAM_RANGES
    }
}
