//! Default stop, target and size assignment for signals.
//!
//! Strategies share these formulas through [`manage_risk_default`]:
//! the stop is `atr_stop_multiplier` ATRs from entry when the signal carries an
//! `atr` metadata value, otherwise `fixed_stop_pct` of entry; the target is
//! `risk_reward_ratio` stop distances from entry; the size comes from
//! [`size_or_fallback`].

use super::error::TradesimError;
use super::instrument::InstrumentSpec;
use super::signal::Signal;
use super::sizing::{DEFAULT_RISK_TOLERANCE, SizingOutcome, size_or_fallback};

/// Metadata key strategies use to pass the current ATR to risk management.
pub const ATR_METADATA_KEY: &str = "atr";

#[derive(Debug, Clone, PartialEq)]
pub struct RiskSettings {
    /// Fraction of balance risked per trade, in (0, 1].
    pub risk_fraction: f64,
    pub atr_stop_multiplier: f64,
    /// Fallback stop distance as a fraction of entry.
    pub fixed_stop_pct: f64,
    pub risk_reward_ratio: f64,
    pub risk_tolerance: f64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        RiskSettings {
            risk_fraction: 0.02,
            atr_stop_multiplier: 2.0,
            fixed_stop_pct: 0.02,
            risk_reward_ratio: 2.0,
            risk_tolerance: DEFAULT_RISK_TOLERANCE,
        }
    }
}

impl RiskSettings {
    pub fn validate(&self) -> Result<(), TradesimError> {
        if !(self.risk_fraction > 0.0 && self.risk_fraction <= 1.0) {
            return Err(TradesimError::invalid(
                "strategy",
                "risk_per_trade",
                format!("must be in (0, 1], got {}", self.risk_fraction),
            ));
        }
        if !(self.atr_stop_multiplier > 0.0) {
            return Err(TradesimError::invalid(
                "strategy",
                "atr_stop_multiplier",
                "must be positive",
            ));
        }
        if !(self.fixed_stop_pct > 0.0 && self.fixed_stop_pct < 1.0) {
            return Err(TradesimError::invalid(
                "strategy",
                "fixed_stop_pct",
                "must be in (0, 1)",
            ));
        }
        if !(self.risk_reward_ratio > 0.0) {
            return Err(TradesimError::invalid(
                "strategy",
                "risk_reward_ratio",
                "must be positive",
            ));
        }
        if !(self.risk_tolerance >= 0.0) {
            return Err(TradesimError::invalid(
                "backtest",
                "risk_tolerance",
                "must be non-negative",
            ));
        }
        Ok(())
    }
}

/// A signal after risk management, with the sizing diagnostic when the size
/// was computed rather than supplied by the strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedSignal {
    pub signal: Signal,
    pub sizing: Option<SizingOutcome>,
}

pub fn default_stop_loss(signal: &Signal, entry: f64, settings: &RiskSettings) -> f64 {
    let sign = signal.direction().sign();
    match signal.number(ATR_METADATA_KEY) {
        Some(atr) if atr > 0.0 => entry - sign * atr * settings.atr_stop_multiplier,
        _ => entry * (1.0 - sign * settings.fixed_stop_pct),
    }
}

pub fn default_take_profit(signal: &Signal, entry: f64, stop: f64, settings: &RiskSettings) -> f64 {
    let sign = signal.direction().sign();
    entry + sign * (entry - stop).abs() * settings.risk_reward_ratio
}

/// Fill any missing stop-loss, take-profit and position size on `signal`.
/// Values the strategy already set are left alone.
pub fn manage_risk_default(
    mut signal: Signal,
    current_price: f64,
    balance: f64,
    instrument: &InstrumentSpec,
    settings: &RiskSettings,
) -> ManagedSignal {
    let entry = if signal.price.is_finite() && signal.price > 0.0 {
        signal.price
    } else {
        current_price
    };

    let stop = match signal.stop_loss {
        Some(stop) => stop,
        None => {
            let stop = default_stop_loss(&signal, entry, settings);
            signal.stop_loss = Some(stop);
            stop
        }
    };

    if signal.take_profit.is_none() {
        signal.take_profit = Some(default_take_profit(&signal, entry, stop, settings));
    }

    if signal.position_size.is_some() {
        return ManagedSignal {
            signal,
            sizing: None,
        };
    }

    let outcome = size_or_fallback(
        balance,
        settings.risk_fraction,
        entry,
        stop,
        instrument,
        settings.risk_tolerance,
    );
    signal.position_size = Some(outcome.lots);
    ManagedSignal {
        signal,
        sizing: Some(outcome),
    }
}
