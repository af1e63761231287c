//! Risk-based position sizing.
//!
//! Converts a risk budget, a stop distance and [`InstrumentSpec`] facts into a
//! broker-valid lot size:
//!
//! ```text
//! risk_amount     = balance * risk_fraction
//! stop_units      = |entry - stop| / point_size
//! raw_lots        = risk_amount / (stop_units * contract_size * point_size)
//!                 = risk_amount / (|entry - stop| * contract_size)
//! lots            = clamp(round_to_step(raw_lots), volume_min, volume_max)
//! ```
//!
//! Quantization rounds to the nearest `volume_step` (half away from zero) and
//! then clamps. Degenerate inputs produce a [`SizingError`]; callers that must
//! not fail use [`size_or_fallback`], which sizes at `volume_min` and logs a
//! warning instead.

use tracing::warn;

use super::instrument::{DEFAULT_VOLUME_MIN, InstrumentSpec};

/// Default allowed deviation between requested and actual risk.
pub const DEFAULT_RISK_TOLERANCE: f64 = 0.10;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SizingError {
    #[error("stop-loss {stop} gives no distance from entry {entry}")]
    InvalidStop { entry: f64, stop: f64 },

    #[error("invalid instrument facts: {reason}")]
    InvalidInstrument { reason: String },

    #[error("invalid risk budget: {reason}")]
    InvalidRiskBudget { reason: String },
}

/// Diagnostic record for one sizing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingOutcome {
    /// Final broker-valid lot size.
    pub lots: f64,
    /// Lot size before quantization and clamping.
    pub raw_lots: f64,
    pub requested_risk: f64,
    /// Loss implied by `lots` if the stop is hit exactly.
    pub actual_risk: f64,
    pub stop_distance_units: f64,
    /// True when `volume_min` or `volume_max` bound the result.
    pub clamped: bool,
    pub within_tolerance: bool,
    /// Set when sizing degenerated and `volume_min` was used instead.
    pub fallback_reason: Option<String>,
}

impl SizingOutcome {
    /// Relative deviation of actual from requested risk.
    pub fn risk_deviation(&self) -> f64 {
        if self.requested_risk > 0.0 {
            (self.actual_risk - self.requested_risk).abs() / self.requested_risk
        } else {
            0.0
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

/// Round `raw_lots` to the nearest `volume_step`, trimmed to 8 decimals.
pub fn round_to_step(raw_lots: f64, volume_step: f64) -> f64 {
    let stepped = (raw_lots / volume_step).round() * volume_step;
    (stepped * 1e8).round() / 1e8
}

/// Quantize to the step grid, then clamp into the broker's volume bounds.
/// Returns the lot size and whether clamping changed it.
pub fn quantize_lots(raw_lots: f64, spec: &InstrumentSpec) -> (f64, bool) {
    let stepped = round_to_step(raw_lots, spec.volume_step);
    let clamped = stepped.clamp(spec.volume_min, spec.volume_max);
    (clamped, (clamped - stepped).abs() > 1e-12)
}

pub fn compute_position_size(
    balance: f64,
    risk_fraction: f64,
    entry_price: f64,
    stop_loss_price: f64,
    spec: &InstrumentSpec,
    tolerance: f64,
) -> Result<SizingOutcome, SizingError> {
    spec.validate()?;

    if !balance.is_finite() || balance <= 0.0 {
        return Err(SizingError::InvalidRiskBudget {
            reason: format!("account balance must be positive, got {balance}"),
        });
    }
    if !(risk_fraction > 0.0 && risk_fraction <= 1.0) {
        return Err(SizingError::InvalidRiskBudget {
            reason: format!("risk fraction must be in (0, 1], got {risk_fraction}"),
        });
    }

    let risk_amount = balance * risk_fraction;

    let stop_distance_price = (entry_price - stop_loss_price).abs();
    if !stop_distance_price.is_finite() || stop_distance_price <= 0.0 {
        return Err(SizingError::InvalidStop {
            entry: entry_price,
            stop: stop_loss_price,
        });
    }

    let stop_distance_units = spec.price_to_units(stop_distance_price);
    let raw_lots = risk_amount / (stop_distance_units * spec.value_per_unit_per_lot());

    let (lots, clamped) = quantize_lots(raw_lots, spec);
    let actual_risk = spec.monetary_value(stop_distance_units, lots);

    let mut outcome = SizingOutcome {
        lots,
        raw_lots,
        requested_risk: risk_amount,
        actual_risk,
        stop_distance_units,
        clamped,
        within_tolerance: true,
        fallback_reason: None,
    };
    outcome.within_tolerance = outcome.risk_deviation() <= tolerance;

    if !outcome.within_tolerance {
        warn!(
            symbol = %spec.symbol,
            requested_risk = risk_amount,
            actual_risk,
            lots,
            raw_lots,
            clamped,
            "position size deviates from requested risk by {:.1}%",
            outcome.risk_deviation() * 100.0
        );
    }

    Ok(outcome)
}

/// Size a position, falling back to `volume_min` on any degenerate input.
/// Never fails.
pub fn size_or_fallback(
    balance: f64,
    risk_fraction: f64,
    entry_price: f64,
    stop_loss_price: f64,
    spec: &InstrumentSpec,
    tolerance: f64,
) -> SizingOutcome {
    match compute_position_size(
        balance,
        risk_fraction,
        entry_price,
        stop_loss_price,
        spec,
        tolerance,
    ) {
        Ok(outcome) => outcome,
        Err(err) => {
            let lots = if spec.volume_min.is_finite() && spec.volume_min > 0.0 {
                spec.volume_min
            } else {
                DEFAULT_VOLUME_MIN
            };
            warn!(
                symbol = %spec.symbol,
                entry_price,
                stop_loss_price,
                fallback_lots = lots,
                "position sizing failed, using volume_min: {err}"
            );
            let requested_risk = if balance.is_finite() && risk_fraction.is_finite() {
                (balance * risk_fraction).max(0.0)
            } else {
                0.0
            };
            let stop_distance_units = match err {
                SizingError::InvalidStop { .. } => 0.0,
                _ if spec.point_size > 0.0 => {
                    spec.price_to_units((entry_price - stop_loss_price).abs())
                }
                _ => 0.0,
            };
            let actual_risk = if spec.point_size > 0.0 && spec.contract_size > 0.0 {
                spec.monetary_value(stop_distance_units, lots)
            } else {
                0.0
            };
            SizingOutcome {
                lots,
                raw_lots: 0.0,
                requested_risk,
                actual_risk,
                stop_distance_units,
                clamped: false,
                within_tolerance: false,
                fallback_reason: Some(err.to_string()),
            }
        }
    }
}
