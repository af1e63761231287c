//! Static per-symbol conversion facts.
//!
//! An [`InstrumentSpec`] converts price distances into pip-units and pip-units
//! into account currency. It is immutable for the length of a backtest run.

use super::sizing::SizingError;

pub const DEFAULT_POINT_SIZE: f64 = 0.00001;
pub const DEFAULT_CONTRACT_SIZE: f64 = 100_000.0;
pub const DEFAULT_VOLUME_MIN: f64 = 0.01;
pub const DEFAULT_VOLUME_MAX: f64 = 100.0;
pub const DEFAULT_VOLUME_STEP: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSpec {
    pub symbol: String,
    /// One pip-unit of price movement.
    pub point_size: f64,
    /// Units of the underlying per standard lot.
    pub contract_size: f64,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
}

impl InstrumentSpec {
    /// Five-decimal currency pair: 100,000 units per lot.
    pub fn forex(symbol: impl Into<String>) -> Self {
        InstrumentSpec {
            symbol: symbol.into(),
            point_size: DEFAULT_POINT_SIZE,
            contract_size: DEFAULT_CONTRACT_SIZE,
            volume_min: DEFAULT_VOLUME_MIN,
            volume_max: DEFAULT_VOLUME_MAX,
            volume_step: DEFAULT_VOLUME_STEP,
        }
    }

    /// Metal quoted in two decimals: 100 ounces per lot.
    pub fn metal(symbol: impl Into<String>) -> Self {
        InstrumentSpec {
            point_size: 0.01,
            contract_size: 100.0,
            ..Self::forex(symbol)
        }
    }

    /// Index CFD: whole-point quotes, one unit per lot.
    pub fn index(symbol: impl Into<String>) -> Self {
        InstrumentSpec {
            point_size: 1.0,
            contract_size: 1.0,
            ..Self::forex(symbol)
        }
    }

    /// Facts used when none were supplied for a symbol. Only exact for
    /// five-decimal currency pairs.
    pub fn conservative_default(symbol: impl Into<String>) -> Self {
        Self::forex(symbol)
    }

    pub fn validate(&self) -> Result<(), SizingError> {
        let checks = [
            ("point_size", self.point_size),
            ("contract_size", self.contract_size),
            ("volume_min", self.volume_min),
            ("volume_max", self.volume_max),
            ("volume_step", self.volume_step),
        ];
        for (name, value) in checks {
            if !value.is_finite() || value <= 0.0 {
                return Err(SizingError::InvalidInstrument {
                    reason: format!("{name} must be positive, got {value}"),
                });
            }
        }
        if self.volume_min > self.volume_max {
            return Err(SizingError::InvalidInstrument {
                reason: format!(
                    "volume_min ({}) exceeds volume_max ({})",
                    self.volume_min, self.volume_max
                ),
            });
        }
        Ok(())
    }

    /// Price distance expressed in pip-units.
    pub fn price_to_units(&self, price_distance: f64) -> f64 {
        price_distance / self.point_size
    }

    pub fn units_to_price(&self, units: f64) -> f64 {
        units * self.point_size
    }

    /// Account-currency value of one pip-unit per lot.
    pub fn value_per_unit_per_lot(&self) -> f64 {
        self.contract_size * self.point_size
    }

    /// Account-currency value of `units` pip-units across `lots`.
    pub fn monetary_value(&self, units: f64, lots: f64) -> f64 {
        units * self.value_per_unit_per_lot() * lots
    }

    /// Number of decimals implied by the point size.
    pub fn digits(&self) -> u32 {
        decimals(self.point_size)
    }

    /// Number of decimals implied by the volume step.
    pub fn volume_digits(&self) -> u32 {
        decimals(self.volume_step)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        let factor = 10f64.powi(self.digits() as i32);
        (price * factor).round() / factor
    }

    pub fn format_price(&self, price: f64) -> String {
        format!("{:.*}", self.digits() as usize, price)
    }

    pub fn format_volume(&self, lots: f64) -> String {
        format!("{:.*}", self.volume_digits() as usize, lots)
    }
}

fn decimals(value: f64) -> u32 {
    let mut digits = 0;
    let mut scaled = value;
    while digits < 10 && (scaled - scaled.round()).abs() > 1e-9 {
        scaled *= 10.0;
        digits += 1;
    }
    digits
}
