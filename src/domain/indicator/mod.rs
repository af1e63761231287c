//! Technical indicator implementations.
//!
//! Every indicator is causal: the point at index `i` depends only on bars
//! `0..=i`. Points inside the warmup window are marked `valid: false`.

pub mod atr;
pub mod ema;
pub mod rsi;
pub mod sma;

use chrono::NaiveDateTime;
use std::fmt;

pub use atr::calculate_atr;
pub use ema::calculate_ema;
pub use rsi::calculate_rsi;
pub use sma::calculate_sma;

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorPoint {
    pub timestamp: NaiveDateTime,
    pub valid: bool,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorType {
    Sma(usize),
    Ema(usize),
    Rsi(usize),
    Atr(usize),
}

#[derive(Debug, Clone)]
pub struct IndicatorSeries {
    pub indicator_type: IndicatorType,
    pub values: Vec<IndicatorPoint>,
}

impl IndicatorSeries {
    /// Values with warmup points mapped to `None`.
    pub fn to_column(&self) -> Vec<Option<f64>> {
        self.values
            .iter()
            .map(|p| if p.valid { Some(p.value) } else { None })
            .collect()
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorType::Sma(period) => write!(f, "SMA({})", period),
            IndicatorType::Ema(period) => write!(f, "EMA({})", period),
            IndicatorType::Rsi(period) => write!(f, "RSI({})", period),
            IndicatorType::Atr(period) => write!(f, "ATR({})", period),
        }
    }
}

pub(crate) fn invalid_point(timestamp: NaiveDateTime) -> IndicatorPoint {
    IndicatorPoint {
        timestamp,
        valid: false,
        value: 0.0,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::domain::ohlcv::OhlcvBar;
    use chrono::{Duration, NaiveDate};

    pub fn make_bars(closes: &[f64]) -> Vec<OhlcvBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| make_hlc_bar(i, close, close, close))
            .collect()
    }

    pub fn make_hlc_bar(i: usize, high: f64, low: f64, close: f64) -> OhlcvBar {
        OhlcvBar {
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                + Duration::hours(i as i64),
            open: close,
            high,
            low,
            close,
            volume: 1000.0,
            spread: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::make_bars;
    use super::*;

    #[test]
    fn indicator_type_display() {
        assert_eq!(IndicatorType::Sma(20).to_string(), "SMA(20)");
        assert_eq!(IndicatorType::Ema(10).to_string(), "EMA(10)");
        assert_eq!(IndicatorType::Rsi(14).to_string(), "RSI(14)");
        assert_eq!(IndicatorType::Atr(14).to_string(), "ATR(14)");
    }

    #[test]
    fn to_column_hides_warmup() {
        let bars = make_bars(&[1.0, 2.0, 3.0]);
        let column = calculate_sma(&bars, 2).to_column();
        assert_eq!(column, vec![None, Some(1.5), Some(2.5)]);
    }

    #[test]
    fn indicators_are_causal() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + ((i * 7) % 11) as f64).collect();
        let full = make_bars(&closes);
        let cut = &full[..25];

        let pairs = [
            (calculate_sma(&full, 5), calculate_sma(cut, 5)),
            (calculate_ema(&full, 5), calculate_ema(cut, 5)),
            (calculate_rsi(&full, 14), calculate_rsi(cut, 14)),
            (calculate_atr(&full, 14), calculate_atr(cut, 14)),
        ];
        for (long, short) in pairs {
            assert_eq!(&long.values[..25], &short.values[..]);
        }
    }
}
