//! Trading intents emitted by strategies.

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fmt;

use super::position::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    Buy,
    Sell,
}

impl SignalType {
    pub fn direction(self) -> Direction {
        match self {
            SignalType::Buy => Direction::Long,
            SignalType::Sell => Direction::Short,
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalType::Buy => write!(f, "BUY"),
            SignalType::Sell => write!(f, "SELL"),
        }
    }
}

/// Auxiliary values a strategy attaches to a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Number(f64),
    Text(String),
    Flag(bool),
}

impl MetadataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Number(v) => write!(f, "{v}"),
            MetadataValue::Text(s) => write!(f, "{s}"),
            MetadataValue::Flag(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub timestamp: NaiveDateTime,
    pub signal_type: SignalType,
    /// Intended entry reference price.
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Lots, filled in by risk management.
    pub position_size: Option<f64>,
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl Signal {
    pub fn new(timestamp: NaiveDateTime, signal_type: SignalType, price: f64) -> Self {
        Signal {
            timestamp,
            signal_type,
            price,
            stop_loss: None,
            take_profit: None,
            position_size: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    pub fn with_number(mut self, key: &str, value: f64) -> Self {
        self.metadata
            .insert(key.to_string(), MetadataValue::Number(value));
        self
    }

    pub fn with_text(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata
            .insert(key.to_string(), MetadataValue::Text(value.into()));
        self
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(MetadataValue::as_f64)
    }

    pub fn direction(&self) -> Direction {
        self.signal_type.direction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 2)
            .unwrap()
            .and_hms_opt(22, 15, 0)
            .unwrap()
    }

    #[test]
    fn new_signal_has_no_risk_fields() {
        let s = Signal::new(ts(), SignalType::Buy, 1.1);
        assert!(s.stop_loss.is_none());
        assert!(s.take_profit.is_none());
        assert!(s.position_size.is_none());
        assert!(s.metadata.is_empty());
        assert_eq!(s.direction(), Direction::Long);
    }

    #[test]
    fn builder_sets_levels_and_metadata() {
        let s = Signal::new(ts(), SignalType::Sell, 1.1)
            .with_stop_loss(1.102)
            .with_take_profit(1.095)
            .with_number("atr", 0.0012)
            .with_text("reason", "range break");
        assert_eq!(s.stop_loss, Some(1.102));
        assert_eq!(s.take_profit, Some(1.095));
        assert_eq!(s.number("atr"), Some(0.0012));
        assert_eq!(s.number("reason"), None);
        assert_eq!(s.direction(), Direction::Short);
    }

    #[test]
    fn signal_type_display() {
        assert_eq!(SignalType::Buy.to_string(), "BUY");
        assert_eq!(SignalType::Sell.to_string(), "SELL");
    }
}
