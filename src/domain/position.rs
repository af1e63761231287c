//! Open positions and closed trade records.

use chrono::NaiveDateTime;
use std::fmt;

use super::exit::ExitStage;
use super::ohlcv::OhlcvBar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub entry_time: NaiveDateTime,
    pub entry_bar: usize,
    /// Fill price including spread and slippage.
    pub entry_price: f64,
    /// Remaining lots.
    pub size: f64,
    pub initial_size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub max_favorable_price: f64,
    pub max_adverse_price: f64,
    pub stage: ExitStage,
    pub partial_taken: bool,
    /// Entry commission not yet realized, for the remaining lots.
    pub entry_commission: f64,
    pub entry_slippage: f64,
    pub entry_spread_cost: f64,
    pub bars_held: usize,
}

impl Position {
    /// Price P&L of the remaining lots, before costs.
    pub fn price_pnl(&self, price: f64, contract_size: f64) -> f64 {
        self.direction.sign() * (price - self.entry_price) * self.size * contract_size
    }

    /// Mark-to-market P&L including the accrued entry commission.
    pub fn unrealized_pnl(&self, price: f64, contract_size: f64) -> f64 {
        self.price_pnl(price, contract_size) - self.entry_commission
    }

    pub fn notional(&self, price: f64, contract_size: f64) -> f64 {
        price * self.size * contract_size
    }

    /// Widen the running extremes with this bar's range.
    pub fn update_extremes(&mut self, bar: &OhlcvBar) {
        match self.direction {
            Direction::Long => {
                self.max_favorable_price = self.max_favorable_price.max(bar.high);
                self.max_adverse_price = self.max_adverse_price.min(bar.low);
            }
            Direction::Short => {
                self.max_favorable_price = self.max_favorable_price.min(bar.low);
                self.max_adverse_price = self.max_adverse_price.max(bar.high);
            }
        }
    }

    /// Best price distance reached in the trade's favour (>= 0).
    pub fn favorable_excursion(&self) -> f64 {
        (self.direction.sign() * (self.max_favorable_price - self.entry_price)).max(0.0)
    }

    /// Worst price distance reached against the trade (>= 0).
    pub fn adverse_excursion(&self) -> f64 {
        (self.direction.sign() * (self.entry_price - self.max_adverse_price)).max(0.0)
    }

    /// True if `candidate` would tighten the stop in the trade's favour.
    pub fn improves_stop(&self, candidate: f64) -> bool {
        match (self.stop_loss, self.direction) {
            (None, _) => true,
            (Some(stop), Direction::Long) => candidate > stop,
            (Some(stop), Direction::Short) => candidate < stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Breakeven,
    PartialTakeProfit,
    TimeExit,
    StopOut,
    EndOfData,
}

impl ExitReason {
    /// Exits imposed by the engine rather than a strategy level.
    pub fn is_forced(self) -> bool {
        matches!(self, ExitReason::StopOut | ExitReason::EndOfData)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Breakeven => "breakeven",
            ExitReason::PartialTakeProfit => "partial_take_profit",
            ExitReason::TimeExit => "time_exit",
            ExitReason::StopOut => "stop_out",
            ExitReason::EndOfData => "end_of_data",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub position_id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub size: f64,
    pub entry_time: NaiveDateTime,
    pub exit_time: NaiveDateTime,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Net of entry and exit commission.
    pub pnl: f64,
    /// `pnl` over the entry notional.
    pub pnl_pct: f64,
    pub commission: f64,
    pub slippage: f64,
    pub spread_cost: f64,
    pub exit_reason: ExitReason,
    /// Worst unrealized price P&L in account currency (<= 0).
    pub mae: f64,
    /// Best unrealized price P&L in account currency (>= 0).
    pub mfe: f64,
    pub max_adverse_price: f64,
    pub max_favorable_price: f64,
    pub duration_bars: usize,
}

impl ClosedTrade {
    pub fn is_winner(&self) -> bool {
        self.pnl > 0.0
    }

    pub fn total_costs(&self) -> f64 {
        self.commission + self.slippage + self.spread_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn sample_long_position() -> Position {
        Position {
            id: 1,
            symbol: "XAUUSD".into(),
            direction: Direction::Long,
            entry_time: ts(10),
            entry_bar: 0,
            entry_price: 50.0,
            size: 2.0,
            initial_size: 2.0,
            stop_loss: Some(45.0),
            take_profit: Some(60.0),
            max_favorable_price: 50.0,
            max_adverse_price: 50.0,
            stage: ExitStage::Initial,
            partial_taken: false,
            entry_commission: 3.0,
            entry_slippage: 0.0,
            entry_spread_cost: 0.0,
            bars_held: 0,
        }
    }

    fn sample_short_position() -> Position {
        Position {
            direction: Direction::Short,
            entry_price: 100.0,
            stop_loss: Some(110.0),
            take_profit: Some(80.0),
            max_favorable_price: 100.0,
            max_adverse_price: 100.0,
            ..sample_long_position()
        }
    }

    fn bar(high: f64, low: f64) -> OhlcvBar {
        OhlcvBar {
            timestamp: ts(11),
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 0.0,
            spread: None,
        }
    }

    #[test]
    fn price_pnl_scales_with_contract_size() {
        let pos = sample_long_position();
        // 2 lots * 100 units * (55 - 50)
        assert!((pos.price_pnl(55.0, 100.0) - 1000.0).abs() < f64::EPSILON);
        assert!((pos.unrealized_pnl(55.0, 100.0) - 997.0).abs() < f64::EPSILON);
    }

    #[test]
    fn short_pnl_profits_on_decline() {
        let pos = sample_short_position();
        assert!((pos.price_pnl(90.0, 1.0) - 20.0).abs() < f64::EPSILON);
        assert!((pos.price_pnl(105.0, 1.0) + 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn extremes_track_long() {
        let mut pos = sample_long_position();
        pos.update_extremes(&bar(53.0, 48.0));
        pos.update_extremes(&bar(52.0, 49.0));
        assert!((pos.max_favorable_price - 53.0).abs() < f64::EPSILON);
        assert!((pos.max_adverse_price - 48.0).abs() < f64::EPSILON);
        assert!((pos.favorable_excursion() - 3.0).abs() < f64::EPSILON);
        assert!((pos.adverse_excursion() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn extremes_track_short() {
        let mut pos = sample_short_position();
        pos.update_extremes(&bar(104.0, 93.0));
        assert!((pos.max_favorable_price - 93.0).abs() < f64::EPSILON);
        assert!((pos.max_adverse_price - 104.0).abs() < f64::EPSILON);
        assert!((pos.favorable_excursion() - 7.0).abs() < f64::EPSILON);
        assert!((pos.adverse_excursion() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn improves_stop_is_directional() {
        let long = sample_long_position();
        assert!(long.improves_stop(46.0));
        assert!(!long.improves_stop(45.0));
        let short = sample_short_position();
        assert!(short.improves_stop(109.0));
        assert!(!short.improves_stop(111.0));
    }

    #[test]
    fn forced_exit_reasons() {
        assert!(ExitReason::EndOfData.is_forced());
        assert!(ExitReason::StopOut.is_forced());
        assert!(!ExitReason::StopLoss.is_forced());
        assert!(!ExitReason::TakeProfit.is_forced());
        assert_eq!(ExitReason::EndOfData.to_string(), "end_of_data");
    }
}
