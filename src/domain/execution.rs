//! Fill simulation: spread, slippage, commission and margin.
//!
//! Bar prices are bid quotes. Buys (long entries, short exits) pay the spread
//! on top; every fill then slips against the trader by `slippage_pct`.
//! Commission is charged per side on the filled notional. Entry commission
//! accrues on the position and is realized with the exit.

use chrono::NaiveDateTime;
use tracing::debug;

use super::account::Account;
use super::exit::ExitStage;
use super::instrument::InstrumentSpec;
use super::ohlcv::OhlcvBar;
use super::position::{ClosedTrade, Direction, ExitReason, Position};
use super::signal::Signal;
use super::sizing::round_to_step;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Flat fee per side.
    pub commission_per_trade: f64,
    /// Percent of notional per side.
    pub commission_pct: f64,
    pub slippage_pct: f64,
    pub use_spread: bool,
    /// Spread in points for bars without one.
    pub default_spread_points: f64,
    pub leverage: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            commission_per_trade: 0.0,
            commission_pct: 0.0,
            slippage_pct: 0.0,
            use_spread: true,
            default_spread_points: 0.0,
            leverage: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn entry(direction: Direction) -> Self {
        match direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    pub fn exit(direction: Direction) -> Self {
        match direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

/// flat fee + notional * pct / 100
pub fn calculate_commission(notional: f64, config: &ExecutionConfig) -> f64 {
    config.commission_per_trade + (notional * config.commission_pct / 100.0)
}

/// Buys fill higher, sells lower.
pub fn apply_slippage(price: f64, side: OrderSide, slippage_pct: f64) -> f64 {
    match side {
        OrderSide::Buy => price * (1.0 + slippage_pct / 100.0),
        OrderSide::Sell => price * (1.0 - slippage_pct / 100.0),
    }
}

/// Spread for `bar` in price units, zero when spreads are disabled.
pub fn spread_price(bar: &OhlcvBar, instrument: &InstrumentSpec, config: &ExecutionConfig) -> f64 {
    if !config.use_spread {
        return 0.0;
    }
    let points = bar.spread.unwrap_or(config.default_spread_points).max(0.0);
    instrument.units_to_price(points)
}

pub fn required_margin(price: f64, lots: f64, instrument: &InstrumentSpec, leverage: f64) -> f64 {
    price * lots * instrument.contract_size / leverage
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub price: f64,
    pub commission: f64,
    /// Currency cost of slippage on this fill.
    pub slippage: f64,
    /// Currency cost of the spread on this fill.
    pub spread_cost: f64,
}

pub fn simulate_fill(
    side: OrderSide,
    market_price: f64,
    lots: f64,
    spread: f64,
    instrument: &InstrumentSpec,
    config: &ExecutionConfig,
) -> Fill {
    let paid_spread = match side {
        OrderSide::Buy => spread,
        OrderSide::Sell => 0.0,
    };
    let quoted = market_price + paid_spread;
    let price = apply_slippage(quoted, side, config.slippage_pct);
    let units = lots * instrument.contract_size;
    Fill {
        price,
        commission: calculate_commission(price * units, config),
        slippage: (price - quoted).abs() * units,
        spread_cost: paid_spread * units,
    }
}

/// Open a position for `signal` at its reference price, kept inside the
/// bar's range. `lots` comes from risk management.
pub fn open_position(
    account: &mut Account,
    signal: &Signal,
    lots: f64,
    bar: &OhlcvBar,
    bar_index: usize,
    instrument: &InstrumentSpec,
    config: &ExecutionConfig,
) -> Position {
    let direction = signal.direction();
    let reference = if signal.price.is_finite() && signal.price > 0.0 {
        signal.price.clamp(bar.low, bar.high)
    } else {
        bar.close
    };
    let fill = simulate_fill(
        OrderSide::entry(direction),
        reference,
        lots,
        spread_price(bar, instrument, config),
        instrument,
        config,
    );

    let position = Position {
        id: account.next_position_id(),
        symbol: instrument.symbol.clone(),
        direction,
        entry_time: bar.timestamp,
        entry_bar: bar_index,
        entry_price: fill.price,
        size: lots,
        initial_size: lots,
        stop_loss: signal.stop_loss,
        take_profit: signal.take_profit,
        max_favorable_price: fill.price,
        max_adverse_price: fill.price,
        stage: ExitStage::Initial,
        partial_taken: false,
        entry_commission: fill.commission,
        entry_slippage: fill.slippage,
        entry_spread_cost: fill.spread_cost,
        bars_held: 0,
    };
    account.add_position(position.clone());
    position
}

/// Trade record for closing all of `position` at `market_price`.
fn settle(
    position: &Position,
    market_price: f64,
    exit_time: NaiveDateTime,
    reason: ExitReason,
    spread: f64,
    instrument: &InstrumentSpec,
    config: &ExecutionConfig,
) -> ClosedTrade {
    let fill = simulate_fill(
        OrderSide::exit(position.direction),
        market_price,
        position.size,
        spread,
        instrument,
        config,
    );
    let contract = instrument.contract_size;
    let commission = position.entry_commission + fill.commission;
    let pnl = position.price_pnl(fill.price, contract) - commission;
    let entry_notional = position.entry_price * position.size * contract;
    let per_price = position.size * contract;

    ClosedTrade {
        position_id: position.id,
        symbol: position.symbol.clone(),
        direction: position.direction,
        size: position.size,
        entry_time: position.entry_time,
        exit_time,
        entry_price: position.entry_price,
        exit_price: fill.price,
        pnl,
        pnl_pct: if entry_notional > 0.0 {
            pnl / entry_notional
        } else {
            0.0
        },
        commission,
        slippage: position.entry_slippage + fill.slippage,
        spread_cost: position.entry_spread_cost + fill.spread_cost,
        exit_reason: reason,
        mae: -position.adverse_excursion() * per_price,
        mfe: position.favorable_excursion() * per_price,
        max_adverse_price: position.max_adverse_price,
        max_favorable_price: position.max_favorable_price,
        duration_bars: position.bars_held,
    }
}

/// Close the position at `index` in full and realize it into the balance.
pub fn close_position(
    account: &mut Account,
    index: usize,
    market_price: f64,
    bar: &OhlcvBar,
    reason: ExitReason,
    instrument: &InstrumentSpec,
    config: &ExecutionConfig,
) -> Option<ClosedTrade> {
    if index >= account.positions.len() {
        return None;
    }
    let position = account.positions.remove(index);
    let trade = settle(
        &position,
        market_price,
        bar.timestamp,
        reason,
        spread_price(bar, instrument, config),
        instrument,
        config,
    );
    account.record_trade(trade.clone());
    Some(trade)
}

/// Close `fraction` of the position at `index`, rounded to the volume step.
/// Returns `None` (and marks the partial as taken) when either the closed or
/// the remaining part would fall below the minimum volume.
pub fn partial_close(
    account: &mut Account,
    index: usize,
    fraction: f64,
    market_price: f64,
    bar: &OhlcvBar,
    instrument: &InstrumentSpec,
    config: &ExecutionConfig,
) -> Option<ClosedTrade> {
    let spread = spread_price(bar, instrument, config);
    let position = account.positions.get_mut(index)?;
    position.partial_taken = true;

    let closed_lots = round_to_step(position.size * fraction, instrument.volume_step);
    let remaining = position.size - closed_lots;
    if closed_lots < instrument.volume_min || remaining < instrument.volume_min {
        debug!(
            position_id = position.id,
            size = position.size,
            "partial close below minimum volume, skipped"
        );
        return None;
    }

    let share = closed_lots / position.size;
    let mut part = position.clone();
    part.size = closed_lots;
    part.entry_commission = position.entry_commission * share;
    part.entry_slippage = position.entry_slippage * share;
    part.entry_spread_cost = position.entry_spread_cost * share;

    position.size = remaining;
    position.entry_commission -= part.entry_commission;
    position.entry_slippage -= part.entry_slippage;
    position.entry_spread_cost -= part.entry_spread_cost;

    let trade = settle(
        &part,
        market_price,
        bar.timestamp,
        ExitReason::PartialTakeProfit,
        spread,
        instrument,
        config,
    );
    account.record_trade(trade.clone());
    Some(trade)
}
