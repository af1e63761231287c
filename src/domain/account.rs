//! Account state and equity tracking.
//!
//! `balance` changes only when a trade is recorded. `equity` is the balance
//! plus the unrealized P&L of every open position at the mark price.

use chrono::NaiveDateTime;

use super::position::{ClosedTrade, Position};

#[derive(Debug, Clone, PartialEq)]
pub struct EquityPoint {
    pub timestamp: NaiveDateTime,
    pub balance: f64,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub initial_capital: f64,
    pub balance: f64,
    pub positions: Vec<Position>,
    pub closed_trades: Vec<ClosedTrade>,
    pub equity_curve: Vec<EquityPoint>,
    next_id: u64,
}

impl Account {
    pub fn new(initial_capital: f64) -> Self {
        Account {
            initial_capital,
            balance: initial_capital,
            positions: Vec::new(),
            closed_trades: Vec::new(),
            equity_curve: Vec::new(),
            next_id: 1,
        }
    }

    pub fn next_position_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_position(&mut self, position: Position) {
        self.positions.push(position);
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn has_positions(&self) -> bool {
        !self.positions.is_empty()
    }

    /// Realize a closed trade into the balance.
    pub fn record_trade(&mut self, trade: ClosedTrade) {
        self.balance += trade.pnl;
        self.closed_trades.push(trade);
    }

    pub fn unrealized_pnl(&self, price: f64, contract_size: f64) -> f64 {
        self.positions
            .iter()
            .map(|p| p.unrealized_pnl(price, contract_size))
            .sum()
    }

    pub fn equity(&self, price: f64, contract_size: f64) -> f64 {
        self.balance + self.unrealized_pnl(price, contract_size)
    }

    pub fn used_margin(&self, price: f64, contract_size: f64, leverage: f64) -> f64 {
        self.positions
            .iter()
            .map(|p| p.notional(price, contract_size) / leverage)
            .sum()
    }

    /// Equity over used margin, or `None` with nothing open.
    pub fn margin_level(&self, price: f64, contract_size: f64, leverage: f64) -> Option<f64> {
        let used = self.used_margin(price, contract_size, leverage);
        if used > 0.0 {
            Some(self.equity(price, contract_size) / used)
        } else {
            None
        }
    }

    pub fn record_equity(&mut self, timestamp: NaiveDateTime, price: f64, contract_size: f64) {
        let equity = self.equity(price, contract_size);
        self.equity_curve.push(EquityPoint {
            timestamp,
            balance: self.balance,
            equity,
        });
    }
}
