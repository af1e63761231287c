//! Performance metrics over a backtest result.
//!
//! Returns and ratios are computed per equity sample and annualized with the
//! caller's `periods_per_year` (252 for daily bars, 252 * 24 for hourly, ...).

use super::account::EquityPoint;
use super::backtest::BacktestResult;
use super::position::ClosedTrade;

#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub net_profit: f64,
    pub total_return: f64,
    pub annualized_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    /// Fraction of the running peak.
    pub max_drawdown: f64,
    /// Longest stretch of samples below a previous peak.
    pub max_drawdown_duration: usize,
    pub total_trades: usize,
    pub trades_won: usize,
    pub trades_lost: usize,
    pub trades_breakeven: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub avg_mae: f64,
    pub avg_mfe: f64,
    /// In bars.
    pub avg_trade_duration: f64,
    pub total_commission: f64,
    pub total_slippage: f64,
    pub total_spread_cost: f64,
    pub forced_exits: usize,
    pub recovery_factor: f64,
    pub calmar_ratio: f64,
}

impl Metrics {
    pub fn compute(result: &BacktestResult, risk_free_rate: f64, periods_per_year: f64) -> Self {
        let equity_curve = &result.equity_curve;
        let initial_capital = result.initial_capital;

        let final_equity = equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_capital);
        let net_profit = final_equity - initial_capital;

        let total_return = if initial_capital > 0.0 {
            net_profit / initial_capital
        } else {
            0.0
        };

        let years = equity_curve.len() as f64 / periods_per_year;
        let annualized_return = if years > 0.0 && total_return.is_finite() && total_return > -1.0 {
            (1.0 + total_return).powf(1.0 / years) - 1.0
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_duration) = compute_drawdown(equity_curve);

        let period_rf = risk_free_rate / periods_per_year;
        let (sharpe_ratio, sortino_ratio) =
            compute_risk_adjusted(equity_curve, period_rf, periods_per_year);

        let stats = TradeStats::from_trades(&result.trades);

        let recovery_factor = if max_drawdown > 0.0 {
            total_return / max_drawdown
        } else {
            0.0
        };
        let calmar_ratio = if max_drawdown > 0.0 {
            annualized_return / max_drawdown
        } else {
            0.0
        };

        Metrics {
            net_profit,
            total_return,
            annualized_return,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            max_drawdown_duration,
            total_trades: stats.total,
            trades_won: stats.won,
            trades_lost: stats.lost,
            trades_breakeven: stats.breakeven,
            win_rate: stats.win_rate(),
            profit_factor: stats.profit_factor(),
            expectancy: stats.expectancy(),
            avg_win: stats.avg(stats.gross_profit, stats.won),
            avg_loss: stats.avg(stats.gross_loss, stats.lost),
            largest_win: stats.largest_win,
            largest_loss: stats.largest_loss,
            max_consecutive_wins: stats.max_consecutive_wins,
            max_consecutive_losses: stats.max_consecutive_losses,
            avg_mae: stats.avg(stats.total_mae, stats.total),
            avg_mfe: stats.avg(stats.total_mfe, stats.total),
            avg_trade_duration: stats.avg(stats.total_duration as f64, stats.total),
            total_commission: stats.commission,
            total_slippage: stats.slippage,
            total_spread_cost: stats.spread_cost,
            forced_exits: stats.forced,
            recovery_factor,
            calmar_ratio,
        }
    }
}

#[derive(Debug, Default)]
struct TradeStats {
    total: usize,
    won: usize,
    lost: usize,
    breakeven: usize,
    gross_profit: f64,
    gross_loss: f64,
    largest_win: f64,
    largest_loss: f64,
    max_consecutive_wins: usize,
    max_consecutive_losses: usize,
    total_mae: f64,
    total_mfe: f64,
    total_duration: usize,
    commission: f64,
    slippage: f64,
    spread_cost: f64,
    forced: usize,
}

impl TradeStats {
    fn from_trades(trades: &[ClosedTrade]) -> Self {
        let mut s = TradeStats::default();
        let mut win_streak = 0usize;
        let mut loss_streak = 0usize;

        for trade in trades {
            let pnl = trade.pnl;
            s.total += 1;
            if pnl > 0.0 {
                s.won += 1;
                s.gross_profit += pnl;
                s.largest_win = s.largest_win.max(pnl);
                win_streak += 1;
                loss_streak = 0;
            } else if pnl < 0.0 {
                s.lost += 1;
                s.gross_loss += pnl.abs();
                s.largest_loss = s.largest_loss.max(pnl.abs());
                loss_streak += 1;
                win_streak = 0;
            } else {
                s.breakeven += 1;
                win_streak = 0;
                loss_streak = 0;
            }
            s.max_consecutive_wins = s.max_consecutive_wins.max(win_streak);
            s.max_consecutive_losses = s.max_consecutive_losses.max(loss_streak);

            s.total_mae += trade.mae;
            s.total_mfe += trade.mfe;
            s.total_duration += trade.duration_bars;
            s.commission += trade.commission;
            s.slippage += trade.slippage;
            s.spread_cost += trade.spread_cost;
            if trade.exit_reason.is_forced() {
                s.forced += 1;
            }
        }
        s
    }

    fn avg(&self, sum: f64, count: usize) -> f64 {
        if count > 0 { sum / count as f64 } else { 0.0 }
    }

    fn win_rate(&self) -> f64 {
        self.avg(self.won as f64, self.total)
    }

    fn profit_factor(&self) -> f64 {
        if self.gross_loss > 0.0 {
            self.gross_profit / self.gross_loss
        } else if self.gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    /// Mean P&L per trade.
    fn expectancy(&self) -> f64 {
        self.avg(self.gross_profit - self.gross_loss, self.total)
    }
}

fn compute_drawdown(equity_curve: &[EquityPoint]) -> (f64, usize) {
    if equity_curve.is_empty() {
        return (0.0, 0);
    }

    let mut peak = equity_curve[0].equity;
    let mut max_dd = 0.0_f64;
    let mut max_dd_duration = 0usize;
    let mut current_dd_duration = 0usize;

    for point in equity_curve {
        if point.equity >= peak {
            peak = point.equity;
            current_dd_duration = 0;
        } else if peak > 0.0 {
            let dd = (peak - point.equity) / peak;
            max_dd = max_dd.max(dd);
            current_dd_duration += 1;
            max_dd_duration = max_dd_duration.max(current_dd_duration);
        }
    }

    (max_dd, max_dd_duration)
}

fn compute_risk_adjusted(
    equity_curve: &[EquityPoint],
    period_rf: f64,
    periods_per_year: f64,
) -> (f64, f64) {
    if equity_curve.len() < 2 {
        return (0.0, 0.0);
    }

    let returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|w| {
            let prev = w[0].equity;
            if prev > 0.0 {
                (w[1].equity - prev) / prev
            } else {
                0.0
            }
        })
        .collect();

    let n = returns.len() as f64;
    let mean: f64 = returns.iter().sum::<f64>() / n;
    let variance: f64 = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    let excess_return = mean - period_rf;
    let scale = periods_per_year.sqrt();

    let sharpe = if stddev > 0.0 {
        (excess_return / stddev) * scale
    } else {
        0.0
    };

    let downside: f64 = returns
        .iter()
        .filter(|&&r| r < period_rf)
        .map(|&r| (r - period_rf).powi(2))
        .sum();
    let downside_stddev = (downside / n).sqrt();

    let sortino = if downside_stddev > 0.0 {
        (excess_return / downside_stddev) * scale
    } else {
        0.0
    };

    (sharpe, sortino)
}
