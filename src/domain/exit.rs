//! Per-position exit management.
//!
//! A position moves through [`ExitStage`]s one way only:
//! `Initial → BreakevenArmed → Trailing → Closed`. Stops are only ever moved
//! to a strictly more favorable level. Each bar yields one [`ExitDecision`],
//! chosen by priority `Close > PartialClose > MoveStop > Hold`.

use super::ohlcv::OhlcvBar;
use super::position::{Direction, ExitReason, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExitStage {
    Initial,
    BreakevenArmed,
    Trailing,
    Closed,
}

/// Which level is assumed hit first when a bar spans both stop and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntrabarPolicy {
    #[default]
    StopFirst,
    TargetFirst,
}

impl IntrabarPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop_first" => Some(IntrabarPolicy::StopFirst),
            "target_first" => Some(IntrabarPolicy::TargetFirst),
            _ => None,
        }
    }
}

/// Move the stop to entry ± `offset` once price has moved `activation` in
/// favour. Distances are in price units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakevenRule {
    pub activation: f64,
    pub offset: f64,
}

/// Trail the stop `distance` behind the best price once price has moved
/// `activation` in favour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingRule {
    pub distance: f64,
    pub activation: f64,
}

/// Close `fraction` of the position once, `target_distance` from entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialTakeProfit {
    pub target_distance: f64,
    pub fraction: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitRules {
    pub breakeven: Option<BreakevenRule>,
    pub trailing: Option<TrailingRule>,
    pub partial: Option<PartialTakeProfit>,
    /// Close at the bar's close once the position has been held this long.
    pub max_bars: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitDecision {
    Hold,
    Close { price: f64, reason: ExitReason },
    PartialClose { fraction: f64, price: f64 },
    MoveStop { new_stop: f64, stage: ExitStage },
}

fn stop_reason(stage: ExitStage) -> ExitReason {
    match stage {
        ExitStage::BreakevenArmed => ExitReason::Breakeven,
        ExitStage::Trailing => ExitReason::TrailingStop,
        ExitStage::Initial | ExitStage::Closed => ExitReason::StopLoss,
    }
}

/// Fill price for a level touched by `bar`, or `None` if untouched. A bar
/// that opens beyond the level fills at the open.
fn stop_fill(direction: Direction, stop: f64, bar: &OhlcvBar) -> Option<f64> {
    match direction {
        Direction::Long if bar.open <= stop => Some(bar.open),
        Direction::Long if bar.low <= stop => Some(stop),
        Direction::Short if bar.open >= stop => Some(bar.open),
        Direction::Short if bar.high >= stop => Some(stop),
        _ => None,
    }
}

fn target_fill(direction: Direction, target: f64, bar: &OhlcvBar) -> Option<f64> {
    match direction {
        Direction::Long if bar.open >= target => Some(bar.open),
        Direction::Long if bar.high >= target => Some(target),
        Direction::Short if bar.open <= target => Some(bar.open),
        Direction::Short if bar.low <= target => Some(target),
        _ => None,
    }
}

fn gapped_through(direction: Direction, level: f64, open: f64) -> bool {
    match direction {
        Direction::Long => open <= level,
        Direction::Short => open >= level,
    }
}

/// Evaluate stop, target, partial, breakeven, trailing and time rules for
/// `position` against `bar`. Running extremes on the position are expected to
/// already include `bar`.
pub fn evaluate_exit(
    position: &Position,
    bar: &OhlcvBar,
    rules: &ExitRules,
    policy: IntrabarPolicy,
) -> ExitDecision {
    let direction = position.direction;
    let stop = position
        .stop_loss
        .and_then(|s| stop_fill(direction, s, bar).map(|p| (p, s)));
    let target = position
        .take_profit
        .and_then(|t| target_fill(direction, t, bar));

    let stop_close = |price: f64| ExitDecision::Close {
        price,
        reason: stop_reason(position.stage),
    };
    let target_close = |price: f64| ExitDecision::Close {
        price,
        reason: ExitReason::TakeProfit,
    };

    match (stop, target) {
        (Some((stop_price, _)), None) => return stop_close(stop_price),
        (None, Some(target_price)) => return target_close(target_price),
        (Some((stop_price, stop_level)), Some(target_price)) => {
            // An opening gap decides the order; otherwise fall back to policy.
            if gapped_through(direction, stop_level, bar.open) {
                return stop_close(stop_price);
            }
            if (target_price - bar.open).abs() < f64::EPSILON {
                return target_close(target_price);
            }
            return match policy {
                IntrabarPolicy::StopFirst => stop_close(stop_price),
                IntrabarPolicy::TargetFirst => target_close(target_price),
            };
        }
        (None, None) => {}
    }

    if let Some(max_bars) = rules.max_bars
        && position.bars_held >= max_bars
    {
        return ExitDecision::Close {
            price: bar.close,
            reason: ExitReason::TimeExit,
        };
    }

    if let Some(partial) = rules.partial
        && !position.partial_taken
    {
        let level = position.entry_price + direction.sign() * partial.target_distance;
        if let Some(price) = target_fill(direction, level, bar) {
            return ExitDecision::PartialClose {
                fraction: partial.fraction,
                price,
            };
        }
    }

    let excursion = position.favorable_excursion();
    let mut best: Option<(f64, ExitStage)> = None;

    if let Some(be) = rules.breakeven
        && position.stage == ExitStage::Initial
        && excursion >= be.activation
    {
        let candidate = position.entry_price + direction.sign() * be.offset;
        if position.improves_stop(candidate) {
            best = Some((candidate, ExitStage::BreakevenArmed));
        }
    }

    if let Some(trail) = rules.trailing
        && excursion >= trail.activation
    {
        let candidate = position.max_favorable_price - direction.sign() * trail.distance;
        let beats_best = match best {
            None => true,
            Some((b, _)) => direction.sign() * (candidate - b) > 0.0,
        };
        if position.improves_stop(candidate) && beats_best {
            best = Some((candidate, ExitStage::Trailing));
        }
    }

    match best {
        Some((new_stop, stage)) => ExitDecision::MoveStop {
            new_stop,
            stage: stage.max(position.stage),
        },
        None => ExitDecision::Hold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 2, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> OhlcvBar {
        OhlcvBar {
            timestamp: ts(),
            open,
            high,
            low,
            close,
            volume: 0.0,
            spread: None,
        }
    }

    fn long(stop: f64, target: f64) -> Position {
        Position {
            id: 1,
            symbol: "TEST".into(),
            direction: Direction::Long,
            entry_time: ts(),
            entry_bar: 0,
            entry_price: 100.0,
            size: 1.0,
            initial_size: 1.0,
            stop_loss: Some(stop),
            take_profit: Some(target),
            max_favorable_price: 100.0,
            max_adverse_price: 100.0,
            stage: ExitStage::Initial,
            partial_taken: false,
            entry_commission: 0.0,
            entry_slippage: 0.0,
            entry_spread_cost: 0.0,
            bars_held: 1,
        }
    }

    fn short(stop: f64, target: f64) -> Position {
        Position {
            direction: Direction::Short,
            ..long(stop, target)
        }
    }

    fn with_bar(mut pos: Position, b: &OhlcvBar) -> Position {
        pos.update_extremes(b);
        pos
    }

    #[test]
    fn hold_inside_levels() {
        let b = bar(100.0, 101.0, 99.0, 100.5);
        let pos = with_bar(long(95.0, 110.0), &b);
        assert_eq!(
            evaluate_exit(&pos, &b, &ExitRules::default(), IntrabarPolicy::StopFirst),
            ExitDecision::Hold
        );
    }

    #[test]
    fn long_stop_fills_at_level() {
        let b = bar(99.0, 99.5, 94.0, 96.0);
        let pos = with_bar(long(95.0, 110.0), &b);
        assert_eq!(
            evaluate_exit(&pos, &b, &ExitRules::default(), IntrabarPolicy::StopFirst),
            ExitDecision::Close {
                price: 95.0,
                reason: ExitReason::StopLoss
            }
        );
    }

    #[test]
    fn long_stop_gap_fills_at_open() {
        let b = bar(93.0, 94.0, 90.0, 91.0);
        let pos = with_bar(long(95.0, 110.0), &b);
        assert_eq!(
            evaluate_exit(&pos, &b, &ExitRules::default(), IntrabarPolicy::StopFirst),
            ExitDecision::Close {
                price: 93.0,
                reason: ExitReason::StopLoss
            }
        );
    }

    #[test]
    fn short_target_fills_at_level() {
        let b = bar(95.0, 96.0, 89.0, 90.0);
        let pos = with_bar(short(105.0, 90.0), &b);
        assert_eq!(
            evaluate_exit(&pos, &b, &ExitRules::default(), IntrabarPolicy::StopFirst),
            ExitDecision::Close {
                price: 90.0,
                reason: ExitReason::TakeProfit
            }
        );
    }

    #[test]
    fn both_levels_in_range_follows_policy() {
        let b = bar(100.0, 111.0, 94.0, 100.0);
        let pos = with_bar(long(95.0, 110.0), &b);
        let rules = ExitRules::default();
        assert_eq!(
            evaluate_exit(&pos, &b, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::Close {
                price: 95.0,
                reason: ExitReason::StopLoss
            }
        );
        assert_eq!(
            evaluate_exit(&pos, &b, &rules, IntrabarPolicy::TargetFirst),
            ExitDecision::Close {
                price: 110.0,
                reason: ExitReason::TakeProfit
            }
        );
    }

    #[test]
    fn gap_through_target_overrides_policy() {
        let b = bar(112.0, 113.0, 94.0, 100.0);
        let pos = with_bar(long(95.0, 110.0), &b);
        assert_eq!(
            evaluate_exit(&pos, &b, &ExitRules::default(), IntrabarPolicy::StopFirst),
            ExitDecision::Close {
                price: 112.0,
                reason: ExitReason::TakeProfit
            }
        );
    }

    #[test]
    fn stop_reason_follows_stage() {
        let b = bar(99.0, 99.5, 94.0, 96.0);
        let mut pos = with_bar(long(100.5, 110.0), &b);
        pos.stage = ExitStage::BreakevenArmed;
        assert!(matches!(
            evaluate_exit(&pos, &b, &ExitRules::default(), IntrabarPolicy::StopFirst),
            ExitDecision::Close {
                reason: ExitReason::Breakeven,
                ..
            }
        ));
        pos.stage = ExitStage::Trailing;
        assert!(matches!(
            evaluate_exit(&pos, &b, &ExitRules::default(), IntrabarPolicy::StopFirst),
            ExitDecision::Close {
                reason: ExitReason::TrailingStop,
                ..
            }
        ));
    }

    #[test]
    fn time_exit_at_close() {
        let b = bar(100.0, 101.0, 99.0, 100.7);
        let mut pos = with_bar(long(95.0, 110.0), &b);
        pos.bars_held = 5;
        let rules = ExitRules {
            max_bars: Some(5),
            ..Default::default()
        };
        assert_eq!(
            evaluate_exit(&pos, &b, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::Close {
                price: 100.7,
                reason: ExitReason::TimeExit
            }
        );
    }

    #[test]
    fn partial_fires_once() {
        let rules = ExitRules {
            partial: Some(PartialTakeProfit {
                target_distance: 5.0,
                fraction: 0.5,
            }),
            ..Default::default()
        };
        let b = bar(101.0, 106.0, 100.5, 104.0);
        let mut pos = with_bar(long(95.0, 110.0), &b);
        assert_eq!(
            evaluate_exit(&pos, &b, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::PartialClose {
                fraction: 0.5,
                price: 105.0
            }
        );
        pos.partial_taken = true;
        assert_eq!(
            evaluate_exit(&pos, &b, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::Hold
        );
    }

    #[test]
    fn breakeven_arms_after_activation() {
        let rules = ExitRules {
            breakeven: Some(BreakevenRule {
                activation: 4.0,
                offset: 0.5,
            }),
            ..Default::default()
        };
        let b = bar(101.0, 104.0, 100.5, 103.0);
        let pos = with_bar(long(95.0, 110.0), &b);
        assert_eq!(
            evaluate_exit(&pos, &b, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::MoveStop {
                new_stop: 100.5,
                stage: ExitStage::BreakevenArmed
            }
        );

        let early = bar(101.0, 103.0, 100.5, 102.0);
        let pos = with_bar(long(95.0, 110.0), &early);
        assert_eq!(
            evaluate_exit(&pos, &early, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::Hold
        );
    }

    #[test]
    fn breakeven_does_not_rearm() {
        let rules = ExitRules {
            breakeven: Some(BreakevenRule {
                activation: 4.0,
                offset: 0.5,
            }),
            ..Default::default()
        };
        let b = bar(101.0, 104.0, 100.6, 103.0);
        let mut pos = with_bar(long(100.5, 110.0), &b);
        pos.stage = ExitStage::BreakevenArmed;
        assert_eq!(
            evaluate_exit(&pos, &b, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::Hold
        );
    }

    #[test]
    fn trailing_only_tightens() {
        let rules = ExitRules {
            trailing: Some(TrailingRule {
                distance: 2.0,
                activation: 3.0,
            }),
            ..Default::default()
        };
        let b = bar(103.0, 106.0, 102.5, 105.0);
        let mut pos = with_bar(long(95.0, 120.0), &b);
        assert_eq!(
            evaluate_exit(&pos, &b, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::MoveStop {
                new_stop: 104.0,
                stage: ExitStage::Trailing
            }
        );

        pos.stop_loss = Some(104.0);
        pos.stage = ExitStage::Trailing;
        let pullback = bar(105.0, 105.5, 104.5, 105.0);
        let pos = with_bar(pos, &pullback);
        assert_eq!(
            evaluate_exit(&pos, &pullback, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::Hold
        );
    }

    #[test]
    fn trailing_short_moves_down() {
        let rules = ExitRules {
            trailing: Some(TrailingRule {
                distance: 2.0,
                activation: 3.0,
            }),
            ..Default::default()
        };
        let b = bar(97.0, 97.5, 94.0, 95.0);
        let pos = with_bar(short(105.0, 80.0), &b);
        assert_eq!(
            evaluate_exit(&pos, &b, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::MoveStop {
                new_stop: 96.0,
                stage: ExitStage::Trailing
            }
        );
    }

    #[test]
    fn trailing_beats_breakeven_when_tighter() {
        let rules = ExitRules {
            breakeven: Some(BreakevenRule {
                activation: 2.0,
                offset: 0.0,
            }),
            trailing: Some(TrailingRule {
                distance: 1.0,
                activation: 3.0,
            }),
            ..Default::default()
        };
        let b = bar(101.0, 105.0, 100.5, 104.0);
        let pos = with_bar(long(95.0, 120.0), &b);
        assert_eq!(
            evaluate_exit(&pos, &b, &rules, IntrabarPolicy::StopFirst),
            ExitDecision::MoveStop {
                new_stop: 104.0,
                stage: ExitStage::Trailing
            }
        );
    }

    #[test]
    fn parse_policy() {
        assert_eq!(IntrabarPolicy::parse("stop_first"), Some(IntrabarPolicy::StopFirst));
        assert_eq!(
            IntrabarPolicy::parse("TARGET_FIRST"),
            Some(IntrabarPolicy::TargetFirst)
        );
        assert_eq!(IntrabarPolicy::parse("random"), None);
        assert_eq!(IntrabarPolicy::default(), IntrabarPolicy::StopFirst);
    }
}
