//! Property tests for position sizing.

use approx::assert_relative_eq;
use proptest::prelude::*;
use tradesim::domain::instrument::InstrumentSpec;
use tradesim::domain::sizing::{compute_position_size, size_or_fallback};

fn spec(point_size: f64, contract_size: f64) -> InstrumentSpec {
    InstrumentSpec {
        symbol: "TEST".into(),
        point_size,
        contract_size,
        volume_min: 0.01,
        volume_max: 100.0,
        volume_step: 0.01,
    }
}

fn contract_size() -> impl Strategy<Value = f64> {
    prop_oneof![Just(1.0), Just(10.0), Just(100.0), Just(1_000.0), Just(100_000.0)]
}

fn point_size() -> impl Strategy<Value = f64> {
    prop_oneof![Just(0.00001), Just(0.001), Just(0.01), Just(0.1), Just(1.0)]
}

proptest! {
    #[test]
    fn raw_size_scales_inversely_with_contract_size(
        balance in 1_000.0f64..1_000_000.0,
        risk in 0.001f64..0.05,
        entry in 1.0f64..50_000.0,
        stop_frac in 0.001f64..0.1,
        point in point_size(),
        c1 in contract_size(),
        c2 in contract_size(),
    ) {
        let stop = entry * (1.0 - stop_frac);
        let a = compute_position_size(balance, risk, entry, stop, &spec(point, c1), 1.0).unwrap();
        let b = compute_position_size(balance, risk, entry, stop, &spec(point, c2), 1.0).unwrap();
        assert_relative_eq!(a.raw_lots * c1, b.raw_lots * c2, max_relative = 1e-9);
    }

    #[test]
    fn raw_size_ignores_point_size(
        balance in 1_000.0f64..100_000.0,
        risk in 0.001f64..0.05,
        entry in 1.0f64..5_000.0,
        stop_frac in 0.001f64..0.1,
        p1 in point_size(),
        p2 in point_size(),
        contract in contract_size(),
    ) {
        let stop = entry * (1.0 + stop_frac);
        let a = compute_position_size(balance, risk, entry, stop, &spec(p1, contract), 1.0).unwrap();
        let b = compute_position_size(balance, risk, entry, stop, &spec(p2, contract), 1.0).unwrap();
        assert_relative_eq!(a.raw_lots, b.raw_lots, max_relative = 1e-9);
    }

    #[test]
    fn realized_risk_within_one_step(
        balance in 1_000.0f64..1_000_000.0,
        risk in 0.001f64..0.05,
        entry in 1.0f64..50_000.0,
        stop_frac in 0.001f64..0.1,
        point in point_size(),
        contract in contract_size(),
    ) {
        let spec = spec(point, contract);
        let stop = entry * (1.0 - stop_frac);
        let outcome = compute_position_size(balance, risk, entry, stop, &spec, 1.0).unwrap();

        let loss_at_stop = outcome.lots * (entry - stop) * contract;
        assert_relative_eq!(outcome.actual_risk, loss_at_stop, max_relative = 1e-6);

        if outcome.clamped {
            prop_assert!(outcome.lots == spec.volume_min || outcome.lots == spec.volume_max);
        } else {
            let one_step = spec.volume_step * (entry - stop) * contract;
            let slack = one_step * 1e-6 + 1e-9;
            prop_assert!(
                (outcome.actual_risk - outcome.requested_risk).abs() <= one_step + slack,
                "actual {} requested {} step {}",
                outcome.actual_risk,
                outcome.requested_risk,
                one_step
            );
        }
    }

    #[test]
    fn lots_are_on_grid_and_in_bounds(
        balance in 100.0f64..10_000_000.0,
        risk in 0.0001f64..1.0,
        entry in 0.5f64..50_000.0,
        stop_frac in 0.0001f64..0.5,
        point in point_size(),
        contract in contract_size(),
    ) {
        let spec = spec(point, contract);
        let outcome = size_or_fallback(balance, risk, entry, entry * (1.0 - stop_frac), &spec, 0.1);
        prop_assert!(outcome.lots >= spec.volume_min && outcome.lots <= spec.volume_max);
        let steps = outcome.lots / spec.volume_step;
        prop_assert!((steps - steps.round()).abs() < 1e-6);
    }

    #[test]
    fn degenerate_stop_never_panics(
        balance in -1_000.0f64..1_000_000.0,
        entry in 0.0f64..50_000.0,
    ) {
        let spec = InstrumentSpec::forex("EURUSD");
        let outcome = size_or_fallback(balance, 0.02, entry, entry, &spec, 0.1);
        prop_assert!(outcome.is_fallback());
        prop_assert_eq!(outcome.lots, spec.volume_min);
    }
}

#[test]
fn scenario_currency_pair() {
    let outcome =
        compute_position_size(10_000.0, 0.02, 1.1000, 1.0980, &InstrumentSpec::forex("EURUSD"), 0.1)
            .unwrap();
    assert_relative_eq!(outcome.stop_distance_units, 200.0, max_relative = 1e-9);
    assert_relative_eq!(outcome.lots, 1.0);
}

#[test]
fn scenario_metal() {
    let outcome =
        compute_position_size(10_000.0, 0.02, 2650.0, 2616.0, &InstrumentSpec::metal("XAUUSD"), 0.1)
            .unwrap();
    assert_relative_eq!(outcome.stop_distance_units, 3400.0, max_relative = 1e-9);
    assert_relative_eq!(outcome.lots, 0.06);
}

#[test]
fn scenario_index() {
    let outcome =
        compute_position_size(10_000.0, 0.01, 44_000.0, 43_900.0, &InstrumentSpec::index("US30"), 0.1)
            .unwrap();
    assert_relative_eq!(outcome.lots, 1.0);
}
