use rust_decimal_macros::dec;
use tick_rollup::aggregate::{aggregate, aggregate_all};
use tick_rollup::model::tick::{Side, Tick, MINUTE_MS};

// 2024-01-01T10:00:00Z
const T0: i64 = 1_704_103_200_000;

fn scenario_ticks() -> Vec<Tick> {
    vec![
        Tick::new("BTC", T0 + 5_000, dec!(50000), dec!(0.1), Some(Side::Buy), None),
        Tick::new("BTC", T0 + 30_000, dec!(50010), dec!(0.2), Some(Side::Buy), None),
        Tick::new("BTC", T0 + 59_000, dec!(50005), dec!(0.05), Some(Side::Sell), None),
    ]
}

#[test]
fn example_minute_bar() {
    let bar = aggregate("BTC", T0 / MINUTE_MS, &scenario_ticks(), "binance").unwrap();
    assert_eq!(bar.window_start_ms, T0);
    assert_eq!(bar.window_end_ms(), T0 + MINUTE_MS);
    assert_eq!(bar.open, dec!(50000));
    assert_eq!(bar.high, dec!(50010));
    assert_eq!(bar.low, dec!(50000));
    assert_eq!(bar.close, dec!(50005));
    assert_eq!(bar.volume, dec!(17502.25));
    assert_eq!(bar.trade_count, 3);
    assert_eq!(bar.source, "binance");
}

/// Arrival order must not matter; only trade timestamps do.
#[test]
fn bar_is_independent_of_arrival_order() {
    let ticks = scenario_ticks();
    let expected = aggregate("BTC", T0 / MINUTE_MS, &ticks, "binance");
    let orders = [[2, 0, 1], [1, 2, 0], [2, 1, 0]];
    for order in orders {
        let shuffled: Vec<Tick> = order.iter().map(|&i| ticks[i].clone()).collect();
        assert_eq!(aggregate("BTC", T0 / MINUTE_MS, &shuffled, "binance"), expected);
    }
}

#[test]
fn redelivered_trade_counts_once() {
    let mut ticks = scenario_ticks();
    ticks.push(ticks[1].clone());
    let bar = aggregate("BTC", T0 / MINUTE_MS, &ticks, "binance").unwrap();
    assert_eq!(bar.volume, dec!(17502.25));
    assert_eq!(bar.trade_count, 3);
}

#[test]
fn silent_minute_has_no_bar() {
    assert!(aggregate("BTC", T0 / MINUTE_MS + 1, &scenario_ticks(), "binance").is_none());
}

#[test]
fn aggregate_all_splits_by_symbol_and_minute() {
    let mut ticks = scenario_ticks();
    ticks.push(Tick::new("BTC", T0 + MINUTE_MS + 2_000, dec!(50020), dec!(1), None, Some("x")));
    ticks.push(Tick::new("ETH", T0 + 1_000, dec!(2000), dec!(2), None, Some("y")));
    let bars = aggregate_all(ticks, "binance");
    let keys: Vec<(&str, i64)> = bars
        .iter()
        .map(|b| (b.symbol.as_str(), b.window_start_ms))
        .collect();
    assert_eq!(
        keys,
        vec![("BTC", T0), ("BTC", T0 + MINUTE_MS), ("ETH", T0)]
    );
    assert_eq!(bars[2].volume, dec!(4000));
}
