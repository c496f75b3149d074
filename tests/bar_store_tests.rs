use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tick_rollup::bar_store::BarStore;
use tick_rollup::model::bar::Bar;
use tick_rollup::model::tick::{Side, Tick, MINUTE_MS};

const T0: i64 = 1_704_103_200_000;

fn bar(symbol: &str, start: i64, close: Decimal) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        window_start_ms: start,
        open: dec!(100),
        high: dec!(110),
        low: dec!(90),
        close,
        volume: dec!(1234.5),
        trade_count: 4,
        source: "binance".to_string(),
    }
}

#[test]
fn upserting_same_window_twice_keeps_one_row_with_latest_values() {
    let mut store = BarStore::open_in_memory().unwrap();
    store.upsert_bars(&[bar("BTC", T0, dec!(101))]).unwrap();
    store.upsert_bars(&[bar("BTC", T0, dec!(105))]).unwrap();
    store.upsert_bars(&[bar("BTC", T0, dec!(105))]).unwrap();

    assert_eq!(store.count_bars().unwrap(), 1);
    let bars = store.load_bars("BTC", T0, T0 + MINUTE_MS).unwrap();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].close, dec!(105));
}

#[test]
fn redelivered_ticks_collapse_to_one_row() {
    let mut store = BarStore::open_in_memory().unwrap();
    let t = Tick::new("BTC", T0 + 5, dec!(50000), dec!(0.1), Some(Side::Buy), Some("42"));
    store.upsert_ticks(&[t.clone(), t.clone()]).unwrap();
    store.upsert_ticks(&[t]).unwrap();
    assert_eq!(store.count_ticks().unwrap(), 1);

    // same trade id on another symbol is a different trade
    let other = Tick::new("ETH", T0 + 5, dec!(2000), dec!(1), None, Some("42"));
    store.upsert_ticks(&[other]).unwrap();
    assert_eq!(store.count_ticks().unwrap(), 2);
}

#[test]
fn silent_minutes_have_no_rows() {
    let mut store = BarStore::open_in_memory().unwrap();
    store
        .upsert_bars(&[
            bar("BTC", T0, dec!(1)),
            bar("BTC", T0 + 2 * MINUTE_MS, dec!(3)),
        ])
        .unwrap();
    let starts: Vec<i64> = store
        .load_bars("BTC", T0, T0 + 3 * MINUTE_MS)
        .unwrap()
        .iter()
        .map(|b| b.window_start_ms)
        .collect();
    assert_eq!(starts, vec![T0, T0 + 2 * MINUTE_MS]);
    assert!(store.load_bars("ETH", T0, T0 + 3 * MINUTE_MS).unwrap().is_empty());
}

#[test]
fn file_store_survives_reopen() {
    let dir = std::env::temp_dir().join(format!(
        "tick-rollup-store-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let path = dir.join("nested").join("bars.sqlite");
    {
        let mut store = BarStore::open(&path).unwrap();
        store.upsert_bars(&[bar("BTC", T0, dec!(7))]).unwrap();
    }
    let store = BarStore::open(&path).unwrap();
    assert_eq!(store.load_bars("BTC", T0, T0 + MINUTE_MS).unwrap()[0].close, dec!(7));
    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}
