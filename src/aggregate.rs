//! Minute bar aggregation shared by the live ingestion path and the batch rollup.

use std::collections::{BTreeMap, HashSet};

use rust_decimal::Decimal;

use crate::model::bar::Bar;
use crate::model::tick::{Tick, MINUTE_MS};

/// Reduce the ticks of one symbol/minute into a bar.
///
/// Ticks outside `[minute, minute + 1)` or for another symbol are ignored,
/// repeated `dedup_key`s count once (first arrival wins), and ordering is by
/// trade timestamp with arrival order kept for exact ties. Returns `None`
/// when nothing is left, so silent minutes never produce a bar.
///
/// Ticks whose notional does not fit a `Decimal` are skipped. A window whose
/// volume sum overflows yields no bar and is logged.
pub fn aggregate(symbol: &str, minute: i64, ticks: &[Tick], source: &str) -> Option<Bar> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(ticks.len());
    let mut window: Vec<(&Tick, Decimal)> = ticks
        .iter()
        .filter(|t| t.symbol == symbol && t.minute() == minute)
        .filter(|t| seen.insert(t.dedup_key.as_str()))
        .filter_map(|t| t.notional().map(|notional| (t, notional)))
        .collect();
    if window.is_empty() {
        return None;
    }
    // sort_by_key is stable
    window.sort_by_key(|(t, _)| t.timestamp_ms);

    let first = window[0].0;
    let last = window[window.len() - 1].0;
    let mut high = first.price;
    let mut low = first.price;
    let mut volume = Decimal::ZERO;
    for (t, notional) in &window {
        high = high.max(t.price);
        low = low.min(t.price);
        volume = match volume.checked_add(*notional) {
            Some(v) => v,
            None => {
                tracing::warn!(symbol, minute, trades = window.len(), "Bar volume overflowed, window skipped");
                return None;
            }
        };
    }

    Some(Bar {
        symbol: symbol.to_string(),
        window_start_ms: minute * MINUTE_MS,
        open: first.price,
        high,
        low,
        close: last.price,
        volume,
        trade_count: window.len() as u64,
        source: source.to_string(),
    })
}

/// Group ticks by `(symbol, minute)`, keeping arrival order inside each group.
pub fn group_by_minute(ticks: Vec<Tick>) -> BTreeMap<(String, i64), Vec<Tick>> {
    let mut groups: BTreeMap<(String, i64), Vec<Tick>> = BTreeMap::new();
    for tick in ticks {
        groups
            .entry((tick.symbol.clone(), tick.minute()))
            .or_default()
            .push(tick);
    }
    groups
}

/// Aggregate every `(symbol, minute)` group, ordered by symbol then window start.
pub fn aggregate_all(ticks: Vec<Tick>, source: &str) -> Vec<Bar> {
    group_by_minute(ticks)
        .into_iter()
        .filter_map(|((symbol, minute), group)| aggregate(&symbol, minute, &group, source))
        .collect()
}
