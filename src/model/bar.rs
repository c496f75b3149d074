use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use super::tick::MINUTE_MS;

/// Minute-aligned OHLCV record. `volume` is quote-denominated (sum of price * size).
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub window_start_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
    pub source: String,
}

impl Bar {
    pub fn window_end_ms(&self) -> i64 {
        self.window_start_ms + MINUTE_MS
    }

    pub fn minute(&self) -> i64 {
        self.window_start_ms.div_euclid(MINUTE_MS)
    }

    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.window_start_ms).single()
    }
}
