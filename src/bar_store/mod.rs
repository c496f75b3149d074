//! Durable tick log and bar table on SQLite.
//!
//! Both tables are written with `INSERT .. ON CONFLICT DO UPDATE`, so any
//! write can be repeated: bars converge on `(symbol, window_start_ms)` and
//! raw ticks on `(symbol, timestamp_ms, dedup_key)`.

pub mod writer;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;

use crate::error::AppError;
use crate::model::bar::Bar;
use crate::model::tick::{Side, Tick};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bars_1m (
    symbol TEXT NOT NULL,
    window_start_ms INTEGER NOT NULL,
    window_end_ms INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume TEXT NOT NULL,
    trade_count INTEGER NOT NULL,
    source TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    PRIMARY KEY(symbol, window_start_ms)
);

CREATE TABLE IF NOT EXISTS ticks (
    symbol TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    dedup_key TEXT NOT NULL,
    price TEXT NOT NULL,
    size TEXT NOT NULL,
    side TEXT,
    received_at_ms INTEGER NOT NULL,
    PRIMARY KEY(symbol, timestamp_ms, dedup_key)
);

CREATE INDEX IF NOT EXISTS ticks_by_time ON ticks(timestamp_ms);
"#;

pub struct BarStore {
    conn: Connection,
}

impl BarStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // The live recorder and a rollup run may hold the file at the same time.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AppError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn upsert_bars(&mut self, bars: &[Bar]) -> Result<usize, AppError> {
        if bars.is_empty() {
            return Ok(0);
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO bars_1m (
                    symbol, window_start_ms, window_end_ms, open, high, low, close,
                    volume, trade_count, source, updated_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(symbol, window_start_ms) DO UPDATE SET
                    window_end_ms = excluded.window_end_ms,
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    trade_count = excluded.trade_count,
                    source = excluded.source,
                    updated_at_ms = excluded.updated_at_ms
                "#,
            )?;
            for bar in bars {
                stmt.execute(params![
                    bar.symbol,
                    bar.window_start_ms,
                    bar.window_end_ms(),
                    bar.open.to_string(),
                    bar.high.to_string(),
                    bar.low.to_string(),
                    bar.close.to_string(),
                    bar.volume.to_string(),
                    bar.trade_count as i64,
                    bar.source,
                    now_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(bars.len())
    }

    pub fn upsert_ticks(&mut self, ticks: &[Tick]) -> Result<usize, AppError> {
        if ticks.is_empty() {
            return Ok(0);
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO ticks (
                    symbol, timestamp_ms, dedup_key, price, size, side, received_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(symbol, timestamp_ms, dedup_key) DO UPDATE SET
                    price = excluded.price,
                    size = excluded.size,
                    side = excluded.side
                "#,
            )?;
            for t in ticks {
                stmt.execute(params![
                    t.symbol,
                    t.timestamp_ms,
                    t.dedup_key,
                    t.price.to_string(),
                    t.size.to_string(),
                    t.side.map(|s| s.as_str()),
                    now_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(ticks.len())
    }

    /// Raw ticks with `from_ms <= timestamp_ms < to_ms`, ordered by symbol,
    /// timestamp and then first-insert order.
    pub fn load_ticks(
        &self,
        from_ms: i64,
        to_ms: i64,
        symbols: Option<&[String]>,
    ) -> Result<Vec<Tick>, AppError> {
        let mut out = Vec::new();
        match symbols {
            Some(symbols) => {
                let mut stmt = self.conn.prepare_cached(
                    r#"
                    SELECT symbol, timestamp_ms, dedup_key, price, size, side
                    FROM ticks
                    WHERE symbol = ?1 AND timestamp_ms >= ?2 AND timestamp_ms < ?3
                    ORDER BY timestamp_ms ASC, rowid ASC
                    "#,
                )?;
                let mut sorted: Vec<&String> = symbols.iter().collect();
                sorted.sort();
                sorted.dedup();
                for symbol in sorted {
                    let rows = stmt.query_map(params![symbol, from_ms, to_ms], tick_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            None => {
                let mut stmt = self.conn.prepare_cached(
                    r#"
                    SELECT symbol, timestamp_ms, dedup_key, price, size, side
                    FROM ticks
                    WHERE timestamp_ms >= ?1 AND timestamp_ms < ?2
                    ORDER BY symbol ASC, timestamp_ms ASC, rowid ASC
                    "#,
                )?;
                let rows = stmt.query_map(params![from_ms, to_ms], tick_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Persisted bars for one symbol with `from_ms <= window_start_ms < to_ms`, oldest first.
    pub fn load_bars(&self, symbol: &str, from_ms: i64, to_ms: i64) -> Result<Vec<Bar>, AppError> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT symbol, window_start_ms, open, high, low, close, volume, trade_count, source
            FROM bars_1m
            WHERE symbol = ?1 AND window_start_ms >= ?2 AND window_start_ms < ?3
            ORDER BY window_start_ms ASC
            "#,
        )?;
        let rows = stmt.query_map(params![symbol, from_ms, to_ms], bar_from_row)?;
        let mut bars = Vec::new();
        for row in rows {
            bars.push(row?);
        }
        Ok(bars)
    }

    pub fn count_bars(&self) -> Result<u64, AppError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM bars_1m", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn count_ticks(&self) -> Result<u64, AppError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ticks", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn tick_from_row(row: &Row<'_>) -> rusqlite::Result<Tick> {
    let side: Option<String> = row.get(5)?;
    Ok(Tick {
        symbol: row.get(0)?,
        timestamp_ms: row.get(1)?,
        dedup_key: row.get(2)?,
        price: decimal_column(row, 3)?,
        size: decimal_column(row, 4)?,
        side: side.as_deref().and_then(Side::parse),
    })
}

fn bar_from_row(row: &Row<'_>) -> rusqlite::Result<Bar> {
    Ok(Bar {
        symbol: row.get(0)?,
        window_start_ms: row.get(1)?,
        open: decimal_column(row, 2)?,
        high: decimal_column(row, 3)?,
        low: decimal_column(row, 4)?,
        close: decimal_column(row, 5)?,
        volume: decimal_column(row, 6)?,
        trade_count: row.get::<_, i64>(7)? as u64,
        source: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(symbol: &str, start: i64, close: Decimal) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            window_start_ms: start,
            open: dec!(1),
            high: dec!(2),
            low: dec!(0.5),
            close,
            volume: dec!(17502.25),
            trade_count: 3,
            source: "test".to_string(),
        }
    }

    #[test]
    fn decimals_round_trip_exactly() {
        let mut store = BarStore::open_in_memory().unwrap();
        store.upsert_bars(&[bar("BTC", 0, dec!(50005.000))]).unwrap();
        let loaded = store.load_bars("BTC", 0, 60_000).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].volume, dec!(17502.25));
        assert_eq!(loaded[0].close, dec!(50005));
        assert_eq!(loaded[0].window_end_ms(), 60_000);
    }

    #[test]
    fn load_ticks_respects_half_open_range_and_symbol_filter() {
        let mut store = BarStore::open_in_memory().unwrap();
        let ticks = vec![
            Tick::new("BTC", 0, dec!(1), dec!(1), Some(Side::Buy), Some("1")),
            Tick::new("BTC", 59_999, dec!(1), dec!(1), None, Some("2")),
            Tick::new("BTC", 60_000, dec!(1), dec!(1), None, Some("3")),
            Tick::new("ETH", 10, dec!(1), dec!(1), None, Some("4")),
        ];
        store.upsert_ticks(&ticks).unwrap();
        assert_eq!(store.load_ticks(0, 60_000, None).unwrap().len(), 3);
        let btc = store
            .load_ticks(0, 60_000, Some(&["BTC".to_string()]))
            .unwrap();
        assert_eq!(btc.len(), 2);
        assert_eq!(btc[0].side, Some(Side::Buy));
    }
}
