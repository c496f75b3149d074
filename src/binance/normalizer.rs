//! Raw feed message -> canonical ticks.

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde_json::{Map, Value};

use super::types::{
    BatchTrade, BinanceKlineEvent, BinanceTradeEvent, SubscriptionAck, TradeBatch, TradeRecord,
};
use crate::model::tick::{Side, Tick};

/// Every feed shape the normalizer knows, plus a catch-all.
#[derive(Debug)]
pub enum WireMessage {
    Trade(BinanceTradeEvent),
    Record(TradeRecord),
    Batch(TradeBatch),
    Kline(BinanceKlineEvent),
    Ack(SubscriptionAck),
    Unrecognized,
}

impl WireMessage {
    /// Classify one text frame. Errors mean the frame matched a known shape
    /// but its fields did not parse, or it was not JSON at all.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let shape = match value.as_object() {
            Some(obj) => {
                // combined stream wrapper: {"stream": "...", "data": {...}}
                if obj.contains_key("stream") {
                    if let Some(inner) = obj.get("data") {
                        return Self::from_value(inner.clone());
                    }
                }
                classify(obj)
            }
            None => Shape::Unknown,
        };

        match shape {
            Shape::Trade => serde_json::from_value(value).map(WireMessage::Trade),
            Shape::Kline => serde_json::from_value(value).map(WireMessage::Kline),
            Shape::Batch => serde_json::from_value(value).map(WireMessage::Batch),
            Shape::Ack => serde_json::from_value(value).map(WireMessage::Ack),
            Shape::Record => serde_json::from_value(value).map(WireMessage::Record),
            Shape::Unknown => Ok(WireMessage::Unrecognized),
        }
    }
}

enum Shape {
    Trade,
    Kline,
    Batch,
    Ack,
    Record,
    Unknown,
}

fn classify(obj: &Map<String, Value>) -> Shape {
    match obj.get("e").and_then(Value::as_str) {
        Some("trade") | Some("aggTrade") => return Shape::Trade,
        Some("kline") => return Shape::Kline,
        _ => {}
    }
    let has_trade_array = obj.get("trades").is_some_and(Value::is_array)
        || obj.get("data").is_some_and(Value::is_array);
    if has_trade_array {
        Shape::Batch
    } else if obj.contains_key("id") && (obj.contains_key("result") || obj.contains_key("error")) {
        Shape::Ack
    } else if obj.contains_key("price") {
        Shape::Record
    } else {
        Shape::Unknown
    }
}

/// Counters for messages the normalizer consumed or dropped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NormalizerStats {
    pub messages: u64,
    pub ticks: u64,
    pub unparseable: u64,
    pub unrecognized: u64,
    pub invalid_trades: u64,
    pub out_of_universe: u64,
    pub skipped_candles: u64,
    pub acks: u64,
    pub rejected_acks: u64,
}

#[derive(Debug, Default)]
pub struct TickNormalizer {
    universe: HashSet<String>,
    stats: NormalizerStats,
}

impl TickNormalizer {
    pub fn new(symbols: &[String]) -> Self {
        let mut normalizer = Self::default();
        normalizer.set_universe(symbols);
        normalizer
    }

    pub fn set_universe(&mut self, symbols: &[String]) {
        self.universe = symbols
            .iter()
            .map(|s| canonical_symbol(s))
            .filter(|s| !s.is_empty())
            .collect();
    }

    pub fn in_universe(&self, symbol: &str) -> bool {
        self.universe.contains(symbol)
    }

    pub fn stats(&self) -> NormalizerStats {
        self.stats
    }

    /// Turn one raw frame into zero or more ticks. Never fails; drops are counted.
    pub fn normalize(&mut self, text: &str) -> Vec<Tick> {
        self.stats.messages += 1;
        let message = match WireMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                self.stats.unparseable += 1;
                tracing::debug!(error = %e, "Failed to parse feed message");
                return Vec::new();
            }
        };

        let candidates = match message {
            WireMessage::Trade(event) => match trade_event_tick(event) {
                Some(tick) => vec![tick],
                None => {
                    self.stats.invalid_trades += 1;
                    Vec::new()
                }
            },
            WireMessage::Record(record) => vec![record_tick(record)],
            WireMessage::Batch(batch) => self.batch_ticks(batch),
            WireMessage::Kline(event) => match kline_tick(event) {
                Some(tick) => vec![tick],
                None => {
                    self.stats.skipped_candles += 1;
                    Vec::new()
                }
            },
            WireMessage::Ack(ack) => {
                self.on_ack(&ack);
                Vec::new()
            }
            WireMessage::Unrecognized => {
                self.stats.unrecognized += 1;
                tracing::debug!(len = text.len(), "Unrecognized feed message shape");
                Vec::new()
            }
        };

        let mut out = Vec::with_capacity(candidates.len());
        for tick in candidates {
            // a notional outside the decimal range could never be summed into a bar
            if tick.price <= Decimal::ZERO || tick.size <= Decimal::ZERO || tick.notional().is_none() {
                self.stats.invalid_trades += 1;
                continue;
            }
            if !self.in_universe(&tick.symbol) {
                self.stats.out_of_universe += 1;
                continue;
            }
            out.push(tick);
        }
        self.stats.ticks += out.len() as u64;
        out
    }

    fn batch_ticks(&mut self, batch: TradeBatch) -> Vec<Tick> {
        let symbol = canonical_symbol(&batch.symbol);
        let mut out = Vec::with_capacity(batch.trades.len());
        for raw in batch.trades {
            match serde_json::from_value::<BatchTrade>(raw) {
                Ok(trade) => out.push(Tick::new(
                    &symbol,
                    trade.timestamp,
                    trade.price,
                    trade.size,
                    trade.side.as_deref().and_then(Side::parse),
                    trade.trade_id.as_deref(),
                )),
                Err(e) => {
                    self.stats.unparseable += 1;
                    tracing::debug!(symbol = %symbol, error = %e, "Dropping malformed trade in batch");
                }
            }
        }
        out
    }

    fn on_ack(&mut self, ack: &SubscriptionAck) {
        if ack.is_success() {
            self.stats.acks += 1;
            tracing::debug!(id = ?ack.id, "Subscription acknowledged");
        } else {
            self.stats.rejected_acks += 1;
            tracing::warn!(id = ?ack.id, error = ?ack.error, result = ?ack.result, "Subscription request rejected");
        }
    }
}

pub fn canonical_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

fn trade_event_tick(event: BinanceTradeEvent) -> Option<Tick> {
    let dedup_id = event.dedup_id();
    let timestamp_ms = event.trade_time.or(event.event_time)?;
    Some(Tick::new(
        &canonical_symbol(&event.symbol),
        timestamp_ms,
        event.price,
        event.qty,
        event.is_buyer_maker.map(Side::from_buyer_maker),
        dedup_id.as_deref(),
    ))
}

fn record_tick(record: TradeRecord) -> Tick {
    Tick::new(
        &canonical_symbol(&record.symbol),
        record.timestamp,
        record.price,
        record.size,
        record.side.as_deref().and_then(Side::parse),
        record.trade_id.as_deref(),
    )
}

/// A final one-minute candle becomes one tick at the candle open, priced at
/// the close with the candle's base volume. Open candles and other
/// intervals yield nothing.
fn kline_tick(event: BinanceKlineEvent) -> Option<Tick> {
    let k = event.kline;
    if !k.is_final || k.interval.as_deref().is_some_and(|i| i != "1m") {
        return None;
    }
    let symbol = canonical_symbol(&event.symbol);
    let key = format!("kline:{}:{}", symbol, k.open_time);
    Some(Tick::new(&symbol, k.open_time, k.close, k.volume, None, Some(&key)))
}
