use std::str::FromStr;

use chrono::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parse a decimal carried either as a JSON string or a JSON number.
pub fn decimal_from_value(v: &Value) -> Option<Decimal> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Decimal::from_str(&s)
        .or_else(|_| Decimal::from_scientific(&s))
        .ok()
}

/// Normalize an exchange timestamp to UTC milliseconds.
///
/// Integers are classified by magnitude (seconds, millis, micros, nanos);
/// fractional numbers are seconds; strings may be numeric or RFC 3339.
pub fn timestamp_ms_from_value(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(scale_epoch_integer(i))
            } else {
                n.as_f64().and_then(fractional_seconds_to_ms)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Some(scale_epoch_integer(i))
            } else if let Ok(f) = s.parse::<f64>() {
                fractional_seconds_to_ms(f)
            } else {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            }
        }
        _ => None,
    }
}

fn scale_epoch_integer(i: i64) -> i64 {
    let magnitude = i.unsigned_abs();
    if magnitude < 100_000_000_000 {
        i.saturating_mul(1_000)
    } else if magnitude < 100_000_000_000_000 {
        i
    } else if magnitude < 100_000_000_000_000_000 {
        i / 1_000
    } else {
        i / 1_000_000
    }
}

fn fractional_seconds_to_ms(f: f64) -> Option<i64> {
    if !f.is_finite() {
        return None;
    }
    Some((f * 1_000.0).round() as i64)
}

pub fn string_or_number_to_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    decimal_from_value(&v).ok_or_else(|| serde::de::Error::custom("invalid decimal value"))
}

pub fn flexible_timestamp_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    timestamp_ms_from_value(&v).ok_or_else(|| serde::de::Error::custom("invalid timestamp"))
}

pub fn opt_flexible_timestamp_ms<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    if v.is_null() {
        return Ok(None);
    }
    timestamp_ms_from_value(&v)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom("invalid timestamp"))
}

pub fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(serde::de::Error::custom("invalid identifier")),
    }
}

/// Binance trade stream event (`symbol@trade` or `symbol@aggTrade`).
#[derive(Debug, Deserialize)]
pub struct BinanceTradeEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "t", default)]
    pub trade_id: Option<u64>,
    #[serde(rename = "a", default)]
    pub agg_trade_id: Option<u64>,
    #[serde(rename = "p", deserialize_with = "string_or_number_to_decimal")]
    pub price: Decimal,
    #[serde(rename = "q", deserialize_with = "string_or_number_to_decimal")]
    pub qty: Decimal,
    #[serde(rename = "T", default, deserialize_with = "opt_flexible_timestamp_ms")]
    pub trade_time: Option<i64>,
    #[serde(rename = "m", default)]
    pub is_buyer_maker: Option<bool>,
}

impl BinanceTradeEvent {
    pub fn is_aggregate(&self) -> bool {
        self.event_type == "aggTrade"
    }

    /// Trade id scoped to the stream kind so trade and aggTrade ids never collide.
    pub fn dedup_id(&self) -> Option<String> {
        if self.is_aggregate() {
            self.agg_trade_id.map(|id| format!("a{}", id))
        } else {
            self.trade_id.map(|id| id.to_string())
        }
    }
}

/// A single trade record in the generic shape some feeds push directly.
#[derive(Debug, Deserialize)]
pub struct TradeRecord {
    #[serde(alias = "ticker", alias = "pair")]
    pub symbol: String,
    #[serde(deserialize_with = "string_or_number_to_decimal")]
    pub price: Decimal,
    #[serde(alias = "qty", alias = "quantity", alias = "amount", deserialize_with = "string_or_number_to_decimal")]
    pub size: Decimal,
    #[serde(alias = "ts", alias = "time", deserialize_with = "flexible_timestamp_ms")]
    pub timestamp: i64,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, alias = "id", alias = "tid", deserialize_with = "opt_string_or_number")]
    pub trade_id: Option<String>,
}

/// Trade inside an envelope that carries the symbol once.
#[derive(Debug, Deserialize)]
pub struct BatchTrade {
    #[serde(deserialize_with = "string_or_number_to_decimal")]
    pub price: Decimal,
    #[serde(alias = "qty", alias = "quantity", alias = "amount", deserialize_with = "string_or_number_to_decimal")]
    pub size: Decimal,
    #[serde(alias = "ts", alias = "time", deserialize_with = "flexible_timestamp_ms")]
    pub timestamp: i64,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, alias = "id", alias = "tid", deserialize_with = "opt_string_or_number")]
    pub trade_id: Option<String>,
}

/// Envelope with an array of trades sharing one symbol.
#[derive(Debug, Deserialize)]
pub struct TradeBatch {
    #[serde(alias = "ticker", alias = "pair")]
    pub symbol: String,
    #[serde(alias = "data")]
    pub trades: Vec<Value>,
}

/// Binance kline stream event (`symbol@kline_1m`).
#[derive(Debug, Deserialize)]
pub struct BinanceKlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: BinanceKline,
}

#[derive(Debug, Deserialize)]
pub struct BinanceKline {
    #[serde(rename = "t", deserialize_with = "flexible_timestamp_ms")]
    pub open_time: i64,
    #[serde(rename = "T", default, deserialize_with = "opt_flexible_timestamp_ms")]
    pub close_time: Option<i64>,
    #[serde(rename = "i", default)]
    pub interval: Option<String>,
    #[serde(rename = "o", deserialize_with = "string_or_number_to_decimal")]
    pub open: Decimal,
    #[serde(rename = "h", deserialize_with = "string_or_number_to_decimal")]
    pub high: Decimal,
    #[serde(rename = "l", deserialize_with = "string_or_number_to_decimal")]
    pub low: Decimal,
    #[serde(rename = "c", deserialize_with = "string_or_number_to_decimal")]
    pub close: Decimal,
    #[serde(rename = "v", deserialize_with = "string_or_number_to_decimal")]
    pub volume: Decimal,
    #[serde(rename = "x", default)]
    pub is_final: bool,
}

/// Response to a SUBSCRIBE/UNSUBSCRIBE request.
#[derive(Debug, Deserialize)]
pub struct SubscriptionAck {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl SubscriptionAck {
    /// Binance answers a successful request with `"result": null` and no error.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.result.as_ref().map_or(true, Value::is_null)
    }
}

/// Outbound SUBSCRIBE/UNSUBSCRIBE request.
#[derive(Debug, Serialize)]
pub struct StreamRequest {
    pub method: &'static str,
    pub params: Vec<String>,
    pub id: u64,
}

impl StreamRequest {
    pub fn subscribe(stream: String, id: u64) -> Self {
        Self {
            method: "SUBSCRIBE",
            params: vec![stream],
            id,
        }
    }

    pub fn unsubscribe(stream: String, id: u64) -> Self {
        Self {
            method: "UNSUBSCRIBE",
            params: vec![stream],
            id,
        }
    }
}
