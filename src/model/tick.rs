use rust_decimal::Decimal;

pub const MINUTE_MS: i64 = 60_000;

/// Minute bucket index (minutes since the Unix epoch) for a UTC millisecond timestamp.
pub fn minute_of(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(MINUTE_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "b" | "bid" => Some(Side::Buy),
            "sell" | "s" | "ask" => Some(Side::Sell),
            _ => None,
        }
    }

    /// Binance reports the maker flag; the aggressor is the opposite side.
    pub fn from_buyer_maker(is_buyer_maker: bool) -> Self {
        if is_buyer_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

/// One normalized trade.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    /// Exchange-reported trade time, UTC milliseconds.
    pub timestamp_ms: i64,
    pub price: Decimal,
    /// Base-asset quantity.
    pub size: Decimal,
    pub side: Option<Side>,
    pub dedup_key: String,
}

impl Tick {
    /// Build a tick, falling back to a derived dedup key when the feed
    /// carries no trade id.
    pub fn new(
        symbol: &str,
        timestamp_ms: i64,
        price: Decimal,
        size: Decimal,
        side: Option<Side>,
        trade_id: Option<&str>,
    ) -> Self {
        let symbol = symbol.trim().to_ascii_uppercase();
        let dedup_key = match trade_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => fallback_dedup_key(&symbol, timestamp_ms, price, size),
        };
        Self {
            symbol,
            timestamp_ms,
            price,
            size,
            side,
            dedup_key,
        }
    }

    pub fn minute(&self) -> i64 {
        minute_of(self.timestamp_ms)
    }

    /// Quote-denominated value of the trade, `None` when it does not fit a `Decimal`.
    pub fn notional(&self) -> Option<Decimal> {
        self.price.checked_mul(self.size)
    }
}

/// Deterministic key for trades without an exchange id.
///
/// Known limitation: two distinct trades with the same symbol, millisecond,
/// price and size produce the same key and are counted once.
pub fn fallback_dedup_key(symbol: &str, timestamp_ms: i64, price: Decimal, size: Decimal) -> String {
    format!(
        "{}:{}:{}:{}",
        symbol,
        timestamp_ms,
        price.normalize(),
        size.normalize()
    )
}
