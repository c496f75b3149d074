use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::tick::{Tick, MINUTE_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Same `dedup_key` already pending for the symbol.
    Duplicate,
    /// The tick's minute is below the symbol's watermark; that window was already handed off.
    Late { watermark_minute: i64 },
}

/// Ticks of one closed minute window, ready for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedWindow {
    pub symbol: String,
    pub minute: i64,
    pub ticks: Vec<Tick>,
}

#[derive(Debug)]
struct SymbolBuffer {
    pending: Vec<Tick>,
    pending_keys: HashSet<String>,
    /// Minutes strictly below this are closed.
    watermark_minute: i64,
}

impl SymbolBuffer {
    fn new(watermark_minute: i64) -> Self {
        Self {
            pending: Vec::new(),
            pending_keys: HashSet::new(),
            watermark_minute,
        }
    }

    fn take_through(&mut self, last_minute: i64) -> BTreeMap<i64, Vec<Tick>> {
        let mut closed: BTreeMap<i64, Vec<Tick>> = BTreeMap::new();
        let mut keep = Vec::with_capacity(self.pending.len());
        for tick in self.pending.drain(..) {
            if tick.minute() <= last_minute {
                self.pending_keys.remove(&tick.dedup_key);
                closed.entry(tick.minute()).or_default().push(tick);
            } else {
                keep.push(tick);
            }
        }
        self.pending = keep;
        closed
    }
}

/// Per-symbol pending ticks plus the window flush schedule.
///
/// A minute `m` closes once `now >= (m + 1) * 60s + tolerance`. Not thread
/// safe by construction: one owner mutates it.
#[derive(Debug)]
pub struct TickBuffer {
    symbols: HashMap<String, SymbolBuffer>,
    tolerance_ms: i64,
}

impl TickBuffer {
    pub fn new(tick_buffer_sec: u64) -> Self {
        Self {
            symbols: HashMap::new(),
            tolerance_ms: (tick_buffer_sec as i64).saturating_mul(1_000),
        }
    }

    pub fn tolerance_ms(&self) -> i64 {
        self.tolerance_ms
    }

    /// Add a tick regardless of which open minute it falls in.
    ///
    /// A symbol seen for the first time starts with its watermark at the
    /// first minute still open at `now_ms`, so a fresh buffer never reopens a
    /// minute that closed before it existed.
    pub fn push(&mut self, tick: Tick, now_ms: i64) -> PushOutcome {
        let first_open = self.last_closable_minute(now_ms) + 1;
        let state = self
            .symbols
            .entry(tick.symbol.clone())
            .or_insert_with(|| SymbolBuffer::new(first_open));
        if tick.minute() < state.watermark_minute {
            return PushOutcome::Late {
                watermark_minute: state.watermark_minute,
            };
        }
        if !state.pending_keys.insert(tick.dedup_key.clone()) {
            return PushOutcome::Duplicate;
        }
        state.pending.push(tick);
        PushOutcome::Accepted
    }

    /// Highest minute whose tolerance has elapsed at `now_ms`.
    pub fn last_closable_minute(&self, now_ms: i64) -> i64 {
        (now_ms - self.tolerance_ms).div_euclid(MINUTE_MS) - 1
    }

    /// Close every window whose tolerance has elapsed and advance watermarks.
    ///
    /// Windows come out ascending by minute within a symbol. Minutes with no
    /// ticks produce nothing.
    pub fn flush_due(&mut self, now_ms: i64) -> Vec<ClosedWindow> {
        let last = self.last_closable_minute(now_ms);
        let mut out = Vec::new();
        let mut symbols: Vec<String> = self.symbols.keys().cloned().collect();
        symbols.sort();

        for symbol in symbols {
            let Some(state) = self.symbols.get_mut(&symbol) else {
                continue;
            };
            if state.watermark_minute > last {
                continue;
            }
            for (minute, ticks) in state.take_through(last) {
                out.push(ClosedWindow {
                    symbol: symbol.clone(),
                    minute,
                    ticks,
                });
            }
            state.watermark_minute = last + 1;
        }
        out
    }

    /// Hand off everything still pending, open windows included. Used on shutdown.
    pub fn drain_all(&mut self) -> Vec<ClosedWindow> {
        let mut out = Vec::new();
        let mut symbols: Vec<String> = self.symbols.keys().cloned().collect();
        symbols.sort();
        for symbol in symbols {
            let Some(state) = self.symbols.get_mut(&symbol) else {
                continue;
            };
            let closed = state.take_through(i64::MAX);
            if let Some(&max_minute) = closed.keys().next_back() {
                state.watermark_minute = state.watermark_minute.max(max_minute + 1);
            }
            for (minute, ticks) in closed {
                out.push(ClosedWindow {
                    symbol: symbol.clone(),
                    minute,
                    ticks,
                });
            }
        }
        out
    }

    pub fn watermark(&self, symbol: &str) -> Option<i64> {
        self.symbols.get(symbol).map(|s| s.watermark_minute)
    }

    pub fn pending_len(&self) -> usize {
        self.symbols.values().map(|s| s.pending.len()).sum()
    }

    pub fn pending_for(&self, symbol: &str) -> usize {
        self.symbols.get(symbol).map_or(0, |s| s.pending.len())
    }
}
