//! Persistence gateway: bounded retries around the store, then log and drop.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::BarStore;
use crate::error::AppError;
use crate::model::bar::Bar;
use crate::model::tick::Tick;

/// Idempotent write surface used by the gateway.
pub trait BarSink: Send + 'static {
    fn upsert_bars(&mut self, bars: &[Bar]) -> Result<usize, AppError>;
    fn upsert_ticks(&mut self, ticks: &[Tick]) -> Result<usize, AppError>;
}

impl BarSink for BarStore {
    fn upsert_bars(&mut self, bars: &[Bar]) -> Result<usize, AppError> {
        BarStore::upsert_bars(self, bars)
    }

    fn upsert_ticks(&mut self, ticks: &[Tick]) -> Result<usize, AppError> {
        BarStore::upsert_ticks(self, ticks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per batch, first one included.
    pub attempts: u32,
    /// Wait after the first failure; doubles on each further failure.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub bars_written: u64,
    pub bars_dropped: u64,
    pub ticks_written: u64,
    pub ticks_dropped: u64,
    pub retries: u64,
}

#[derive(Debug)]
pub enum WriteRequest {
    Bars(Vec<Bar>),
    Ticks(Vec<Tick>),
}

pub struct PersistenceGateway<S: BarSink = BarStore> {
    sink: S,
    policy: RetryPolicy,
    stats: WriterStats,
    /// Past this instant nothing new is attempted and no retry is started.
    deadline: Option<Instant>,
}

impl<S: BarSink> PersistenceGateway<S> {
    pub fn new(sink: S, policy: RetryPolicy) -> Self {
        Self {
            sink,
            policy,
            stats: WriterStats::default(),
            deadline: None,
        }
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    fn past_deadline(&self, after: Duration) -> bool {
        self.deadline
            .is_some_and(|d| Instant::now().checked_add(after).map_or(true, |t| t >= d))
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Upsert a batch of bars. Returns `false` when the batch was dropped.
    pub fn write_bars(&mut self, bars: &[Bar]) -> bool {
        if bars.is_empty() {
            return true;
        }
        let ok = self.with_retry("bars", bars.len(), |sink| sink.upsert_bars(bars));
        if ok {
            self.stats.bars_written += bars.len() as u64;
        } else {
            self.stats.bars_dropped += bars.len() as u64;
            for bar in bars {
                tracing::warn!(
                    symbol = %bar.symbol,
                    window_start_ms = bar.window_start_ms,
                    "Dropped bar; rerun rollup for this window"
                );
            }
        }
        ok
    }

    /// Upsert a batch of raw ticks. Returns `false` when the batch was dropped.
    pub fn write_ticks(&mut self, ticks: &[Tick]) -> bool {
        if ticks.is_empty() {
            return true;
        }
        let ok = self.with_retry("ticks", ticks.len(), |sink| sink.upsert_ticks(ticks));
        if ok {
            self.stats.ticks_written += ticks.len() as u64;
        } else {
            self.stats.ticks_dropped += ticks.len() as u64;
        }
        ok
    }

    fn with_retry<F>(&mut self, what: &str, rows: usize, mut op: F) -> bool
    where
        F: FnMut(&mut S) -> Result<usize, AppError>,
    {
        if self.past_deadline(Duration::ZERO) {
            tracing::error!(what, rows, "Drain deadline passed, dropping batch");
            return false;
        }
        let attempts = self.policy.attempts.max(1);
        let mut delay = self.policy.delay;
        for attempt in 1..=attempts {
            match op(&mut self.sink) {
                Ok(_) => return true,
                Err(e) if attempt < attempts && !self.past_deadline(delay) => {
                    self.stats.retries += 1;
                    tracing::warn!(what, rows, attempt, error = %e, "Store write failed, retrying");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    tracing::error!(what, rows, attempt, error = %e, "Store write failed, dropping batch");
                    return false;
                }
            }
        }
        false
    }
}

/// Run the gateway on a blocking thread, draining `rx` until every sender is gone.
/// The gateway comes back out of the join handle so callers can read its stats.
///
/// Requests already queued when the writer wakes are merged into one tick
/// write and one bar write. Once `deadline` holds an instant, the gateway
/// stops retrying past it and drops whatever is still queued after it.
pub fn spawn_writer<S: BarSink>(
    mut gateway: PersistenceGateway<S>,
    mut rx: mpsc::Receiver<WriteRequest>,
    deadline: watch::Receiver<Option<Instant>>,
) -> JoinHandle<PersistenceGateway<S>> {
    tokio::task::spawn_blocking(move || {
        let mut bars = Vec::new();
        let mut ticks = Vec::new();
        while let Some(first) = rx.blocking_recv() {
            let mut merged = 1;
            let mut next = Some(first);
            while let Some(request) = next {
                match request {
                    WriteRequest::Bars(mut b) => bars.append(&mut b),
                    WriteRequest::Ticks(mut t) => ticks.append(&mut t),
                }
                next = rx.try_recv().ok();
                merged += usize::from(next.is_some());
            }
            if merged > 1 {
                tracing::debug!(merged, bars = bars.len(), ticks = ticks.len(), "Coalesced queued writes");
            }
            gateway.set_deadline(*deadline.borrow());
            gateway.write_ticks(&ticks);
            gateway.write_bars(&bars);
            ticks.clear();
            bars.clear();
        }
        let stats = gateway.stats();
        tracing::info!(
            bars_written = stats.bars_written,
            bars_dropped = stats.bars_dropped,
            ticks_written = stats.ticks_written,
            ticks_dropped = stats.ticks_dropped,
            retries = stats.retries,
            "Store writer finished"
        );
        gateway
    })
}
