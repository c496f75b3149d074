use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::buffer::{ClosedWindow, PushOutcome, TickBuffer};
use crate::aggregate::aggregate;
use crate::bar_store::writer::WriteRequest;
use crate::clock::Clock;
use crate::model::bar::Bar;
use crate::model::tick::Tick;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Provenance label stamped on every bar.
    pub source: String,
    pub tick_buffer_sec: u64,
    pub flush_interval: Duration,
    /// Also append accepted and late ticks to the raw tick log.
    pub persist_ticks: bool,
    pub stats_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source: "binance".to_string(),
            tick_buffer_sec: 5,
            flush_interval: Duration::from_secs(1),
            persist_ticks: true,
            stats_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub late: u64,
    pub windows_closed: u64,
    pub bars_emitted: u64,
    /// Write requests refused because the writer queue was full or gone.
    pub writes_dropped: u64,
}

/// Owner of the tick buffer. Everything that mutates window state runs on
/// this one task, so pushes and flushes never interleave.
///
/// Tick-log rows are held until the next flush and go out as one write.
/// Writes never wait on the store: a full writer queue drops the request.
pub struct IngestService {
    buffer: TickBuffer,
    clock: Arc<dyn Clock>,
    config: IngestConfig,
    write_tx: mpsc::Sender<WriteRequest>,
    tick_log: Vec<Tick>,
    stats: IngestStats,
}

impl IngestService {
    pub fn new(config: IngestConfig, clock: Arc<dyn Clock>, write_tx: mpsc::Sender<WriteRequest>) -> Self {
        Self {
            buffer: TickBuffer::new(config.tick_buffer_sec),
            clock,
            config,
            write_tx,
            tick_log: Vec::new(),
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn buffer(&self) -> &TickBuffer {
        &self.buffer
    }

    /// Tick-log rows waiting for the next flush.
    pub fn pending_log_len(&self) -> usize {
        self.tick_log.len()
    }

    pub fn on_ticks(&mut self, ticks: Vec<Tick>) {
        let now_ms = self.clock.now_ms();
        for tick in ticks {
            self.stats.received += 1;
            let copy = tick.clone();
            match self.buffer.push(tick, now_ms) {
                PushOutcome::Accepted => {
                    self.stats.accepted += 1;
                    if self.config.persist_ticks {
                        self.tick_log.push(copy);
                    }
                }
                PushOutcome::Duplicate => {
                    self.stats.duplicates += 1;
                }
                PushOutcome::Late { watermark_minute } => {
                    self.stats.late += 1;
                    tracing::warn!(
                        symbol = %copy.symbol,
                        timestamp_ms = copy.timestamp_ms,
                        watermark_minute,
                        "Late tick excluded from live bar; rollup repairs it from the tick log"
                    );
                    if self.config.persist_ticks {
                        self.tick_log.push(copy);
                    }
                }
            }
        }
    }

    /// Send the held tick-log rows, then close whatever windows are due at
    /// the current clock reading.
    pub fn on_timer(&mut self) -> Vec<Bar> {
        self.flush_tick_log();
        let closed = self.buffer.flush_due(self.clock.now_ms());
        self.emit(closed)
    }

    /// Flush every pending window, open ones included.
    pub fn shutdown_flush(&mut self) -> Vec<Bar> {
        self.flush_tick_log();
        let closed = self.buffer.drain_all();
        self.emit(closed)
    }

    fn flush_tick_log(&mut self) {
        if !self.tick_log.is_empty() {
            let rows = std::mem::take(&mut self.tick_log);
            self.send(WriteRequest::Ticks(rows));
        }
    }

    fn emit(&mut self, closed: Vec<ClosedWindow>) -> Vec<Bar> {
        if closed.is_empty() {
            return Vec::new();
        }
        self.stats.windows_closed += closed.len() as u64;
        let bars: Vec<Bar> = closed
            .iter()
            .filter_map(|w| aggregate(&w.symbol, w.minute, &w.ticks, &self.config.source))
            .collect();
        for bar in &bars {
            tracing::debug!(
                symbol = %bar.symbol,
                window_start_ms = bar.window_start_ms,
                close = %bar.close,
                trades = bar.trade_count,
                "Bar closed"
            );
        }
        self.stats.bars_emitted += bars.len() as u64;
        if !bars.is_empty() {
            self.send(WriteRequest::Bars(bars.clone()));
        }
        bars
    }

    fn send(&mut self, request: WriteRequest) {
        let (request, reason) = match self.write_tx.try_send(request) {
            Ok(()) => return,
            Err(TrySendError::Full(request)) => (request, "Store writer queue full"),
            Err(TrySendError::Closed(request)) => (request, "Store writer is gone"),
        };
        self.stats.writes_dropped += 1;
        match &request {
            WriteRequest::Bars(bars) => {
                for bar in bars {
                    tracing::error!(
                        symbol = %bar.symbol,
                        window_start_ms = bar.window_start_ms,
                        "{}; bar dropped, rerun rollup for this window",
                        reason
                    );
                }
            }
            WriteRequest::Ticks(ticks) => {
                tracing::error!(rows = ticks.len(), "{}; tick-log rows dropped", reason);
            }
        }
    }

    fn log_stats(&self) {
        tracing::info!(
            received = self.stats.received,
            accepted = self.stats.accepted,
            duplicates = self.stats.duplicates,
            late = self.stats.late,
            bars = self.stats.bars_emitted,
            writes_dropped = self.stats.writes_dropped,
            pending = self.buffer.pending_len(),
            "Ingest stats"
        );
    }

    /// Consume tick batches until the sender side closes, flushing due
    /// windows on every timer tick. On close, due windows are flushed first
    /// and then every remaining partial window. Dropping the service at the
    /// end releases the writer channel.
    pub async fn run(mut self, mut tick_rx: mpsc::Receiver<Vec<Tick>>) -> IngestStats {
        let mut flush_timer = tokio::time::interval(self.config.flush_interval);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stats_timer = tokio::time::interval(self.config.stats_interval);
        stats_timer.tick().await;

        loop {
            tokio::select! {
                batch = tick_rx.recv() => match batch {
                    Some(ticks) => self.on_ticks(ticks),
                    None => break,
                },
                _ = flush_timer.tick() => {
                    self.on_timer();
                }
                _ = stats_timer.tick() => self.log_stats(),
            }
        }

        self.on_timer();
        let partial = self.shutdown_flush();
        tracing::info!(bars = partial.len(), "Shutdown flush complete");
        self.log_stats();
        self.stats
    }
}
