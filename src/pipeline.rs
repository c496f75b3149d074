//! Live path wiring: feed task -> ingest actor -> blocking store writer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::bar_store::writer::{spawn_writer, PersistenceGateway, RetryPolicy, WriterStats};
use crate::bar_store::BarStore;
use crate::binance::normalizer::NormalizerStats;
use crate::binance::ws::{BinanceWsClient, ConnectionState};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::AppError;
use crate::ingest::{IngestConfig, IngestService, IngestStats};
use crate::model::tick::Tick;

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub feed: NormalizerStats,
    pub ingest: IngestStats,
    pub writer: WriterStats,
}

pub struct LivePipeline {
    client: BinanceWsClient,
    ingest: IngestConfig,
    retry: RetryPolicy,
    channel_capacity: usize,
    write_queue_capacity: usize,
    drain_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl LivePipeline {
    pub fn new(
        client: BinanceWsClient,
        ingest: IngestConfig,
        retry: RetryPolicy,
        channel_capacity: usize,
    ) -> Self {
        Self {
            client,
            ingest,
            retry,
            channel_capacity: channel_capacity.max(1),
            write_queue_capacity: 1024,
            drain_timeout: Duration::from_secs(10),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let client = BinanceWsClient::new(
            &config.feed.ws_url,
            &config.feed.stream,
            config.reconnect_policy(),
        )
        .with_healthy_after(Duration::from_millis(config.reconnect.healthy_after_ms))
        .with_stats_interval(Duration::from_secs(config.ingest.stats_interval_secs.max(1)));
        Self::new(
            client,
            config.ingest_config(),
            config.retry_policy(),
            config.feed.channel_capacity,
        )
        .with_write_queue(
            config.storage.write_queue_capacity,
            Duration::from_millis(config.storage.shutdown_drain_ms),
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound the writer queue and the time the writer may spend on it once
    /// the feed has stopped.
    pub fn with_write_queue(mut self, capacity: usize, drain_timeout: Duration) -> Self {
        self.write_queue_capacity = capacity.max(1);
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.client.state()
    }

    /// Run until `shutdown` flips or the feed fails for good.
    ///
    /// Either way the ingest actor drains every pending window before this
    /// returns. The writer then gets the drain timeout to empty its queue;
    /// anything it cannot write by then is dropped and counted. The store is
    /// handed back alongside the stats. A fatal feed error is returned after
    /// the drain.
    pub async fn run(
        self,
        store: BarStore,
        symbols: watch::Receiver<Vec<String>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(BarStore, PipelineStats), AppError> {
        let (tick_tx, tick_rx) = mpsc::channel::<Vec<Tick>>(self.channel_capacity);
        let (write_tx, write_rx) = mpsc::channel(self.write_queue_capacity);
        let (deadline_tx, deadline_rx) = watch::channel(None::<Instant>);

        let writer = spawn_writer(PersistenceGateway::new(store, self.retry), write_rx, deadline_rx);
        let ingest = tokio::spawn(IngestService::new(self.ingest, self.clock, write_tx).run(tick_rx));

        // tick_tx moves into the feed loop and is dropped when it returns.
        let feed = self.client.connect_and_run(tick_tx, symbols, shutdown).await;
        let _ = deadline_tx.send(Instant::now().checked_add(self.drain_timeout));

        let ingest_stats = ingest.await?;
        let gateway = writer.await?;
        let writer_stats = gateway.stats();
        let feed_stats = feed?;

        Ok((
            gateway.into_sink(),
            PipelineStats {
                feed: feed_stats,
                ingest: ingest_stats,
                writer: writer_stats,
            },
        ))
    }
}
