use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};

use super::normalizer::{canonical_symbol, NormalizerStats, TickNormalizer};
use super::types::StreamRequest;
use crate::error::AppError;
use crate::model::tick::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribing,
    Streaming,
    ReconnectBackoff { attempt: u32, delay_ms: u64 },
    Failed,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Reconnect attempts allowed after consecutive failures before giving up.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): `min(base * 2^(attempt - 1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Exponential backoff for reconnection.
#[derive(Debug)]
pub struct ExponentialBackoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failed connection. Returns the wait before the next attempt,
    /// or `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.policy.max_attempts {
            return None;
        }
        Some(self.policy.delay_for_attempt(self.failures))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

fn symbol_set(symbols: &[String]) -> BTreeSet<String> {
    symbols
        .iter()
        .map(|s| canonical_symbol(s))
        .filter(|s| !s.is_empty())
        .collect()
}

pub struct BinanceWsClient {
    url: String,
    stream_kind: String,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    /// Streaming at least this long clears the failure count.
    healthy_after: Duration,
    stats_interval: Duration,
    state_tx: watch::Sender<ConnectionState>,
}

impl BinanceWsClient {
    /// `stream_kind` is the per-symbol stream suffix, e.g. `trade` for `btcusdt@trade`.
    pub fn new(ws_url: &str, stream_kind: &str, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: ws_url.to_string(),
            stream_kind: stream_kind.to_string(),
            policy,
            connect_timeout: Duration::from_secs(10),
            healthy_after: Duration::from_secs(30),
            stats_interval: Duration::from_secs(60),
            state_tx,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_healthy_after(mut self, period: Duration) -> Self {
        self.healthy_after = period;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            tracing::debug!(from = ?prev, to = ?next, "Feed state change");
        }
    }

    fn stream_name(&self, symbol: &str) -> String {
        format!("{}@{}", symbol.to_ascii_lowercase(), self.stream_kind)
    }

    /// Run the feed until shutdown, reconnecting with backoff on transport errors.
    ///
    /// Normalized ticks go to `tick_tx` in per-message batches. The symbol set
    /// is read from `symbols` on every (re)connect and re-subscribed in place
    /// when it changes. Returns `ReconnectExhausted` once the retry budget is
    /// spent. A connection only clears the failure count after streaming for
    /// `healthy_after`, so a server that accepts and then drops at once still
    /// exhausts the budget.
    ///
    /// On shutdown the socket is closed first and `tick_tx` is dropped on
    /// return, which is the ingestion side's signal to drain. Every tick read
    /// before the close is already queued to the ingestion side, so closing
    /// ahead of the final flush loses nothing.
    pub async fn connect_and_run(
        &self,
        tick_tx: mpsc::Sender<Vec<Tick>>,
        mut symbols: watch::Receiver<Vec<String>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<NormalizerStats, AppError> {
        let mut normalizer = TickNormalizer::new(&symbols.borrow());
        let mut backoff = ExponentialBackoff::new(self.policy);
        let mut streaming_since: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                self.set_state(ConnectionState::Terminated);
                return Ok(normalizer.stats());
            }

            let result = self
                .connect_once(
                    &tick_tx,
                    &mut symbols,
                    &mut shutdown,
                    &mut normalizer,
                    &mut streaming_since,
                )
                .await;

            match result {
                Ok(()) => {
                    self.set_state(ConnectionState::Terminated);
                    log_normalizer_stats(&normalizer.stats());
                    tracing::info!("Feed connection closed");
                    return Ok(normalizer.stats());
                }
                Err(e) if !e.is_transient() => {
                    self.set_state(ConnectionState::Failed);
                    tracing::error!(error = %e, "Feed failed with non-retryable error");
                    return Err(e);
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    if let Some(since) = streaming_since.take() {
                        let streamed = since.elapsed();
                        if streamed >= self.healthy_after {
                            backoff.reset();
                        }
                        tracing::warn!(error = %e, streamed_ms = streamed.as_millis() as u64, "Feed connection lost");
                    } else {
                        tracing::warn!(error = %e, "Feed connection lost");
                    }

                    let Some(delay) = backoff.next_delay() else {
                        self.set_state(ConnectionState::Failed);
                        log_normalizer_stats(&normalizer.stats());
                        tracing::error!(
                            attempts = self.policy.max_attempts,
                            error = %e,
                            "Reconnect attempts exhausted"
                        );
                        return Err(AppError::ReconnectExhausted {
                            attempts: self.policy.max_attempts,
                            last_error: e.to_string(),
                        });
                    };

                    let attempt = backoff.failures();
                    let delay_ms = delay.as_millis() as u64;
                    self.set_state(ConnectionState::ReconnectBackoff { attempt, delay_ms });
                    tracing::info!(attempt, delay_ms, "Reconnecting to feed");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.changed() => {
                            tracing::info!("Shutdown during reconnect backoff");
                            self.set_state(ConnectionState::Terminated);
                            return Ok(normalizer.stats());
                        }
                    }
                }
            }
        }
    }

    async fn connect_once(
        &self,
        tick_tx: &mpsc::Sender<Vec<Tick>>,
        symbols: &mut watch::Receiver<Vec<String>>,
        shutdown: &mut watch::Receiver<bool>,
        normalizer: &mut TickNormalizer,
        streaming_since: &mut Option<Instant>,
    ) -> Result<(), AppError> {
        self.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.url, "Connecting to feed");

        let connect = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        );
        let ws_stream = tokio::select! {
            res = connect => match res {
                Ok(Ok((stream, _resp))) => stream,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(AppError::Transport(format!(
                        "connect timed out after {} ms",
                        self.connect_timeout.as_millis()
                    )))
                }
            },
            _ = shutdown.changed() => return Ok(()),
        };
        let (mut write, mut read) = ws_stream.split();

        // Subscriptions do not survive a reconnect; send them again every time.
        self.set_state(ConnectionState::Subscribing);
        let mut request_id: u64 = 0;
        let mut subscribed = symbol_set(&symbols.borrow_and_update());
        let universe: Vec<String> = subscribed.iter().cloned().collect();
        normalizer.set_universe(&universe);
        for symbol in &subscribed {
            request_id += 1;
            send_request(
                &mut write,
                &StreamRequest::subscribe(self.stream_name(symbol), request_id),
            )
            .await?;
        }
        tracing::info!(symbols = subscribed.len(), "Feed subscribed");

        self.set_state(ConnectionState::Streaming);
        *streaming_since = Some(Instant::now());

        let mut stats_timer = tokio::time::interval(self.stats_interval);
        stats_timer.tick().await;
        let mut symbols_open = true;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let ticks = normalizer.normalize(&text);
                            if !ticks.is_empty() && tick_tx.send(ticks).await.is_err() {
                                tracing::warn!("Tick consumer gone, closing feed");
                                self.set_state(ConnectionState::ShuttingDown);
                                close_quietly(&mut write).await;
                                return Ok(());
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(AppError::Transport(format!(
                                "closed by server: {:?}",
                                frame
                            )));
                        }
                        Some(Ok(_)) => {
                            // ping/pong/binary; pongs are answered by tungstenite
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(AppError::Transport("stream ended".to_string())),
                    }
                }
                changed = symbols.changed(), if symbols_open => {
                    if changed.is_err() {
                        symbols_open = false;
                        continue;
                    }
                    let wanted = symbol_set(&symbols.borrow_and_update());
                    self.resubscribe(&mut write, &mut subscribed, wanted, &mut request_id)
                        .await?;
                    let universe: Vec<String> = subscribed.iter().cloned().collect();
                    normalizer.set_universe(&universe);
                }
                _ = stats_timer.tick() => {
                    log_normalizer_stats(&normalizer.stats());
                }
                _ = shutdown.changed() => {
                    self.set_state(ConnectionState::ShuttingDown);
                    close_quietly(&mut write).await;
                    return Ok(());
                }
            }
        }
    }

    async fn resubscribe<S>(
        &self,
        write: &mut S,
        subscribed: &mut BTreeSet<String>,
        wanted: BTreeSet<String>,
        request_id: &mut u64,
    ) -> Result<(), AppError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        for symbol in subscribed.difference(&wanted) {
            *request_id += 1;
            send_request(
                write,
                &StreamRequest::unsubscribe(self.stream_name(symbol), *request_id),
            )
            .await?;
            tracing::info!(symbol = %symbol, "Unsubscribed");
        }
        for symbol in wanted.difference(&*subscribed) {
            *request_id += 1;
            send_request(
                write,
                &StreamRequest::subscribe(self.stream_name(symbol), *request_id),
            )
            .await?;
            tracing::info!(symbol = %symbol, "Subscribed");
        }
        *subscribed = wanted;
        Ok(())
    }
}

async fn send_request<S>(write: &mut S, request: &StreamRequest) -> Result<(), AppError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let payload = serde_json::to_string(request)?;
    write.send(Message::Text(payload)).await?;
    Ok(())
}

async fn close_quietly<S>(write: &mut S)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let _ = write.send(Message::Close(None)).await;
    let _ = write.close().await;
}

fn log_normalizer_stats(stats: &NormalizerStats) {
    tracing::info!(
        messages = stats.messages,
        ticks = stats.ticks,
        unparseable = stats.unparseable,
        unrecognized = stats.unrecognized,
        invalid = stats.invalid_trades,
        out_of_universe = stats.out_of_universe,
        skipped_candles = stats.skipped_candles,
        rejected_acks = stats.rejected_acks,
        "Feed normalizer stats"
    );
}
