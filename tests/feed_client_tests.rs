use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use tick_rollup::binance::ws::{BinanceWsClient, ConnectionState, ReconnectPolicy};
use tick_rollup::error::AppError;

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_attempts,
    }
}

fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

/// Nothing listens on port 1, so every attempt fails and the client must give up.
#[tokio::test]
async fn unreachable_feed_fails_after_max_attempts() {
    let client = BinanceWsClient::new("ws://127.0.0.1:1/ws", "trade", fast_policy(3))
        .with_connect_timeout(Duration::from_secs(2));
    let state = client.state();
    let (tick_tx, _tick_rx) = mpsc::channel(4);
    let (_symbols_tx, symbols_rx) = watch::channel(symbols(&["BTCUSDT"]));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        client.connect_and_run(tick_tx, symbols_rx, shutdown_rx),
    )
    .await
    .unwrap();

    match result {
        Err(AppError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected ReconnectExhausted, got {:?}", other),
    }
    assert_eq!(*state.borrow(), ConnectionState::Failed);
}

#[tokio::test]
async fn shutdown_during_backoff_terminates_cleanly() {
    let policy = ReconnectPolicy {
        base_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(30),
        max_attempts: 5,
    };
    let client = BinanceWsClient::new("ws://127.0.0.1:1/ws", "trade", policy);
    let mut state = client.state();
    let (tick_tx, _tick_rx) = mpsc::channel(4);
    let (_symbols_tx, symbols_rx) = watch::channel(symbols(&["BTCUSDT"]));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = tokio::spawn(async move { client.connect_and_run(tick_tx, symbols_rx, shutdown_rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if matches!(*state.borrow_and_update(), ConnectionState::ReconnectBackoff { .. }) {
                break;
            }
            state.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    shutdown_tx.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

/// Subscribes per symbol, streams normalized ticks, and re-subscribes in
/// place when the symbol set changes.
#[tokio::test]
async fn subscribes_streams_and_resubscribes_without_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (resubscribed_tx, mut resubscribed_rx) = mpsc::channel::<()>(1);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let mut requests = vec![next_json(&mut ws).await, next_json(&mut ws).await];
        ws.send(Message::Text(json!({"result": null, "id": 1}).to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(
            json!({"e":"trade","E":1,"s":"DOGEUSDT","t":1,"p":"0.1","q":"10","T":1704103205000u64,"m":false})
                .to_string(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text("{not json".to_string())).await.unwrap();
        ws.send(Message::Text(
            json!({"e":"trade","E":1,"s":"BTCUSDT","t":12345,"p":"50000.00","q":"0.100","T":1704103205000u64,"m":false})
                .to_string(),
        ))
        .await
        .unwrap();

        requests.push(next_json(&mut ws).await);
        requests.push(next_json(&mut ws).await);
        resubscribed_tx.send(()).await.unwrap();
        ws.send(Message::Text(
            json!({"stream":"solusdt@trade","data":{"e":"trade","E":1,"s":"SOLUSDT","t":7,"p":"95.5","q":"2","T":1704103206000u64,"m":true}})
                .to_string(),
        ))
        .await
        .unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
        requests
    });

    let client = BinanceWsClient::new(&format!("ws://{}/ws", addr), "trade", fast_policy(2));
    let state = client.state();
    let (tick_tx, mut tick_rx) = mpsc::channel(16);
    let (symbols_tx, symbols_rx) = watch::channel(symbols(&["ethusdt", "BTCUSDT"]));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { client.connect_and_run(tick_tx, symbols_rx, shutdown_rx).await });

    let first = tokio::time::timeout(Duration::from_secs(5), tick_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].symbol, "BTCUSDT");
    assert_eq!(first[0].dedup_key, "12345");
    assert_eq!(first[0].timestamp_ms, 1_704_103_205_000);
    assert_eq!(*state.borrow(), ConnectionState::Streaming);

    symbols_tx.send(symbols(&["BTCUSDT", "SOLUSDT"])).unwrap();
    tokio::time::timeout(Duration::from_secs(5), resubscribed_rx.recv())
        .await
        .unwrap();

    let second = tokio::time::timeout(Duration::from_secs(5), tick_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second[0].symbol, "SOLUSDT");

    shutdown_tx.send(true).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.ticks, 2);
    assert_eq!(stats.out_of_universe, 1);
    assert_eq!(stats.unparseable, 1);
    assert_eq!(stats.acks, 1);
    assert_eq!(*state.borrow(), ConnectionState::Terminated);

    let requests = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        requests,
        vec![
            json!({"method": "SUBSCRIBE", "params": ["btcusdt@trade"], "id": 1}),
            json!({"method": "SUBSCRIBE", "params": ["ethusdt@trade"], "id": 2}),
            json!({"method": "UNSUBSCRIBE", "params": ["ethusdt@trade"], "id": 3}),
            json!({"method": "SUBSCRIBE", "params": ["solusdt@trade"], "id": 4}),
        ]
    );
}

fn trade(id: u64, symbol: &str) -> Message {
    Message::Text(
        json!({"e":"trade","E":1,"s":symbol,"t":id,"p":"100","q":"1","T":1704103205000u64,"m":false}).to_string(),
    )
}

/// A server that streams and then vanishes gets the full subscription set
/// again on the next connection.
#[tokio::test]
async fn reconnect_resends_every_subscription() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut sessions = Vec::new();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        sessions.push(vec![next_json(&mut ws).await, next_json(&mut ws).await]);
        ws.send(trade(1, "BTCUSDT")).await.unwrap();
        // no close frame
        drop(ws);

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        sessions.push(vec![next_json(&mut ws).await, next_json(&mut ws).await]);
        ws.send(trade(2, "ETHUSDT")).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
        sessions
    });

    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(200),
        max_delay: Duration::from_millis(400),
        max_attempts: 3,
    };
    let client = BinanceWsClient::new(&format!("ws://{}/ws", addr), "trade", policy);
    let mut state = client.state();
    let recorder = tokio::spawn(async move {
        let mut seen = vec![*state.borrow_and_update()];
        while state.changed().await.is_ok() {
            let next = *state.borrow_and_update();
            seen.push(next);
            if next == ConnectionState::Terminated {
                break;
            }
        }
        seen
    });

    let (tick_tx, mut tick_rx) = mpsc::channel(16);
    let (_symbols_tx, symbols_rx) = watch::channel(symbols(&["BTCUSDT", "ETHUSDT"]));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { client.connect_and_run(tick_tx, symbols_rx, shutdown_rx).await });

    for expected in ["BTCUSDT", "ETHUSDT"] {
        let batch = tokio::time::timeout(Duration::from_secs(5), tick_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].symbol, expected);
    }

    shutdown_tx.send(true).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.ticks, 2);

    let sessions = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    let subscribe_all = vec![
        json!({"method": "SUBSCRIBE", "params": ["btcusdt@trade"], "id": 1}),
        json!({"method": "SUBSCRIBE", "params": ["ethusdt@trade"], "id": 2}),
    ];
    assert_eq!(sessions, vec![subscribe_all.clone(), subscribe_all]);

    let seen = tokio::time::timeout(Duration::from_secs(5), recorder)
        .await
        .unwrap()
        .unwrap();
    let backoff_at = seen
        .iter()
        .position(|s| *s == ConnectionState::ReconnectBackoff { attempt: 1, delay_ms: 200 })
        .unwrap_or_else(|| panic!("no first backoff in {:?}", seen));
    assert!(
        seen[backoff_at..].contains(&ConnectionState::Streaming),
        "never streamed again: {:?}",
        seen
    );
    assert_eq!(seen.last(), Some(&ConnectionState::Terminated));
}

/// Connections that die right after subscribing never count as healthy, so
/// the retry budget still runs out.
#[tokio::test]
async fn accept_then_drop_server_exhausts_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    let server = tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                let _ = ws.next().await;
            }
        }
    });

    let client = BinanceWsClient::new(&format!("ws://{}/ws", addr), "trade", fast_policy(2))
        .with_healthy_after(Duration::from_secs(30));
    let state = client.state();
    let (tick_tx, _tick_rx) = mpsc::channel(4);
    let (_symbols_tx, symbols_rx) = watch::channel(symbols(&["BTCUSDT"]));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        client.connect_and_run(tick_tx, symbols_rx, shutdown_rx),
    )
    .await
    .unwrap();
    server.abort();

    match result {
        Err(AppError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected ReconnectExhausted, got {:?}", other),
    }
    assert_eq!(*state.borrow(), ConnectionState::Failed);
    assert_eq!(connections.load(Ordering::SeqCst), 3);
}
