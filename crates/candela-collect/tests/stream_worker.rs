//! End-to-end worker test against a local WebSocket server.

use std::collections::BTreeSet;
use std::time::Duration;

use candela_collect::{ConnectionStatus, StreamWorker, WorkerConfig};
use candela_process::{bounded, PipelineMetrics};
use candela_types::{CandleSource, Timeframe};
use futures::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

const ACK: &str =
    r#"{"event":"subscribe","arg":{"channel":"candle5m","instId":"BTC-USDT-SWAP"}}"#;
const PUSH: &str = r#"{
    "arg": {"channel":"candle5m","instId":"BTC-USDT-SWAP"},
    "data": [["1704067500000","42000","42100","41950","42050","12.5","525600","525600","0"]]
}"#;

#[tokio::test]
async fn worker_subscribes_and_forwards_candles() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let request = ws.next().await.unwrap().unwrap().into_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&request).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0]["channel"], "candle5m");
        assert_eq!(value["args"][0]["instId"], "BTC-USDT-SWAP");

        ws.send(Message::Text(ACK.to_string())).await.unwrap();
        ws.send(Message::Text(PUSH.to_string())).await.unwrap();

        // Stay up until the client closes.
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let (queue_tx, mut queue_rx) = bounded(16);
    let (status_tx, _status_rx) = mpsc::channel::<ConnectionStatus>(64);
    let metrics = PipelineMetrics::shared();
    let timeframes: BTreeSet<Timeframe> = [Timeframe::Minute5].into_iter().collect();
    let config = WorkerConfig {
        ws_url: format!("ws://{addr}"),
        ..WorkerConfig::default()
    };
    let worker = StreamWorker::new(
        "BTC-USDT-SWAP".to_string(),
        timeframes,
        config,
        queue_tx,
        metrics.clone(),
        status_tx,
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(worker.run(stop_rx));

    let item = tokio::time::timeout(Duration::from_secs(5), queue_rx.recv())
        .await
        .expect("timed out waiting for candle")
        .expect("queue closed");
    assert_eq!(item.candle.symbol, "BTC-USDT-SWAP");
    assert_eq!(item.candle.timeframe, Timeframe::Minute5);
    assert_eq!(item.candle.ts, 1_704_067_500_000);
    assert_eq!(item.candle.close, dec!(42050));
    assert_eq!(item.candle.source, CandleSource::Stream);
    assert!(!item.candle.confirmed);
    assert_eq!(item.attempts, 0);
    assert_eq!(metrics.snapshot().received, 1);

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("worker did not stop")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap();
}

#[tokio::test]
async fn worker_drops_malformed_frames_and_keeps_streaming() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = ws.next().await;

        ws.send(Message::Text("this is not json".to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(PUSH.to_string())).await.unwrap();

        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let (queue_tx, mut queue_rx) = bounded(16);
    let (status_tx, _status_rx) = mpsc::channel::<ConnectionStatus>(64);
    let timeframes: BTreeSet<Timeframe> = [Timeframe::Minute5].into_iter().collect();
    let config = WorkerConfig {
        ws_url: format!("ws://{addr}"),
        ..WorkerConfig::default()
    };
    let worker = StreamWorker::new(
        "BTC-USDT-SWAP".to_string(),
        timeframes,
        config,
        queue_tx,
        PipelineMetrics::shared(),
        status_tx,
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(worker.run(stop_rx));

    // The garbage frame is dropped; the valid one still arrives.
    let item = tokio::time::timeout(Duration::from_secs(5), queue_rx.recv())
        .await
        .expect("timed out waiting for candle")
        .expect("queue closed");
    assert_eq!(item.candle.ts, 1_704_067_500_000);

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("worker did not stop")
        .unwrap();
    server.abort();
}
