//! Per-symbol stream worker: one socket, one task, one failure domain.

use std::collections::BTreeSet;
use std::time::Duration;

use candela_process::{PipelineMetrics, QueueError, QueueItem, QueueSender};
use candela_types::Timeframe;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::message::{parse_frame, subscribe_request, Frame};
use crate::state::{ConnectionState, ConnectionStatus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings shared by every stream worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// WebSocket endpoint for the candle channels.
    pub ws_url: String,
    /// Give up on a dial that has not completed within this long.
    pub connect_timeout: Duration,
    /// Keepalive ping cadence.
    pub ping_interval: Duration,
    /// Reconnect if no frame at all arrives for this long.
    pub idle_timeout: Duration,
    /// Reconnect backoff policy.
    pub backoff: BackoffConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws.okx.com:8443/ws/v5/business".to_string(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

enum SessionEnd {
    /// Shutdown was signalled; do not reconnect.
    Shutdown,
    /// The connection is unusable; reconnect after backoff.
    Reconnect(String),
}

/// Owns one symbol's connection lifecycle: dial, subscribe, stream,
/// back off, repeat. Candles go to the work queue with a non-blocking
/// push; a full queue drops the candle rather than stalling the socket.
#[derive(Debug)]
pub struct StreamWorker {
    symbol: String,
    timeframes: BTreeSet<Timeframe>,
    config: WorkerConfig,
    queue: QueueSender<QueueItem>,
    metrics: Arc<PipelineMetrics>,
    status_tx: mpsc::Sender<ConnectionStatus>,
    status: ConnectionStatus,
    backoff: Backoff,
}

impl StreamWorker {
    /// Creates a worker for one symbol and its timeframe set.
    #[must_use]
    pub fn new(
        symbol: String,
        timeframes: BTreeSet<Timeframe>,
        config: WorkerConfig,
        queue: QueueSender<QueueItem>,
        metrics: Arc<PipelineMetrics>,
        status_tx: mpsc::Sender<ConnectionStatus>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        let status = ConnectionStatus::new(symbol.clone());
        Self {
            symbol,
            timeframes,
            config,
            queue,
            metrics,
            status_tx,
            status,
            backoff,
        }
    }

    /// Runs until shutdown is signalled. Transport failures reconnect with
    /// exponential backoff; a stretch of stable streaming resets the delay.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.transition(ConnectionState::Connecting);
            // The dial races shutdown so unsubscribe never waits on a
            // blackholed endpoint.
            let dial = tokio::time::timeout(
                self.config.connect_timeout,
                connect_async(&self.config.ws_url),
            );
            tokio::select! {
                dialed = dial => match dialed {
                    Ok(Ok((socket, _))) => {
                        let connected = Instant::now();
                        self.status.connected_at = Some(Utc::now());
                        info!(symbol = %self.symbol, "stream connected");
                        let end = self.session(socket, &mut shutdown).await;
                        if connected.elapsed() >= self.backoff.stability_threshold() {
                            self.backoff.reset();
                        }
                        match end {
                            SessionEnd::Shutdown => break,
                            SessionEnd::Reconnect(reason) => {
                                warn!(symbol = %self.symbol, reason, "stream session ended");
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        warn!(symbol = %self.symbol, %err, "stream connect failed");
                    }
                    Err(_) => {
                        warn!(
                            symbol = %self.symbol,
                            timeout_ms = self.config.connect_timeout.as_millis() as u64,
                            "stream connect timed out"
                        );
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.status.connected_at = None;
            self.status.reconnects += 1;
            let delay = self.backoff.next_delay();
            self.transition(ConnectionState::Backoff(delay));
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.transition(ConnectionState::Disconnected);
        debug!(symbol = %self.symbol, "stream worker stopped");
    }

    async fn session(&mut self, mut socket: WsStream, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        for timeframe in &self.timeframes {
            let request = subscribe_request(&self.symbol, *timeframe);
            if let Err(err) = socket.send(Message::Text(request)).await {
                return SessionEnd::Reconnect(format!("subscribe send failed: {err}"));
            }
        }
        self.transition(ConnectionState::Subscribed);

        let mut keepalive = interval(self.config.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.reset();
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                msg = socket.next() => {
                    match msg {
                        Some(Ok(message)) => {
                            last_frame = Instant::now();
                            if let Some(end) = self.handle_message(message, &mut socket).await {
                                return end;
                            }
                        }
                        Some(Err(err)) => {
                            return SessionEnd::Reconnect(format!("socket error: {err}"));
                        }
                        None => return SessionEnd::Reconnect("socket closed".to_string()),
                    }
                }
                _ = keepalive.tick() => {
                    if last_frame.elapsed() > self.config.idle_timeout {
                        return SessionEnd::Reconnect("no frames within idle timeout".to_string());
                    }
                    if let Err(err) = socket.send(Message::Text("ping".to_string())).await {
                        return SessionEnd::Reconnect(format!("ping failed: {err}"));
                    }
                    // Periodic status heartbeat while quiet.
                    self.publish_status();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = socket.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Message, socket: &mut WsStream) -> Option<SessionEnd> {
        match message {
            Message::Text(text) => self.handle_text(&text),
            Message::Binary(bytes) => {
                if let Ok(text) = String::from_utf8(bytes) {
                    self.handle_text(&text)
                } else {
                    self.count_malformed("non-utf8 binary frame");
                    None
                }
            }
            Message::Ping(payload) => {
                if let Err(err) = socket.send(Message::Pong(payload)).await {
                    return Some(SessionEnd::Reconnect(format!("pong failed: {err}")));
                }
                None
            }
            Message::Pong(_) => None,
            Message::Close(frame) => {
                Some(SessionEnd::Reconnect(format!("server close: {frame:?}")))
            }
            Message::Frame(_) => None,
        }
    }

    fn handle_text(&mut self, text: &str) -> Option<SessionEnd> {
        match parse_frame(text) {
            Ok(Frame::Pong) => None,
            Ok(Frame::SubscribeAck { channel, inst_id }) => {
                debug!(symbol = %inst_id, channel, "subscription acknowledged");
                None
            }
            Ok(Frame::Error { code, message }) => {
                warn!(symbol = %self.symbol, code, message, "exchange rejected request");
                None
            }
            Ok(Frame::Candles(candles)) => {
                self.status.last_message_at = Some(Utc::now());
                let entered_streaming = self.status.state != ConnectionState::Streaming;
                for candle in candles {
                    self.status.candles_received += 1;
                    PipelineMetrics::add(&self.metrics.received, 1);
                    match self.queue.try_send(QueueItem::new(candle)) {
                        Ok(()) => {}
                        Err(QueueError::Full(_)) => {
                            self.status.queue_dropped += 1;
                            PipelineMetrics::add(&self.metrics.dropped, 1);
                        }
                        Err(QueueError::Closed(_)) => {
                            return Some(SessionEnd::Shutdown);
                        }
                    }
                }
                if entered_streaming {
                    self.transition(ConnectionState::Streaming);
                }
                None
            }
            Err(err) => {
                self.count_malformed(&err.to_string());
                None
            }
        }
    }

    fn count_malformed(&mut self, reason: &str) {
        self.status.malformed_dropped += 1;
        warn!(symbol = %self.symbol, reason, "dropping malformed frame");
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.status.state != state {
            debug!(symbol = %self.symbol, from = %self.status.state, to = %state, "state change");
            self.status.state = state;
        }
        self.publish_status();
    }

    /// Best-effort status publication; a congested aggregator loses
    /// snapshots, not candles.
    fn publish_status(&self) {
        let _ = self.status_tx.try_send(self.status.clone());
    }
}
