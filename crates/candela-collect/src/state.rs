//! Connection state and the status aggregation task.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Lifecycle of one symbol's stream connection.
///
/// Owned exclusively by the worker task; everyone else sees snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, not trying.
    Disconnected,
    /// Dialing the endpoint.
    Connecting,
    /// Connected, subscriptions issued, waiting for data.
    Subscribed,
    /// Receiving candle data.
    Streaming,
    /// Waiting out a reconnect delay.
    Backoff(Duration),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::Streaming => write!(f, "streaming"),
            Self::Backoff(delay) => write!(f, "backoff({delay:?})"),
        }
    }
}

/// Point-in-time status of one worker, published on every transition and
/// periodically while streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Instrument this worker covers.
    pub symbol: String,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// When the current connection was established.
    pub connected_at: Option<DateTime<Utc>>,
    /// When the last frame of any kind arrived.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Candles forwarded to the work queue.
    pub candles_received: u64,
    /// Malformed frames dropped.
    pub malformed_dropped: u64,
    /// Candles dropped on a full work queue.
    pub queue_dropped: u64,
    /// Reconnects performed since the worker started.
    pub reconnects: u64,
}

impl ConnectionStatus {
    /// Initial status for a worker that has not yet dialed.
    #[must_use]
    pub const fn new(symbol: String) -> Self {
        Self {
            symbol,
            state: ConnectionState::Disconnected,
            connected_at: None,
            last_message_at: None,
            candles_received: 0,
            malformed_dropped: 0,
            queue_dropped: 0,
            reconnects: 0,
        }
    }
}

/// Collects worker status events into one map and republishes snapshots.
///
/// Workers never share mutable state; they each own their counters and
/// send copies here over mpsc.
#[derive(Debug)]
pub struct StatusAggregator {
    rx: mpsc::Receiver<ConnectionStatus>,
    snapshot_tx: watch::Sender<Vec<ConnectionStatus>>,
}

impl StatusAggregator {
    /// Creates the aggregator and the channels feeding it.
    #[must_use]
    pub fn new(
        capacity: usize,
    ) -> (
        mpsc::Sender<ConnectionStatus>,
        watch::Receiver<Vec<ConnectionStatus>>,
        Self,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
        (tx, snapshot_rx, Self { rx, snapshot_tx })
    }

    /// Runs until every worker sender is dropped or shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut statuses: BTreeMap<String, ConnectionStatus> = BTreeMap::new();
        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    let Some(status) = event else { break };
                    debug!(
                        symbol = %status.symbol,
                        state = %status.state,
                        candles = status.candles_received,
                        "worker status"
                    );
                    statuses.insert(status.symbol.clone(), status);
                    let _ = self.snapshot_tx.send(statuses.values().cloned().collect());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let streaming = statuses
            .values()
            .filter(|s| s.state == ConnectionState::Streaming)
            .count();
        info!(workers = statuses.len(), streaming, "status aggregator stopped");
    }
}
