use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use laneclock_core::ConnectionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::server::GatewayInput;

/// A live WebSocket link as the transport sees it.
pub struct Connection {
    tx: mpsc::Sender<String>,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of every open connection and its outbound queue.
///
/// Removing a connection drops its sender, which ends its writer task and
/// with it the socket.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return its ID + outbound receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.connections.insert(id.clone(), Connection::new(tx));
        (id, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) -> bool {
        self.connections.remove(id).is_some()
    }

    pub fn record_pong(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            conn.record_pong();
        }
    }

    /// Queue a message for one connection. Dropped if its queue is full.
    pub fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        let Some(conn) = self.connections.get(id) else {
            return false;
        };
        match conn.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a message for every connection. Returns how many accepted it.
    pub fn broadcast(&self, message: &str) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            match entry.value().tx.try_send(message.to_string()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(connection_id = %entry.key(), "Send queue full, dropping broadcast");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Remove connections that haven't answered a ping within `timeout`.
    pub fn cleanup_dead_connections(&self, timeout: Duration) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(connection_id = %id, "Cleaned up dead connection");
        }
        dead.len()
    }

    #[cfg(test)]
    fn backdate_pong(&self, id: &ConnectionId, secs: u64) {
        if let Some(conn) = self.connections.get(id) {
            conn.last_pong.store(now_secs().saturating_sub(secs), Ordering::Relaxed);
        }
    }
}

/// Pump one WebSocket until either side closes, then report the disconnect.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    inbound: mpsc::Sender<GatewayInput>,
    heartbeat_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_cid, "Sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_cid = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader_inbound = inbound.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let input = GatewayInput::Frame {
                        from: reader_cid.clone(),
                        raw: text.to_string(),
                    };
                    if reader_inbound.send(input).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    registry.unregister(&connection_id);
    let _ = inbound
        .send(GatewayInput::Disconnected {
            connection: connection_id,
        })
        .await;
}

/// Periodically drop connections whose heartbeat has lapsed.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead_connections(timeout);
                    if removed > 0 {
                        tracing::info!(removed, "Dead connection cleanup");
                    }
                }
            }
        }
    })
}
