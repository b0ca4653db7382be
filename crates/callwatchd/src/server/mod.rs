//! Unix socket server: the broadcast gateway.
//!
//! The server:
//! - Listens on a Unix socket for local clients
//! - Spawns a ConnectionHandler for each client
//! - Pushes every peer, history and status snapshot to subscribers
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  EngineHandle   │
//! │   (per client)  │────▶│  AmiHandle      │
//! └─────────────────┘     └─────────────────┘
//!         ▲
//!         │ EngineEvent (broadcast), one JSON line per snapshot
//! ┌─────────────────┐
//! │   broadcaster   │
//! └─────────────────┘
//! ```
//!
//! Publication is fire-and-forget: a subscriber whose write fails or stalls
//! is dropped and can reconnect for full state.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{
    ConnectionError, ConnectionHandler, Subscriber, SubscriberWriter, SubscribersMap,
    MAX_SUBSCRIBERS,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use callwatch_protocol::DaemonMessage;

use crate::ami::AmiHandle;
use crate::engine::{EngineEvent, EngineHandle};

/// Unix socket server for callwatchd.
///
/// Accepts local clients and pushes engine snapshots to subscribers.
pub struct DaemonServer {
    socket_path: PathBuf,
    engine: EngineHandle,
    /// Absent when the daemon runs without a PBX link (tests)
    ami: Option<AmiHandle>,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
    subscribers: SubscribersMap,
}

impl DaemonServer {
    /// Creates a server that will bind `socket_path` when run.
    ///
    /// Without an `ami` handle, reconnect and poll requests are answered
    /// with an error.
    pub fn new(
        socket_path: impl Into<PathBuf>,
        engine: EngineHandle,
        ami: Option<AmiHandle>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            engine,
            ami,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the server.
    ///
    /// Listens for connections until the cancellation token is triggered.
    /// A stale socket file left by a previous run is replaced.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| ServerError::SocketSetup {
                path: self.socket_path.clone(),
                error: e.to_string(),
            })?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| ServerError::SocketSetup {
                    path: self.socket_path.clone(),
                    error: e.to_string(),
                })?;
            }
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| ServerError::SocketSetup {
                path: self.socket_path.clone(),
                error: e.to_string(),
            })?;

        info!(socket = %self.socket_path.display(), "Daemon server listening");

        self.spawn_event_broadcaster();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Spawns a handler task for one client and drops its subscription
    /// once it disconnects.
    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let engine = self.engine.clone();
        let ami = self.ami.clone();
        let subscribers = Arc::clone(&self.subscribers);

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(
                reader,
                writer,
                engine,
                ami,
                Arc::clone(&subscribers),
                connection_number,
            );

            let client_id = handler.run().await;

            if let Some(id) = client_id {
                let mut subs = subscribers.write().await;
                if subs.remove(&id).is_some() {
                    debug!(client_id = %id, "Removed disconnected subscriber");
                }
            }
        });
    }

    /// Forwards engine snapshots to subscribers until shutdown.
    fn spawn_event_broadcaster(&self) {
        let mut event_rx = self.engine.subscribe();
        let subscribers = Arc::clone(&self.subscribers);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Event broadcaster shutting down");
                        break;
                    }

                    result = event_rx.recv() => {
                        match result {
                            Ok(event) => broadcast_event(&subscribers, &event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Event broadcaster lagged, skipped snapshots");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Returns the number of active subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Drops all subscribers and removes the socket file.
    async fn cleanup(&self) {
        self.subscribers.write().await.clear();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

/// Wraps an engine snapshot in its client message.
fn to_message(event: &EngineEvent) -> DaemonMessage {
    match event {
        EngineEvent::PeersChanged(peers) => DaemonMessage::peer_snapshot(peers.as_ref().clone()),
        EngineEvent::HistoryChanged(records) => {
            DaemonMessage::call_history(records.as_ref().clone())
        }
        EngineEvent::StatusChanged(status) => DaemonMessage::status(status.clone()),
    }
}

/// Sends one snapshot to every subscriber of its topic.
async fn broadcast_event(subscribers: &SubscribersMap, event: &EngineEvent) {
    let msg = to_message(event);
    let Some(topic) = msg.topic() else {
        return;
    };

    let json = match serde_json::to_string(&msg) {
        Ok(j) => j,
        Err(e) => {
            error!(error = %e, "Failed to serialize snapshot");
            return;
        }
    };

    let subs = subscribers.read().await;
    let mut failed_clients = Vec::new();

    for (client_id, sub) in subs.iter() {
        if !sub.topics.contains(&topic) {
            continue;
        }

        let mut writer = sub.writer.lock().await;
        let send_result = timeout(connection::WRITE_TIMEOUT, async {
            use tokio::io::AsyncWriteExt;
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await;

        match send_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(client_id = %client_id, error = %e, "Failed to push snapshot");
                failed_clients.push(client_id.clone());
            }
            Err(_) => {
                debug!(client_id = %client_id, "Subscriber too slow, dropping");
                failed_clients.push(client_id.clone());
            }
        }
    }

    drop(subs);

    if !failed_clients.is_empty() {
        let mut subs = subscribers.write().await;
        for client_id in failed_clients {
            subs.remove(&client_id);
            debug!(client_id = %client_id, "Removed failed subscriber");
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
