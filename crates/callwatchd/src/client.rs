//! Request client for the daemon socket.
//!
//! Used by the `callwatchd` CLI subcommands and by tests. Each
//! [`DaemonClient`] owns one connection, performs the handshake on connect,
//! and then sends requests and reads replies in lockstep. Pushed snapshots
//! are read with [`DaemonClient::next_message`] after subscribing.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use callwatch_core::{EngineStatus, HistoryRecord, PeerView};
use callwatch_protocol::{ClientMessage, DaemonMessage, ProtocolVersion, Topic};

/// Time allowed for any single reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {path}: {error}")]
    Connect { path: String, error: std::io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon rejected the connection: {0}")]
    Rejected(String),

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("unexpected reply: {0}")]
    Unexpected(String),

    #[error("daemon closed the connection")]
    Closed,

    #[error("timed out waiting for the daemon")]
    Timeout,
}

pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
}

impl DaemonClient {
    /// Connects and performs the version handshake.
    pub async fn connect(socket_path: &Path, client_id: Option<String>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|error| ClientError::Connect {
                path: socket_path.display().to_string(),
                error,
            })?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
        };

        client.send(&ClientMessage::connect(client_id)).await?;
        match client.next_message().await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::Rejected(format!(
                        "daemon speaks protocol {protocol_version}"
                    )));
                }
                debug!(client_id = %client_id, "Connected to daemon");
                client.client_id = client_id;
                Ok(client)
            }
            DaemonMessage::Rejected { reason, .. } => Err(ClientError::Rejected(reason)),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads the next message, replies and pushed snapshots alike.
    pub async fn next_message(&mut self) -> Result<DaemonMessage, ClientError> {
        let mut line = String::new();
        let read = timeout(REPLY_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| ClientError::Timeout)??;
        if read == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    async fn request(&mut self, message: ClientMessage) -> Result<DaemonMessage, ClientError> {
        self.send(&message).await?;
        match self.next_message().await? {
            DaemonMessage::Error { message, .. } => Err(ClientError::Daemon(message)),
            reply => Ok(reply),
        }
    }

    pub async fn list_peers(&mut self) -> Result<Vec<PeerView>, ClientError> {
        match self.request(ClientMessage::list_peers()).await? {
            DaemonMessage::PeerSnapshot { peers } => Ok(peers),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn history(&mut self, limit: Option<usize>) -> Result<Vec<HistoryRecord>, ClientError> {
        match self.request(ClientMessage::get_history(limit)).await? {
            DaemonMessage::CallHistory { records } => Ok(records),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn status(&mut self) -> Result<EngineStatus, ClientError> {
        match self.request(ClientMessage::get_status()).await? {
            DaemonMessage::Status { status } => Ok(status),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Subscribes; the daemon answers with one snapshot per topic.
    pub async fn subscribe(&mut self, topics: Vec<Topic>) -> Result<(), ClientError> {
        self.send(&ClientMessage::subscribe(topics)).await
    }

    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        self.expect_accepted(ClientMessage::reconnect()).await
    }

    pub async fn poll(&mut self) -> Result<(), ClientError> {
        self.expect_accepted(ClientMessage::poll()).await
    }

    async fn expect_accepted(&mut self, message: ClientMessage) -> Result<(), ClientError> {
        match self.request(message).await? {
            DaemonMessage::Accepted { .. } => Ok(()),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn ping(&mut self, seq: u64) -> Result<(), ClientError> {
        match self.request(ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq: got } if got == seq => Ok(()),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::disconnect()).await
    }
}
