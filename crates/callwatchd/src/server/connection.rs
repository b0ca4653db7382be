//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Answers snapshot queries from the engine
//! - Forwards reconnect/poll requests to the connection manager
//! - Registers the client for pushed snapshots on `subscribe`
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use callwatch_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion, Topic};

use crate::ami::AmiHandle;
use crate::engine::EngineHandle;

/// Write half shared between a handler and the broadcaster
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// A client receiving pushed snapshots.
pub struct Subscriber {
    pub writer: SubscriberWriter,
    pub topics: HashSet<Topic>,
}

/// Subscribers keyed by client id
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Maximum number of concurrent subscribers
pub const MAX_SUBSCRIBERS: usize = 10;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for this connection
type ClientId = String;

/// Serves one client connection.
///
/// Handles the handshake, snapshot queries, control requests and
/// subscription for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,

    /// Shared with the broadcaster once subscribed
    writer: SubscriberWriter,

    engine: EngineHandle,
    ami: Option<AmiHandle>,
    subscribers: SubscribersMap,
    client_id: Option<ClientId>,
    connection_number: u64,
}

impl ConnectionHandler {
    /// Creates a handler for an accepted stream.
    ///
    /// `connection_number` seeds the generated client id when the client
    /// does not supply one.
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        engine: EngineHandle,
        ami: Option<AmiHandle>,
        subscribers: SubscribersMap,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            engine,
            ami,
            subscribers,
            client_id: None,
            connection_number,
        }
    }

    /// Performs the handshake, then serves requests until the client leaves.
    ///
    /// Returns the client id so the server can drop its subscription.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(connection = self.connection_number, error = %e, "Handshake failed");
                return None;
            }
        }

        let client_id = self.client_id.clone();

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    /// Expects a `Connect` message, checks the protocol version, and
    /// answers with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = timeout(READ_TIMEOUT, self.read_message())
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await?;
                Ok(())
            }
            other => {
                self.send_message(DaemonMessage::error(
                    "Expected Connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and serves requests until the client disconnects or an
    /// unrecoverable error occurs.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    // Malformed line: report it and keep the connection
                    let _ = self
                        .send_message(DaemonMessage::error_with_code(&e, "parse_error"))
                        .await;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            match self.handle_message(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(e @ (ConnectionError::Io(_) | ConnectionError::WriteTimeout)) => return Err(e),
                Err(e) => {
                    error!(client_id = ?self.client_id, error = %e, "Error handling message");
                    let _ = self
                        .send_message(DaemonMessage::error(&e.to_string()))
                        .await;
                }
            }
        }
    }

    /// Handles a single client message.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error("Already connected"))
                    .await?;
            }

            MessageType::ListPeers => {
                let peers = self.engine.get_peers().await;
                self.send_message(DaemonMessage::peer_snapshot(peers))
                    .await?;
            }

            MessageType::GetHistory { limit } => {
                let mut records = self.engine.get_history().await;
                if let Some(limit) = limit {
                    records.truncate(limit);
                }
                self.send_message(DaemonMessage::call_history(records))
                    .await?;
            }

            MessageType::GetStatus => {
                let status = self
                    .engine
                    .get_status()
                    .await
                    .map_err(|e| ConnectionError::EngineError(e.to_string()))?;
                self.send_message(DaemonMessage::status(status)).await?;
            }

            MessageType::Subscribe { topics } => self.handle_subscribe(topics).await?,

            MessageType::Unsubscribe => {
                if let Some(ref client_id) = self.client_id {
                    self.subscribers.write().await.remove(client_id);
                }
                debug!(client_id = ?self.client_id, "Client unsubscribed");
            }

            MessageType::Reconnect => {
                let ami = self.ami.as_ref().ok_or(ConnectionError::NoPbxLink)?;
                ami.reconnect()
                    .await
                    .map_err(|e| ConnectionError::EngineError(e.to_string()))?;
                info!(client_id = ?self.client_id, "PBX reconnect requested");
                self.send_message(DaemonMessage::accepted("reconnect"))
                    .await?;
            }

            MessageType::Poll => {
                let ami = self.ami.as_ref().ok_or(ConnectionError::NoPbxLink)?;
                ami.poll()
                    .await
                    .map_err(|e| ConnectionError::EngineError(e.to_string()))?;
                debug!(client_id = ?self.client_id, "Channel poll requested");
                self.send_message(DaemonMessage::accepted("poll")).await?;
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    /// Registers for pushed snapshots and sends the current state of every
    /// requested topic.
    async fn handle_subscribe(&mut self, topics: Vec<Topic>) -> Result<(), ConnectionError> {
        let Some(client_id) = self.client_id.clone() else {
            self.send_message(DaemonMessage::error("Must connect before subscribing"))
                .await?;
            return Ok(());
        };
        let topics: HashSet<Topic> = if topics.is_empty() {
            Topic::ALL.into_iter().collect()
        } else {
            topics.into_iter().collect()
        };

        {
            let mut subs = self.subscribers.write().await;
            if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
                drop(subs);
                self.send_message(DaemonMessage::error_with_code(
                    &format!("Too many subscribers (max: {MAX_SUBSCRIBERS})"),
                    "too_many_subscribers",
                ))
                .await?;
                return Ok(());
            }
            subs.insert(
                client_id.clone(),
                Subscriber {
                    writer: Arc::clone(&self.writer),
                    topics: topics.clone(),
                },
            );
        }

        debug!(client_id = %client_id, topics = ?topics, "Client subscribed");

        for topic in Topic::ALL.into_iter().filter(|t| topics.contains(t)) {
            let msg = match topic {
                Topic::Peers => DaemonMessage::peer_snapshot(self.engine.get_peers().await),
                Topic::History => DaemonMessage::call_history(self.engine.get_history().await),
                Topic::Status => match self.engine.get_status().await {
                    Ok(status) => DaemonMessage::status(status),
                    Err(_) => continue,
                },
            };
            self.send_message(msg).await?;
        }
        Ok(())
    }

    /// Reads one JSON line within the idle timeout and size limit.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    /// Writes one message as a JSON line within the write timeout.
    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(&msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        let mut writer = self.writer.lock().await;

        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Errors that can occur while serving a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Engine error: {0}")]
    EngineError(String),

    #[error("Daemon has no PBX link")]
    NoPbxLink,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
    }
}
