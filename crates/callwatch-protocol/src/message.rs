//! JSON-lines messages between the daemon and local clients.

use callwatch_core::{EngineStatus, HistoryRecord, PeerView};
use serde::{Deserialize, Serialize};

use crate::version::ProtocolVersion;

/// Data streams a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Peers,
    History,
    Status,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Peers, Topic::History, Topic::Status];
}

/// Requests a client can send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake, must be the first message
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Current peer snapshot
    ListPeers,

    /// Current merged history, optionally only the newest `limit` records
    GetHistory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    GetStatus,

    /// Push updates for the given topics (empty means all)
    Subscribe {
        #[serde(default)]
        topics: Vec<Topic>,
    },

    Unsubscribe,

    /// Drop the PBX session and connect again immediately
    Reconnect,

    /// Run a reconciliation poll now
    Poll,

    Ping {
        seq: u64,
    },

    Disconnect,
}

/// Envelope for client requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn list_peers() -> Self {
        Self::new(MessageType::ListPeers)
    }

    pub fn get_history(limit: Option<usize>) -> Self {
        Self::new(MessageType::GetHistory { limit })
    }

    pub fn get_status() -> Self {
        Self::new(MessageType::GetStatus)
    }

    pub fn subscribe(topics: Vec<Topic>) -> Self {
        Self::new(MessageType::Subscribe { topics })
    }

    pub fn reconnect() -> Self {
        Self::new(MessageType::Reconnect)
    }

    pub fn poll() -> Self {
        Self::new(MessageType::Poll)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent by the daemon, as replies or pushed updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Full peer list, online first
    PeerSnapshot { peers: Vec<PeerView> },

    /// Full merged history, newest first
    CallHistory { records: Vec<HistoryRecord> },

    Status { status: EngineStatus },

    /// A command was queued
    Accepted { command: String },

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn peer_snapshot(peers: Vec<PeerView>) -> Self {
        Self::PeerSnapshot { peers }
    }

    pub fn call_history(records: Vec<HistoryRecord>) -> Self {
        Self::CallHistory { records }
    }

    pub fn status(status: EngineStatus) -> Self {
        Self::Status { status }
    }

    pub fn accepted(command: &str) -> Self {
        Self::Accepted {
            command: command.to_string(),
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    /// Topic a pushed message belongs to, if any.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            Self::PeerSnapshot { .. } => Some(Topic::Peers),
            Self::CallHistory { .. } => Some(Topic::History),
            Self::Status { .. } => Some(Topic::Status),
            _ => None,
        }
    }
}
