//! PBX management-interface client.
//!
//! The [`ConnectionManager`] keeps one TCP session to the PBX open at a time.
//! Each session gets a fresh connection id, logs in when the banner arrives,
//! and forwards decoded events to the engine tagged with that id. When the
//! session ends for any reason its timers die with it and a new session is
//! attempted after the reconnect delay.
//!
//! ```text
//! connect ─▶ banner ─▶ Login ─▶ accepted ─▶ SIPpeers
//!                          │                  ├─ every heartbeat: Ping
//!                          │                  ├─ after bootstrap delay: CoreShowChannels
//!                          │                  └─ every poll: CoreShowChannels
//!                          └─ rejected ─▶ close ─▶ wait ─▶ connect
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Socket and engine failures end the session with an [`AmiError`]; the
//! manager logs it and reconnects.

mod connection;

pub use connection::{ConnectionManager, SessionEnd};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use callwatch_protocol::ProtocolError;

use crate::config::PbxConfig;
use crate::engine::EngineHandle;

/// Control channel buffer size
const CONTROL_BUFFER: usize = 8;

#[derive(Debug, Error)]
pub enum AmiError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {addr}")]
    ConnectTimeout { addr: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection closed by PBX")]
    Closed,

    #[error("no data from PBX for {secs}s")]
    IdleTimeout { secs: u64 },

    #[error("login rejected: {0}")]
    AuthRejected(String),

    #[error("engine channel closed")]
    EngineClosed,

    #[error("connection manager stopped")]
    ManagerStopped,
}

/// Requests accepted by a running connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmiControl {
    /// Drop the current session and connect again without waiting
    Reconnect,
    /// Run a reconciliation poll now
    Poll,
}

/// Handle for steering the connection manager.
#[derive(Clone)]
pub struct AmiHandle {
    sender: mpsc::Sender<AmiControl>,
}

impl AmiHandle {
    pub fn new(sender: mpsc::Sender<AmiControl>) -> Self {
        Self { sender }
    }

    pub async fn reconnect(&self) -> Result<(), AmiError> {
        self.sender
            .send(AmiControl::Reconnect)
            .await
            .map_err(|_| AmiError::ManagerStopped)
    }

    /// Requests a poll. Ignored while not logged in.
    pub async fn poll(&self) -> Result<(), AmiError> {
        self.sender
            .send(AmiControl::Poll)
            .await
            .map_err(|_| AmiError::ManagerStopped)
    }
}

/// Spawns the connection manager.
pub fn spawn_connection_manager(
    config: PbxConfig,
    engine: EngineHandle,
    cancel: CancellationToken,
) -> (AmiHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CONTROL_BUFFER);
    let manager = ConnectionManager::new(config, engine, rx, cancel);
    let task = tokio::spawn(manager.run());
    (AmiHandle::new(tx), task)
}

