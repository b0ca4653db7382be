//! Client interface for interacting with the EngineActor.
//!
//! The `EngineHandle` is cheap to clone and shared by the connection
//! manager, the CDR ingester, the directory refresher and the socket server.
//!
//! # Panic-Free Guarantees
//!
//! Channel errors are mapped to `EngineError::ChannelClosed`; read-only
//! getters fall back to empty values when the actor is gone.

use tokio::sync::{broadcast, mpsc, oneshot};

use callwatch_core::{EngineStatus, HistoryRecord, PeerView};
use callwatch_protocol::AmiEvent;

use super::commands::{EngineCommand, EngineError, EngineEvent};
use crate::directory::AgentDirectory;

#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
    event_sender: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub fn new(
        sender: mpsc::Sender<EngineCommand>,
        event_sender: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    async fn send(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    // ------------------------------------------------------------------------
    // PBX link
    // ------------------------------------------------------------------------

    /// Announces a new PBX session. Events tagged with older ids are dropped
    /// from now on.
    pub async fn link_up(&self, connection_id: u64) -> Result<(), EngineError> {
        self.send(EngineCommand::LinkUp { connection_id }).await
    }

    pub async fn authenticated(&self, connection_id: u64) -> Result<(), EngineError> {
        self.send(EngineCommand::Authenticated { connection_id }).await
    }

    pub async fn auth_failed(&self, connection_id: u64, message: String) -> Result<(), EngineError> {
        self.send(EngineCommand::AuthFailed {
            connection_id,
            message,
        })
        .await
    }

    pub async fn link_down(&self, connection_id: u64, reason: String) -> Result<(), EngineError> {
        self.send(EngineCommand::LinkDown {
            connection_id,
            reason,
        })
        .await
    }

    pub async fn protocol_event(
        &self,
        connection_id: u64,
        event: AmiEvent,
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::Protocol {
            connection_id,
            event: Box::new(event),
        })
        .await
    }

    /// Starts collecting a fresh channel table for the poll about to be sent.
    pub async fn begin_reconciliation(&self, connection_id: u64) -> Result<(), EngineError> {
        self.send(EngineCommand::BeginReconciliation { connection_id })
            .await
    }

    // ------------------------------------------------------------------------
    // Side sources
    // ------------------------------------------------------------------------

    pub async fn replace_directory(&self, agents: AgentDirectory) -> Result<(), EngineError> {
        self.send(EngineCommand::ReplaceDirectory { agents }).await
    }

    /// Merges already-enriched records into the history.
    pub async fn merge_history(&self, records: Vec<HistoryRecord>) -> Result<(), EngineError> {
        self.send(EngineCommand::MergeHistory { records }).await
    }

    pub async fn set_cdr_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        self.send(EngineCommand::SetCdrEnabled { enabled }).await
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Sorted peer snapshot. Empty if the actor has shut down.
    pub async fn get_peers(&self) -> Vec<PeerView> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(EngineCommand::GetPeers { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Merged history, newest first. Empty if the actor has shut down.
    pub async fn get_history(&self) -> Vec<HistoryRecord> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(EngineCommand::GetHistory { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get_status(&self) -> Result<EngineStatus, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::GetStatus { respond_to: tx })
            .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Subscribe to change notifications.
    ///
    /// Slow receivers may see `RecvError::Lagged`; the next snapshot carries
    /// full state, so skipping is safe.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_sender.subscribe()
    }

    /// Whether the actor is still running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
