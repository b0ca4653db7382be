//! Engine actor commands, errors, and events.
//!
//! - `EngineCommand`: messages sent to the actor
//! - `EngineError`: errors surfaced by the handle
//! - `EngineEvent`: change notifications published to subscribers

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use callwatch_core::{AgentInfo, EngineStatus, Extension, HistoryRecord, LeadIdentity, PeerView};
use callwatch_protocol::AmiEvent;

// ============================================================================
// Engine Commands
// ============================================================================

/// Commands sent to the engine actor.
///
/// Link and protocol commands carry the id of the PBX session that produced
/// them; the actor drops anything from a session other than the current one.
#[derive(Debug)]
pub enum EngineCommand {
    /// A new TCP session to the PBX was opened.
    LinkUp { connection_id: u64 },

    /// The PBX accepted the login.
    Authenticated { connection_id: u64 },

    /// The PBX rejected the login.
    AuthFailed {
        connection_id: u64,
        message: String,
    },

    /// The session ended (closed, timed out, or shut down).
    LinkDown {
        connection_id: u64,
        reason: String,
    },

    /// A decoded PBX event.
    Protocol {
        connection_id: u64,
        event: Box<AmiEvent>,
    },

    /// A channel poll is about to be issued.
    BeginReconciliation { connection_id: u64 },

    /// Replace the agent directory wholesale.
    ReplaceDirectory {
        agents: HashMap<Extension, AgentInfo>,
    },

    /// Merge completed-call records into the history.
    ///
    /// Records are expected to carry their lead already; agent names are
    /// filled in from the directory on insert.
    MergeHistory { records: Vec<HistoryRecord> },

    /// Report whether CDR ingestion is running.
    SetCdrEnabled { enabled: bool },

    /// Results of a lead enrichment pass over the live peers.
    ApplyLeads { matches: Vec<LeadMatch> },

    /// Snapshot of all peers, sorted for display.
    GetPeers {
        respond_to: oneshot::Sender<Vec<PeerView>>,
    },

    /// The merged history, newest first.
    GetHistory {
        respond_to: oneshot::Sender<Vec<HistoryRecord>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<EngineStatus>,
    },
}

/// A lead resolved for the counterpart of a peer's current call.
#[derive(Debug, Clone)]
pub struct LeadMatch {
    pub extension: Extension,
    /// Counterpart number the lookup was made for
    pub counterpart: String,
    pub lead: Option<LeadIdentity>,
}

// ============================================================================
// Engine Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The actor has shut down.
    #[error("engine channel closed")]
    ChannelClosed,
}

// ============================================================================
// Engine Events
// ============================================================================

/// Change notifications published by the actor.
///
/// Snapshots are shared behind an `Arc` so every subscriber serializes the
/// same allocation.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PeersChanged(Arc<Vec<PeerView>>),
    HistoryChanged(Arc<Vec<HistoryRecord>>),
    StatusChanged(EngineStatus),
}
