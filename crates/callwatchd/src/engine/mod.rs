//! PBX state engine using the actor pattern.
//!
//! The engine owns every piece of PBX-derived state: peers, the channel
//! table and the merged call history. All mutations arrive as commands on
//! one mpsc channel and are applied sequentially, so no locks guard that
//! state.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐
//! │ ConnectionManager │──┐
//! └───────────────────┘  │ EngineCommand      ┌──────────────┐   EngineEvent    ┌──────────────┐
//! ┌───────────────────┐  ├──(mpsc channel)──▶│ EngineActor  │──(broadcast)────▶│ DaemonServer │
//! │   CDR ingestion   │──┤                    └──────────────┘                  └──────────────┘
//! └───────────────────┘  │                      │        ▲
//! ┌───────────────────┐  │                      ▼        │ ApplyLeads / MergeHistory
//! │ Directory refresh │──┘                   lead lookups (spawned)
//! └───────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;
mod store;

pub use actor::{EngineActor, EngineSettings, ENRICH_TIMEOUT};
pub use commands::{EngineCommand, EngineError, EngineEvent, LeadMatch};
pub use handle::EngineHandle;
pub use store::{Applied, DeviceState, LeadRequest, PeerStore};

use crate::leads::LeadCache;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawns the engine actor and returns a handle to it.
///
/// The actor stops once every clone of the handle is dropped.
pub fn spawn_engine(settings: EngineSettings, leads: Option<LeadCache>) -> EngineHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = EngineActor::new(cmd_rx, cmd_tx.downgrade(), event_tx.clone(), settings, leads);
    tokio::spawn(actor.run());

    EngineHandle::new(cmd_tx, event_tx)
}
