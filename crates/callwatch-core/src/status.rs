//! Engine connection status exposed to consumers.

use serde::{Deserialize, Serialize};

/// Snapshot of the PBX link and engine counters.
///
/// A disconnected engine still serves its last known peer list; consumers
/// should treat `connected == false` as "peer list may be stale".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// TCP session to the PBX is open
    pub connected: bool,
    /// Login was accepted on the current session
    pub authenticated: bool,
    /// Number of known peers
    pub peer_count: usize,
    /// Number of records in the merged history
    pub history_len: usize,
    /// CDR ingestion is running
    pub cdr_enabled: bool,
    /// Consecutive rejected logins since the last accepted one
    pub auth_failures: u32,
    /// Identifier of the current PBX session (increments on every connect)
    pub connection_id: u64,
}

impl EngineStatus {
    /// Returns true when the engine is receiving live events.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.connected && self.authenticated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_not_live() {
        let status = EngineStatus::default();
        assert!(!status.is_live());
        assert_eq!(status.peer_count, 0);
    }

    #[test]
    fn test_serializes_flags() {
        let status = EngineStatus {
            connected: true,
            authenticated: true,
            peer_count: 3,
            ..Default::default()
        };
        assert!(status.is_live());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["connected"], true);
        assert_eq!(json["peer_count"], 3);
    }
}
