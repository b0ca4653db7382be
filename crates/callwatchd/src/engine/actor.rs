//! Engine actor - owns peer, channel and history state and processes commands.
//!
//! The EngineActor is the single owner of PBX-derived state. The connection
//! manager, the CDR ingester and the directory refresher all post commands
//! to it; nothing else mutates peers, channels or history.
//!
//! Lead lookups never run on the actor task. When a change needs a lookup
//! the actor spawns it, bounded by [`ENRICH_TIMEOUT`], and the result comes
//! back as a command.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply and publish failures are ignored; receivers may have gone away

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use callwatch_core::{CallHistory, EngineStatus, HistoryRecord, DEFAULT_MAX_HISTORY};
use callwatch_protocol::AmiEvent;

use super::commands::{EngineCommand, EngineEvent, LeadMatch};
use super::store::{LeadRequest, PeerStore};
use crate::cdr::record_from_cdr_event;
use crate::directory::AgentDirectory;
use crate::leads::LeadCache;

/// Upper bound on lead lookups made before a broadcast.
pub const ENRICH_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables for the engine actor.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum records kept in the merged history
    pub max_history: usize,
    /// Consecutive rejected logins after which failures log at error level
    pub auth_failure_alert_threshold: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            auth_failure_alert_threshold: 3,
        }
    }
}

// ============================================================================
// Engine Actor
// ============================================================================

pub struct EngineActor {
    receiver: mpsc::Receiver<EngineCommand>,

    /// Used by spawned lookups to post results back. Weak so that the actor
    /// stops once every handle is dropped.
    sender: mpsc::WeakSender<EngineCommand>,

    event_publisher: broadcast::Sender<EngineEvent>,

    store: PeerStore,
    history: CallHistory,
    directory: AgentDirectory,
    leads: Option<LeadCache>,
    status: EngineStatus,
    alert_threshold: u32,
}

impl EngineActor {
    pub fn new(
        receiver: mpsc::Receiver<EngineCommand>,
        sender: mpsc::WeakSender<EngineCommand>,
        event_publisher: broadcast::Sender<EngineEvent>,
        settings: EngineSettings,
        leads: Option<LeadCache>,
    ) -> Self {
        Self {
            receiver,
            sender,
            event_publisher,
            store: PeerStore::new(),
            history: CallHistory::new(settings.max_history),
            directory: AgentDirectory::new(),
            leads,
            status: EngineStatus::default(),
            alert_threshold: settings.auth_failure_alert_threshold,
        }
    }

    /// Processes commands until every sender is dropped.
    pub async fn run(mut self) {
        info!("Engine actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            peers = self.store.peer_count(),
            history = self.history.len(),
            "Engine actor stopped"
        );
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::LinkUp { connection_id } => self.handle_link_up(connection_id),
            EngineCommand::Authenticated { connection_id } => {
                self.handle_authenticated(connection_id)
            }
            EngineCommand::AuthFailed {
                connection_id,
                message,
            } => self.handle_auth_failed(connection_id, &message),
            EngineCommand::LinkDown {
                connection_id,
                reason,
            } => self.handle_link_down(connection_id, &reason),
            EngineCommand::Protocol {
                connection_id,
                event,
            } => self.handle_protocol(connection_id, *event),
            EngineCommand::BeginReconciliation { connection_id } => {
                if self.is_current(connection_id) {
                    self.store.begin_reconciliation();
                }
            }
            EngineCommand::ReplaceDirectory { agents } => self.handle_replace_directory(agents),
            EngineCommand::MergeHistory { records } => self.merge_history(records),
            EngineCommand::SetCdrEnabled { enabled } => {
                if self.status.cdr_enabled != enabled {
                    self.status.cdr_enabled = enabled;
                    self.publish_status();
                }
            }
            EngineCommand::ApplyLeads { matches } => self.handle_apply_leads(matches),
            EngineCommand::GetPeers { respond_to } => {
                let _ = respond_to.send(self.store.views(&self.directory));
            }
            EngineCommand::GetHistory { respond_to } => {
                let _ = respond_to.send(self.history.to_vec());
            }
            EngineCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(self.current_status());
            }
        }
    }

    fn is_current(&self, connection_id: u64) -> bool {
        self.status.connection_id == connection_id
    }

    // ========================================================================
    // Link Lifecycle
    // ========================================================================

    fn handle_link_up(&mut self, connection_id: u64) {
        debug!(connection_id, "PBX link up");
        self.status.connection_id = connection_id;
        self.status.connected = true;
        self.status.authenticated = false;
        self.store.begin_connection();
        self.publish_status();
    }

    fn handle_authenticated(&mut self, connection_id: u64) {
        if !self.is_current(connection_id) {
            return;
        }
        info!(connection_id, "Authenticated with PBX");
        self.status.authenticated = true;
        self.status.auth_failures = 0;
        self.publish_status();
    }

    fn handle_auth_failed(&mut self, connection_id: u64, message: &str) {
        if !self.is_current(connection_id) {
            return;
        }
        self.status.authenticated = false;
        self.status.auth_failures = self.status.auth_failures.saturating_add(1);
        let failures = self.status.auth_failures;
        if failures >= self.alert_threshold {
            error!(
                connection_id,
                failures,
                message = %message,
                "PBX keeps rejecting the login, check the configured credentials"
            );
        } else {
            warn!(connection_id, failures, message = %message, "PBX rejected the login");
        }
        self.publish_status();
    }

    fn handle_link_down(&mut self, connection_id: u64, reason: &str) {
        if !self.is_current(connection_id) {
            return;
        }
        info!(connection_id, reason = %reason, "PBX link down");
        self.status.connected = false;
        self.status.authenticated = false;
        self.publish_status();
    }

    // ========================================================================
    // Protocol Events
    // ========================================================================

    fn handle_protocol(&mut self, connection_id: u64, event: AmiEvent) {
        if !self.is_current(connection_id) {
            trace!(connection_id, event = event.name(), "Dropping event from stale connection");
            return;
        }

        if let AmiEvent::Cdr(cdr) = &event {
            if let Some(record) = record_from_cdr_event(cdr) {
                self.submit_records(vec![record], cdr.caller_id.clone());
            }
            return;
        }

        let applied = self.store.apply(&event, Utc::now());
        if !applied.completed.is_empty() {
            self.submit_records(applied.completed, None);
        }
        if applied.peers_changed {
            self.refresh_peers();
        }
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Merges records now, or after a lead lookup when any record lacks one.
    fn submit_records(&mut self, records: Vec<HistoryRecord>, caller_name: Option<String>) {
        let needs_lookup = records.iter().any(|r| r.lead.is_none() && r.phone.is_some());
        let (Some(leads), true) = (self.leads.clone(), needs_lookup) else {
            self.merge_history(records);
            return;
        };
        let Some(sender) = self.sender.upgrade() else {
            self.merge_history(records);
            return;
        };

        tokio::spawn(async move {
            let mut records = records;
            let lookups = async {
                for record in records.iter_mut().filter(|r| r.lead.is_none()) {
                    record.lead = leads
                        .resolve_caller(record.phone.as_deref(), caller_name.as_deref())
                        .await;
                }
            };
            if tokio::time::timeout(ENRICH_TIMEOUT, lookups).await.is_err() {
                debug!("Lead lookup for history timed out");
            }
            let _ = sender.send(EngineCommand::MergeHistory { records }).await;
        });
    }

    fn merge_history(&mut self, mut records: Vec<HistoryRecord>) {
        for record in records.iter_mut().filter(|r| r.agent_name.is_none()) {
            if let Some(agent) = self.directory.get(&record.extension) {
                record.agent_name = Some(agent.display_name.clone());
                record.agent_id = Some(agent.id.clone());
            }
        }

        let changed = self.history.merge(records);
        if changed > 0 {
            debug!(changed, total = self.history.len(), "History updated");
            self.publish_history();
            self.publish_status();
        }
    }

    // ========================================================================
    // Peers and Enrichment
    // ========================================================================

    /// Publishes the peer list, enriching peers in a call first.
    fn refresh_peers(&mut self) {
        let requests = self.store.lead_requests();
        if requests.is_empty() {
            self.publish_peers();
            return;
        }
        let (Some(leads), Some(sender)) = (self.leads.clone(), self.sender.upgrade()) else {
            self.publish_peers();
            return;
        };

        tokio::spawn(async move {
            let matches = resolve_requests(&leads, requests).await;
            let _ = sender.send(EngineCommand::ApplyLeads { matches }).await;
        });
    }

    /// Attaches resolved leads and publishes. Never starts another lookup.
    fn handle_apply_leads(&mut self, matches: Vec<LeadMatch>) {
        for m in matches {
            if let Some(lead) = m.lead {
                if self.store.apply_lead(&m.extension, &m.counterpart, lead) {
                    trace!(extension = %m.extension, "Lead attached");
                }
            }
        }
        self.publish_peers();
    }

    fn handle_replace_directory(&mut self, agents: AgentDirectory) {
        self.directory = agents;
        let directory = &self.directory;
        self.history.fill_agents(|ext| {
            directory
                .get(ext)
                .map(|a| (a.display_name.clone(), a.id.clone()))
        });
        self.publish_peers();
        self.publish_history();
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    fn current_status(&self) -> EngineStatus {
        EngineStatus {
            peer_count: self.store.peer_count(),
            history_len: self.history.len(),
            ..self.status.clone()
        }
    }

    fn publish_peers(&self) {
        let views = self.store.views(&self.directory);
        let _ = self
            .event_publisher
            .send(EngineEvent::PeersChanged(views.into()));
    }

    fn publish_history(&self) {
        let _ = self
            .event_publisher
            .send(EngineEvent::HistoryChanged(self.history.to_vec().into()));
    }

    fn publish_status(&self) {
        let _ = self
            .event_publisher
            .send(EngineEvent::StatusChanged(self.current_status()));
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &PeerStore {
        &self.store
    }
}

/// Looks up the counterpart of every request, stopping at [`ENRICH_TIMEOUT`].
async fn resolve_requests(leads: &LeadCache, requests: Vec<LeadRequest>) -> Vec<LeadMatch> {
    let mut matches = Vec::with_capacity(requests.len());
    let lookups = async {
        for request in requests {
            let lead = leads
                .resolve_caller(Some(&request.counterpart), request.caller_name.as_deref())
                .await;
            matches.push(LeadMatch {
                extension: request.extension,
                counterpart: request.counterpart,
                lead,
            });
        }
    };
    if tokio::time::timeout(ENRICH_TIMEOUT, lookups).await.is_err() {
        debug!(resolved = matches.len(), "Lead enrichment timed out");
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use callwatch_core::{
        AgentInfo, CallState, Extension, LeadIdentity, PeerView, Provenance,
    };
    use callwatch_protocol::{ChannelEvent, DialEvent};
    use chrono::TimeZone;
    use tokio::sync::oneshot;

    use crate::leads::{LeadError, LeadSource};

    fn create_actor() -> (
        mpsc::Sender<EngineCommand>,
        EngineActor,
        broadcast::Receiver<EngineEvent>,
    ) {
        create_actor_with(None)
    }

    fn create_actor_with(
        leads: Option<LeadCache>,
    ) -> (
        mpsc::Sender<EngineCommand>,
        EngineActor,
        broadcast::Receiver<EngineEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(64);
        let settings = EngineSettings {
            max_history: 10,
            auth_failure_alert_threshold: 2,
        };
        let actor = EngineActor::new(cmd_rx, cmd_tx.downgrade(), event_tx, settings, leads);
        (cmd_tx, actor, event_rx)
    }

    fn protocol(connection_id: u64, event: AmiEvent) -> EngineCommand {
        EngineCommand::Protocol {
            connection_id,
            event: Box::new(event),
        }
    }

    fn peer_online(ext: &str) -> AmiEvent {
        AmiEvent::PeerStatus {
            peer: format!("SIP/{ext}"),
            peer_status: "Registered".to_string(),
            address: Some("10.0.0.5:5060".to_string()),
        }
    }

    fn record(ext: &str, secs: i64, provenance: Provenance) -> HistoryRecord {
        let started = Utc.timestamp_opt(1_714_572_000 + secs, 0).unwrap();
        HistoryRecord::new(provenance, Extension::new(ext), started)
    }

    fn get_status(actor: &mut EngineActor) -> EngineStatus {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(EngineCommand::GetStatus { respond_to: tx });
        rx.try_recv().unwrap()
    }

    fn get_peers(actor: &mut EngineActor) -> Vec<PeerView> {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(EngineCommand::GetPeers { respond_to: tx });
        rx.try_recv().unwrap()
    }

    #[tokio::test]
    async fn test_link_lifecycle_updates_status() {
        let (_tx, mut actor, mut events) = create_actor();

        actor.handle_command(EngineCommand::LinkUp { connection_id: 1 });
        actor.handle_command(EngineCommand::Authenticated { connection_id: 1 });
        let status = get_status(&mut actor);
        assert!(status.is_live());
        assert_eq!(status.connection_id, 1);

        actor.handle_command(EngineCommand::LinkDown {
            connection_id: 1,
            reason: "closed".to_string(),
        });
        assert!(!get_status(&mut actor).connected);

        let mut seen = 0;
        while let Ok(EngineEvent::StatusChanged(_)) = events.try_recv() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_auth_failures_counted_and_reset() {
        let (_tx, mut actor, _events) = create_actor();
        actor.handle_command(EngineCommand::LinkUp { connection_id: 1 });
        for _ in 0..3 {
            actor.handle_command(EngineCommand::AuthFailed {
                connection_id: 1,
                message: "Authentication failed".to_string(),
            });
        }
        assert_eq!(get_status(&mut actor).auth_failures, 3);

        actor.handle_command(EngineCommand::LinkUp { connection_id: 2 });
        actor.handle_command(EngineCommand::Authenticated { connection_id: 2 });
        assert_eq!(get_status(&mut actor).auth_failures, 0);
    }

    #[tokio::test]
    async fn test_stale_connection_events_dropped() {
        let (_tx, mut actor, _events) = create_actor();
        actor.handle_command(EngineCommand::LinkUp { connection_id: 1 });
        actor.handle_command(EngineCommand::LinkUp { connection_id: 2 });

        actor.handle_command(protocol(1, peer_online("602")));
        assert_eq!(actor.store().peer_count(), 0);

        actor.handle_command(EngineCommand::LinkDown {
            connection_id: 1,
            reason: "old".to_string(),
        });
        assert!(get_status(&mut actor).connected);

        actor.handle_command(protocol(2, peer_online("602")));
        assert_eq!(actor.store().peer_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_change_publishes_snapshot_with_agent() {
        let (_tx, mut actor, mut events) = create_actor();
        let mut agents = HashMap::new();
        agents.insert(
            Extension::new("602"),
            AgentInfo {
                id: "a-1".to_string(),
                display_name: "Jane Doe".to_string(),
                code: "0602".to_string(),
            },
        );
        actor.handle_command(EngineCommand::ReplaceDirectory { agents });
        actor.handle_command(EngineCommand::LinkUp { connection_id: 1 });
        actor.handle_command(protocol(1, peer_online("602")));

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::PeersChanged(peers) = event {
                last = Some(peers);
            }
        }
        let peers = last.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].display_name(), "Jane Doe");
    }

    #[tokio::test]
    async fn test_merge_history_fills_agents_and_dedups() {
        let (_tx, mut actor, mut events) = create_actor();
        let mut agents = HashMap::new();
        agents.insert(
            Extension::new("605"),
            AgentInfo {
                id: "a-2".to_string(),
                display_name: "Sam Roe".to_string(),
                code: "605".to_string(),
            },
        );
        actor.handle_command(EngineCommand::ReplaceDirectory { agents });
        while events.try_recv().is_ok() {}

        actor.handle_command(EngineCommand::MergeHistory {
            records: vec![
                record("605", 0, Provenance::Cdr),
                record("605", 0, Provenance::Cdr),
                record("605", 30, Provenance::Cdr),
            ],
        });
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(EngineCommand::GetHistory { respond_to: tx });
        let history = rx.try_recv().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].agent_name.as_deref(), Some("Sam Roe"));
        assert!(matches!(events.try_recv(), Ok(EngineEvent::HistoryChanged(_))));

        // Nothing new, nothing published
        while events.try_recv().is_ok() {}
        actor.handle_command(EngineCommand::MergeHistory {
            records: vec![record("605", 30, Provenance::Cdr)],
        });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_directory_replacement_backfills_history() {
        let (_tx, mut actor, _events) = create_actor();
        actor.handle_command(EngineCommand::MergeHistory {
            records: vec![record("602", 0, Provenance::Event)],
        });
        let mut agents = HashMap::new();
        agents.insert(
            Extension::new("602"),
            AgentInfo {
                id: "a-1".to_string(),
                display_name: "Jane Doe".to_string(),
                code: "602".to_string(),
            },
        );
        actor.handle_command(EngineCommand::ReplaceDirectory { agents });

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(EngineCommand::GetHistory { respond_to: tx });
        let history = rx.try_recv().unwrap();
        assert_eq!(history[0].agent_id.as_deref(), Some("a-1"));
    }

    #[tokio::test]
    async fn test_cdr_enabled_reported_in_status() {
        let (_tx, mut actor, _events) = create_actor();
        actor.handle_command(EngineCommand::SetCdrEnabled { enabled: true });
        assert!(get_status(&mut actor).cdr_enabled);
    }

    struct OneLead;

    #[async_trait]
    impl LeadSource for OneLead {
        async fn find_by_phone(&self, phone: &str) -> Result<Option<LeadIdentity>, LeadError> {
            Ok((phone == "+15551234567").then(|| LeadIdentity {
                id: "l-1".to_string(),
                display_name: "Ann Lee".to_string(),
                email: None,
                phone: Some(phone.to_string()),
                country: None,
            }))
        }

        async fn find_by_phone_suffix(&self, _: &str) -> Result<Option<LeadIdentity>, LeadError> {
            Ok(None)
        }

        async fn find_by_email(&self, _: &str) -> Result<Option<LeadIdentity>, LeadError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_peer_in_call_enriched_before_publish() {
        let cache = LeadCache::new(Arc::new(OneLead), Duration::from_secs(30), 10);
        let (_tx, mut actor, mut events) = create_actor_with(Some(cache));
        actor.handle_command(EngineCommand::LinkUp { connection_id: 1 });
        actor.handle_command(protocol(1, peer_online("602")));
        while events.try_recv().is_ok() {}

        actor.handle_command(protocol(
            1,
            AmiEvent::NewChannel(ChannelEvent {
                channel: "SIP/602-00000001".to_string(),
                state_desc: Some("Ring".to_string()),
                caller_id_num: Some("+15551234567".to_string()),
                ..Default::default()
            }),
        ));
        actor.handle_command(protocol(
            1,
            AmiEvent::DialBegin(DialEvent {
                channel: Some("SIP/gsm1-00000002".to_string()),
                dest_channel: Some("SIP/602-00000001".to_string()),
                caller_id_num: Some("+15551234567".to_string()),
                ..Default::default()
            }),
        ));
        assert!(
            !matches!(events.try_recv(), Ok(EngineEvent::PeersChanged(_))),
            "snapshot must wait for enrichment"
        );

        let cmd = tokio::time::timeout(Duration::from_secs(1), actor.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(cmd, EngineCommand::ApplyLeads { .. }));
        actor.handle_command(cmd);

        let peers = get_peers(&mut actor);
        assert_eq!(peers[0].call_state, CallState::Calling);
        assert_eq!(peers[0].lead.as_ref().map(|l| l.id.as_str()), Some("l-1"));
        assert!(matches!(events.try_recv(), Ok(EngineEvent::PeersChanged(_))));
    }
}
