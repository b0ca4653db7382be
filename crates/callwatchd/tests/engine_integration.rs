//! Integration tests for the engine actor driven through its public handle.
//!
//! These tests exercise whole call scenarios the way the PBX session and the
//! CDR ingester feed them, and check the snapshots clients would receive.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use tokio::sync::broadcast;

use callwatch_core::{
    AgentInfo, CallDirection, CallState, Disposition, Extension, HistoryRecord, LeadIdentity,
    Provenance, RegistrationState,
};
use callwatch_protocol::{AmiEvent, ChannelEvent, DialEvent};
use callwatchd::cdr::{CdrError, CdrIngester, CdrRow, CdrSource};
use callwatchd::config::CdrConfig;
use callwatchd::engine::{spawn_engine, EngineEvent, EngineHandle, EngineSettings};
use callwatchd::leads::{LeadCache, LeadError, LeadSource};

// ============================================================================
// Helpers
// ============================================================================

const EVENT_WAIT: Duration = Duration::from_secs(2);

fn engine() -> EngineHandle {
    spawn_engine(EngineSettings::default(), None)
}

async fn connected_engine(leads: Option<LeadCache>) -> EngineHandle {
    let engine = spawn_engine(EngineSettings::default(), leads);
    engine.link_up(1).await.unwrap();
    engine.authenticated(1).await.unwrap();
    engine
}

fn peer_entry(name: &str) -> AmiEvent {
    AmiEvent::PeerEntry {
        object_name: name.to_string(),
        status: Some("OK (4 ms)".to_string()),
        ip_address: Some("10.0.0.7".to_string()),
        ip_port: Some(5060),
    }
}

fn channel(name: &str, state: &str, caller: Option<&str>) -> ChannelEvent {
    ChannelEvent {
        channel: name.to_string(),
        state_desc: Some(state.to_string()),
        caller_id_num: caller.map(str::to_string),
        ..Default::default()
    }
}

fn hangup(name: &str, cause: &str) -> AmiEvent {
    AmiEvent::Hangup {
        channel: name.to_string(),
        cause: None,
        cause_txt: Some(cause.to_string()),
    }
}

async fn send_all(engine: &EngineHandle, events: Vec<AmiEvent>) {
    for event in events {
        engine.protocol_event(1, event).await.unwrap();
    }
}

/// Waits for the next peer snapshot matching `pred`.
async fn wait_for_peers<F>(events: &mut broadcast::Receiver<EngineEvent>, pred: F)
where
    F: Fn(&[callwatch_core::PeerView]) -> bool,
{
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            if let Ok(EngineEvent::PeersChanged(peers)) = events.recv().await {
                if pred(&peers) {
                    return;
                }
            }
        }
    })
    .await
    .expect("expected peer snapshot");
}

fn calldate(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn cdr_row(at: NaiveDateTime, src: &str, dst: &str, call_type: &str) -> CdrRow {
    CdrRow {
        calldate: at,
        src: src.to_string(),
        dst: dst.to_string(),
        call_type: call_type.to_string(),
        disposition: "ANSWERED".to_string(),
        duration: 90,
        billsec: 80,
        timestamp_end: None,
    }
}

/// CDR table fake serving fixed pages.
#[derive(Default)]
struct FakeCdr {
    recent: Vec<CdrRow>,
    newer: Vec<CdrRow>,
    newer_calls: AtomicUsize,
}

#[async_trait]
impl CdrSource for FakeCdr {
    async fn recent(&self, _limit: u32) -> Result<Vec<CdrRow>, CdrError> {
        Ok(self.recent.clone())
    }

    async fn newer_than(&self, after: NaiveDateTime, _limit: u32) -> Result<Vec<CdrRow>, CdrError> {
        self.newer_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .newer
            .iter()
            .filter(|row| row.calldate > after)
            .cloned()
            .collect())
    }
}

/// Lead store with one known caller that counts its queries.
#[derive(Default)]
struct CountingLeads {
    queries: AtomicUsize,
    delay: Option<Duration>,
}

#[async_trait]
impl LeadSource for CountingLeads {
    async fn find_by_phone(&self, phone: &str) -> Result<Option<LeadIdentity>, LeadError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok((phone == "+15551234567").then(|| LeadIdentity {
            id: "lead-7".to_string(),
            display_name: "Ann Lee".to_string(),
            email: Some("ann@example.com".to_string()),
            phone: Some(phone.to_string()),
            country: Some("US".to_string()),
        }))
    }

    async fn find_by_phone_suffix(&self, _digits: &str) -> Result<Option<LeadIdentity>, LeadError> {
        Ok(None)
    }

    async fn find_by_email(&self, _email: &str) -> Result<Option<LeadIdentity>, LeadError> {
        Ok(None)
    }
}

// ============================================================================
// Call Scenarios
// ============================================================================

#[tokio::test]
async fn test_incoming_call_lifecycle() {
    let engine = connected_engine(None).await;
    send_all(&engine, vec![peer_entry("602"), AmiEvent::PeerListComplete]).await;

    let peers = engine.get_peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].registration, RegistrationState::Online);
    assert_eq!(peers[0].call_state, CallState::Free);

    send_all(
        &engine,
        vec![AmiEvent::NewChannel(channel(
            "SIP/602-00000001",
            "Ringing",
            Some("+15551234567"),
        ))],
    )
    .await;
    let peers = engine.get_peers().await;
    assert_eq!(peers[0].call_state, CallState::Calling);
    assert_eq!(peers[0].direction, Some(CallDirection::Incoming));
    assert_eq!(peers[0].caller_id_num.as_deref(), Some("+15551234567"));

    send_all(
        &engine,
        vec![AmiEvent::NewState(channel(
            "SIP/602-00000001",
            "Up",
            Some("+15551234567"),
        ))],
    )
    .await;
    assert_eq!(engine.get_peers().await[0].call_state, CallState::Talking);

    send_all(&engine, vec![hangup("SIP/602-00000001", "Normal Clearing")]).await;
    let peers = engine.get_peers().await;
    assert_eq!(peers[0].call_state, CallState::Free);
    assert!(peers[0].channel.is_none());

    let history = engine.get_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].provenance, Provenance::Event);
    assert_eq!(history[0].disposition, Disposition::Answered);
    assert_eq!(history[0].phone.as_deref(), Some("+15551234567"));
}

#[tokio::test]
async fn test_busy_destination_freed_without_record() {
    let engine = connected_engine(None).await;
    send_all(
        &engine,
        vec![
            peer_entry("605"),
            AmiEvent::NewChannel(channel("SIP/605-00000011", "Ring", Some("+442071234567"))),
            AmiEvent::DialBegin(DialEvent {
                channel: Some("SIP/ev1-00000010".to_string()),
                dest_channel: Some("SIP/605-00000011".to_string()),
                caller_id_num: Some("+442071234567".to_string()),
                ..Default::default()
            }),
            AmiEvent::DialEnd(DialEvent {
                channel: Some("SIP/ev1-00000010".to_string()),
                dest_channel: Some("SIP/605-00000011".to_string()),
                dial_status: Some("BUSY".to_string()),
                ..Default::default()
            }),
        ],
    )
    .await;

    let peers = engine.get_peers().await;
    assert_eq!(peers[0].call_state, CallState::Free);
    assert!(engine.get_history().await.is_empty());
}

#[tokio::test]
async fn test_reconciliation_clears_missed_hangup() {
    let engine = connected_engine(None).await;
    send_all(
        &engine,
        vec![
            peer_entry("602"),
            peer_entry("603"),
            AmiEvent::NewChannel(channel("SIP/602-00000001", "Ring", Some("+15550001111"))),
            AmiEvent::NewState(channel("SIP/602-00000001", "Up", Some("+15550001111"))),
        ],
    )
    .await;
    assert_eq!(engine.get_peers().await[0].call_state, CallState::Talking);

    // The hangup was lost; the listing shows only 603 busy
    engine.begin_reconciliation(1).await.unwrap();
    send_all(
        &engine,
        vec![
            AmiEvent::CoreShowChannel(channel("SIP/603-00000009", "Up", Some("+15550002222"))),
            AmiEvent::CoreShowChannelsComplete,
        ],
    )
    .await;

    let peers: HashMap<_, _> = engine
        .get_peers()
        .await
        .into_iter()
        .map(|view| (view.extension.clone(), view))
        .collect();
    assert_eq!(peers[&Extension::new("602")].call_state, CallState::Free);
    assert_eq!(peers[&Extension::new("603")].call_state, CallState::Talking);
}

#[tokio::test]
async fn test_events_from_previous_session_dropped() {
    let engine = connected_engine(None).await;
    send_all(&engine, vec![peer_entry("602")]).await;
    assert!(engine.get_status().await.unwrap().is_live());

    engine.link_down(1, "connection reset".to_string()).await.unwrap();
    let status = engine.get_status().await.unwrap();
    assert!(!status.connected);
    assert!(!status.authenticated);

    engine.link_up(2).await.unwrap();
    engine
        .protocol_event(
            1,
            AmiEvent::NewChannel(channel("SIP/602-00000001", "Ring", Some("+15550001111"))),
        )
        .await
        .unwrap();
    let peers = engine.get_peers().await;
    assert!(peers.iter().all(|p| p.call_state == CallState::Free));
    assert_eq!(engine.get_status().await.unwrap().connection_id, 2);
}

#[tokio::test]
async fn test_snapshots_published_to_subscribers() {
    let engine = connected_engine(None).await;
    let mut events = engine.subscribe();

    send_all(&engine, vec![peer_entry("602")]).await;
    wait_for_peers(&mut events, |peers| peers.len() == 1).await;

    send_all(
        &engine,
        vec![
            AmiEvent::NewChannel(channel("SIP/602-00000001", "Ring", Some("+15550001111"))),
            AmiEvent::NewState(channel("SIP/602-00000001", "Up", Some("+15550001111"))),
        ],
    )
    .await;
    wait_for_peers(&mut events, |peers| peers[0].call_state == CallState::Talking).await;
}

#[tokio::test]
async fn test_directory_names_peers() {
    let engine = connected_engine(None).await;
    send_all(&engine, vec![peer_entry("602")]).await;

    let mut agents = HashMap::new();
    agents.insert(
        Extension::new("602"),
        AgentInfo {
            id: "a-1".to_string(),
            display_name: "Jane Doe".to_string(),
            code: "0602".to_string(),
        },
    );
    engine.replace_directory(agents).await.unwrap();

    let peers = engine.get_peers().await;
    assert_eq!(peers[0].display_name(), "Jane Doe");
    assert_eq!(peers[0].agent.as_ref().map(|a| a.id.as_str()), Some("a-1"));
}

// ============================================================================
// Lead Enrichment
// ============================================================================

#[tokio::test]
async fn test_caller_enriched_with_lead() {
    let source = Arc::new(CountingLeads::default());
    let cache = LeadCache::new(source.clone(), Duration::from_secs(60), 100);
    let engine = connected_engine(Some(cache)).await;
    let mut events = engine.subscribe();

    send_all(
        &engine,
        vec![
            peer_entry("602"),
            AmiEvent::NewChannel(channel("SIP/602-00000001", "Ringing", Some("+15551234567"))),
        ],
    )
    .await;

    wait_for_peers(&mut events, |peers| {
        peers
            .first()
            .and_then(|p| p.lead.as_ref())
            .is_some_and(|lead| lead.id == "lead-7")
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_lookups_share_one_query() {
    let source = Arc::new(CountingLeads {
        delay: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    let cache = LeadCache::new(source.clone(), Duration::from_secs(60), 100);

    let lookups = (0..8).map(|_| {
        let cache = cache.clone();
        tokio::spawn(async move { cache.lookup_phone("+1 (555) 123-4567").await })
    });
    for lookup in futures::future::join_all(lookups).await {
        let lead = lookup.unwrap();
        assert_eq!(lead.map(|l| l.id), Some("lead-7".to_string()));
    }
    assert_eq!(source.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_short_numbers_never_queried() {
    let source = Arc::new(CountingLeads::default());
    let cache = LeadCache::new(source.clone(), Duration::from_secs(60), 100);
    assert!(cache.lookup_phone("123").await.is_none());
    assert_eq!(source.queries.load(Ordering::SeqCst), 0);
}

// ============================================================================
// CDR Merge
// ============================================================================

#[tokio::test]
async fn test_cdr_bootstrap_and_poll() {
    let source = Arc::new(FakeCdr {
        recent: vec![
            cdr_row(calldate(10, 0, 0), "+15551234567", "602", "incoming"),
            // Trunk to trunk, not an agent call
            cdr_row(calldate(10, 1, 0), "+15550000000", "+15559999999", "incoming"),
        ],
        newer: vec![
            cdr_row(calldate(10, 0, 0), "+15551234567", "602", "incoming"),
            cdr_row(calldate(10, 5, 0), "603", "+15557654321", "outgoing"),
        ],
        ..Default::default()
    });
    let engine = engine();
    let mut ingester = CdrIngester::new(source.clone(), None, engine.clone(), &CdrConfig::default());

    assert_eq!(ingester.bootstrap().await.unwrap(), 1);
    assert_eq!(ingester.last_seen(), Some(calldate(10, 1, 0)));

    assert_eq!(ingester.poll_once().await.unwrap(), 1);
    assert_eq!(source.newer_calls.load(Ordering::SeqCst), 1);
    assert_eq!(ingester.last_seen(), Some(calldate(10, 5, 0)));

    let history = engine.get_history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].extension, Extension::new("603"));
    assert_eq!(history[0].direction, CallDirection::Outgoing);
    assert_eq!(history[1].extension, Extension::new("602"));
    assert!(history.iter().all(|r| r.provenance == Provenance::Cdr));
}

#[tokio::test]
async fn test_cdr_row_duplicate_of_event_record_discarded() {
    let engine = engine();
    let started = Utc.from_utc_datetime(&calldate(9, 30, 0));
    let mut event_record =
        HistoryRecord::new(Provenance::Event, Extension::new("602"), started);
    event_record.phone = Some("+15551234567".to_string());
    event_record.disposition = Disposition::Answered;
    engine.merge_history(vec![event_record]).await.unwrap();

    let source = Arc::new(FakeCdr {
        recent: vec![cdr_row(calldate(9, 30, 0), "+15551234567", "602", "incoming")],
        ..Default::default()
    });
    let mut ingester = CdrIngester::new(source, None, engine.clone(), &CdrConfig::default());
    ingester.bootstrap().await.unwrap();

    let history = engine.get_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].provenance, Provenance::Event);
}

#[tokio::test]
async fn test_cdr_records_carry_leads() {
    let leads = LeadCache::new(Arc::new(CountingLeads::default()), Duration::from_secs(60), 10);
    let engine = engine();
    let source = Arc::new(FakeCdr {
        recent: vec![cdr_row(calldate(11, 0, 0), "+15551234567", "602", "incoming")],
        ..Default::default()
    });
    let mut ingester = CdrIngester::new(source, Some(leads), engine.clone(), &CdrConfig::default());
    ingester.bootstrap().await.unwrap();

    let history = engine.get_history().await;
    assert_eq!(
        history[0].lead.as_ref().map(|l| l.display_name.as_str()),
        Some("Ann Lee")
    );
}
