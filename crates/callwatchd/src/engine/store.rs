//! Peer and channel state driven by PBX events.
//!
//! [`PeerStore`] is owned by the engine actor and mutated only from its task.
//! Every handler returns an [`Applied`] summary telling the actor whether the
//! peer list changed and which calls completed.
//!
//! # Channel Reconciliation
//!
//! A poll starts a fresh pending table. Entries from the channel listing go
//! into it, and live channel events are applied to both tables while the poll
//! is outstanding. On the completion event the pending table replaces the
//! live one and every peer is re-derived from it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use callwatch_core::{
    extension_from_channel, extension_from_device, ActiveCall, AgentInfo, CallDirection,
    CallState, Channel, ChannelTable, Disposition, Extension, HistoryRecord, LeadIdentity, Peer,
    PeerView, Provenance, RegistrationState,
};
use callwatch_protocol::{AmiEvent, ChannelEvent, DialEvent};

/// Result of applying one event.
#[derive(Debug, Default)]
pub struct Applied {
    /// Some peer changed and a snapshot should be broadcast
    pub peers_changed: bool,
    /// Calls that ended with this event
    pub completed: Vec<HistoryRecord>,
}

impl Applied {
    fn changed(changed: bool) -> Self {
        Self {
            peers_changed: changed,
            completed: Vec::new(),
        }
    }
}

/// A peer in a call whose counterpart has no lead attached yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadRequest {
    pub extension: Extension,
    pub counterpart: String,
    pub caller_name: Option<String>,
}

/// Device state categories reported by `DeviceStateChange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Ringing,
    InUse,
    Unavailable,
}

impl DeviceState {
    pub fn classify(state: &str) -> Option<Self> {
        let upper = state.trim().to_ascii_uppercase();
        if upper.contains("NOT_INUSE") || upper == "IDLE" {
            Some(Self::Idle)
        } else if upper.contains("RINGING") || upper == "RING" {
            Some(Self::Ringing)
        } else if upper.contains("INUSE") || upper.contains("BUSY") || upper.contains("ONHOLD") {
            Some(Self::InUse)
        } else if upper.contains("UNAVAILABLE") || upper.contains("INVALID") {
            Some(Self::Unavailable)
        } else {
            None
        }
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<Extension, Peer>,
    channels: ChannelTable,
    pending: Option<ChannelTable>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer(&self, extension: &Extension) -> Option<&Peer> {
        self.peers.get(extension)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn is_reconciling(&self) -> bool {
        self.pending.is_some()
    }

    /// Checks every peer invariant.
    pub fn invariants_hold(&self) -> bool {
        self.peers.values().all(Peer::invariants_hold)
    }

    /// Forgets an outstanding poll from a previous connection.
    pub fn begin_connection(&mut self) {
        self.pending = None;
    }

    /// Starts collecting a fresh channel table.
    pub fn begin_reconciliation(&mut self) {
        self.pending = Some(ChannelTable::new());
    }

    /// Sorted snapshot of all peers.
    pub fn views(&self, directory: &HashMap<Extension, AgentInfo>) -> Vec<PeerView> {
        let mut views: Vec<PeerView> = self
            .peers
            .values()
            .map(|p| PeerView::from_peer(p, directory.get(p.extension())))
            .collect();
        callwatch_core::sort_views(&mut views);
        views
    }

    /// Peers in a call that still need a lead lookup.
    pub fn lead_requests(&self) -> Vec<LeadRequest> {
        self.peers
            .values()
            .filter_map(|peer| {
                let call = peer.call()?;
                if call.lead.is_some() {
                    return None;
                }
                Some(LeadRequest {
                    extension: peer.extension().clone(),
                    counterpart: call.counterpart()?.to_string(),
                    caller_name: call.caller_id_name.clone(),
                })
            })
            .collect()
    }

    /// Attaches a resolved lead if the peer is still talking to `counterpart`.
    pub fn apply_lead(&mut self, extension: &Extension, counterpart: &str, lead: LeadIdentity) -> bool {
        self.peers
            .get_mut(extension)
            .is_some_and(|p| p.set_lead(counterpart, lead))
    }

    /// Applies one PBX event.
    pub fn apply(&mut self, event: &AmiEvent, now: DateTime<Utc>) -> Applied {
        match event {
            AmiEvent::PeerEntry {
                object_name,
                status,
                ip_address,
                ip_port,
            } => self.on_peer_entry(object_name, status.as_deref(), ip_address.clone(), *ip_port, now),
            AmiEvent::PeerListComplete => Applied::changed(true),
            AmiEvent::PeerStatus {
                peer,
                peer_status,
                address,
            } => self.on_peer_status(peer, peer_status, address.as_deref(), now),
            AmiEvent::NewChannel(ev) => self.on_new_channel(ev, now),
            AmiEvent::NewState(ev) => self.on_new_state(ev, now),
            AmiEvent::Hangup {
                channel, cause_txt, ..
            } => self.on_hangup(channel, cause_txt.as_deref(), now),
            AmiEvent::DialBegin(dial) => self.on_dial_begin(dial, now),
            AmiEvent::DialEnd(dial) => self.on_dial_end(dial, now),
            AmiEvent::BridgeEnter(ev) => self.on_bridge_enter(ev, now),
            AmiEvent::DeviceStateChange { device, state } => self.on_device_state(device, state, now),
            AmiEvent::CoreShowChannel(ev) => {
                match self.pending.as_mut() {
                    Some(pending) => {
                        pending.insert(ev.to_channel());
                    }
                    None => trace!(channel = %ev.channel, "Channel row outside a listing"),
                }
                Applied::default()
            }
            AmiEvent::CoreShowChannelsComplete => self.on_channels_complete(now),
            AmiEvent::Cdr(_) | AmiEvent::Unknown(_) => Applied::default(),
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    fn peer_mut(&mut self, extension: Extension, now: DateTime<Utc>) -> &mut Peer {
        self.peers
            .entry(extension.clone())
            .or_insert_with(|| Peer::new(extension, now))
    }

    fn on_peer_entry(
        &mut self,
        object_name: &str,
        status: Option<&str>,
        address: Option<String>,
        port: Option<u16>,
        now: DateTime<Utc>,
    ) -> Applied {
        let Some(extension) = extension_from_device(object_name) else {
            trace!(peer = %object_name, "Ignoring trunk peer");
            return Applied::default();
        };
        let online = status.map(RegistrationState::from_status) == Some(RegistrationState::Online);
        let peer = self.peer_mut(extension, now);
        if online {
            peer.set_online(address, port, now);
        } else {
            peer.set_offline(now);
        }
        Applied::changed(true)
    }

    fn on_peer_status(
        &mut self,
        device: &str,
        status: &str,
        address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Applied {
        let Some(extension) = extension_from_device(device) else {
            return Applied::default();
        };
        let (host, port) = split_address(address);
        let peer = self.peer_mut(extension, now);
        match RegistrationState::from_status(status) {
            RegistrationState::Online => peer.set_online(host, port, now),
            RegistrationState::Offline => peer.set_offline(now),
        }
        Applied::changed(true)
    }

    // ------------------------------------------------------------------------
    // Channel Lifecycle
    // ------------------------------------------------------------------------

    /// Adds or merges a channel into the live and pending tables.
    fn track(&mut self, update: Channel) {
        if let Some(pending) = self.pending.as_mut() {
            let merged = merge_channel(pending.get(&update.id), update.clone());
            pending.insert(merged);
        }
        let merged = merge_channel(self.channels.get(&update.id), update);
        self.channels.insert(merged);
    }

    fn untrack(&mut self, channel: &str) -> bool {
        if let Some(pending) = self.pending.as_mut() {
            pending.remove(channel);
        }
        self.channels.remove(channel).is_some()
    }

    fn on_new_channel(&mut self, ev: &ChannelEvent, now: DateTime<Utc>) -> Applied {
        let channel = ev.to_channel();
        let extension = channel.extension.clone();
        self.track(channel);

        let Some(extension) = extension else {
            return Applied::default();
        };
        let Some(peer) = self.peers.get_mut(&extension) else {
            return Applied::default();
        };
        let outgoing = ev.caller_id_num.as_deref() == Some(extension.as_str());
        let (num, name, direction) = if outgoing {
            (
                ev.connected_line_num.as_deref(),
                ev.connected_line_name.as_deref(),
                CallDirection::Outgoing,
            )
        } else {
            (
                ev.caller_id_num.as_deref(),
                ev.caller_id_name.as_deref(),
                CallDirection::Incoming,
            )
        };
        let num = other_party(&extension, num);
        Applied::changed(peer.begin_calling(&ev.channel, num, name, direction, now))
    }

    fn on_new_state(&mut self, ev: &ChannelEvent, now: DateTime<Utc>) -> Applied {
        let channel = ev.to_channel();
        let extension = channel.extension.clone();
        let (up, ringing) = (channel.is_up(), channel.is_ringing());
        self.track(channel);

        let Some(extension) = extension else {
            return Applied::default();
        };
        let Some(peer) = self.peers.get_mut(&extension) else {
            return Applied::default();
        };
        let num = other_party(&extension, ev.connected_line_num.as_deref())
            .or_else(|| other_party(&extension, ev.caller_id_num.as_deref()));
        let name = ev
            .connected_line_name
            .as_deref()
            .or(ev.caller_id_name.as_deref());
        let changed = if up {
            peer.begin_talking(&ev.channel, num, name, now)
        } else if ringing {
            peer.mark_ringing(&ev.channel, num, name, now)
        } else {
            false
        };
        Applied::changed(changed)
    }

    fn on_hangup(&mut self, channel: &str, cause_txt: Option<&str>, now: DateTime<Utc>) -> Applied {
        self.untrack(channel);
        let Some(extension) = extension_from_channel(channel) else {
            return Applied::default();
        };
        let Some(peer) = self.peers.get_mut(&extension) else {
            return Applied::default();
        };

        if let Some(remaining) = self.channels.best_for(&extension) {
            // Another leg keeps the peer busy (transfer, call waiting)
            let was_driving = peer.call().is_some_and(|c| c.channel == channel);
            if was_driving {
                peer.reconcile(Some(remaining), now);
            }
            return Applied::changed(was_driving);
        }

        if peer.call().is_none() {
            return Applied::default();
        }
        let completed = peer
            .end_call(now)
            .and_then(|call| completed_record(&extension, call, cause_txt, now));
        if let Some(record) = &completed {
            debug!(
                extension = %extension,
                disposition = %record.disposition,
                duration = record.duration_secs,
                "Call completed"
            );
        }
        Applied {
            peers_changed: true,
            completed: completed.into_iter().collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Dialing and Bridging
    // ------------------------------------------------------------------------

    fn on_dial_begin(&mut self, dial: &DialEvent, now: DateTime<Utc>) -> Applied {
        let mut changed = false;

        if let Some(dest) = dial.dest_channel.as_deref() {
            if let Some(extension) = extension_from_channel(dest) {
                if self.channels.get(dest).is_none() {
                    self.track(Channel::new(dest, "Ringing"));
                }
                if let Some(peer) = self.peers.get_mut(&extension) {
                    let num = other_party(&extension, dial.caller_id_num.as_deref())
                        .or_else(|| other_party(&extension, dial.connected_line_num.as_deref()));
                    changed |= peer.begin_calling(
                        dest,
                        num,
                        dial.caller_id_name.as_deref(),
                        CallDirection::Incoming,
                        now,
                    );
                }
            }
        }

        if let Some(src) = dial.channel.as_deref() {
            if let Some(extension) = extension_from_channel(src) {
                if self.channels.get(src).is_none() {
                    self.track(Channel::new(src, "Ring"));
                }
                if let Some(peer) = self.peers.get_mut(&extension) {
                    changed |= peer.begin_calling(
                        src,
                        other_party(&extension, dial.dest_caller_id_num.as_deref()),
                        dial.dest_caller_id_name.as_deref(),
                        CallDirection::Outgoing,
                        now,
                    );
                }
            }
        }

        Applied::changed(changed)
    }

    fn on_dial_end(&mut self, dial: &DialEvent, now: DateTime<Utc>) -> Applied {
        if dial.is_answered() {
            return Applied::default();
        }
        let Some(dest) = dial.dest_channel.as_deref() else {
            return Applied::default();
        };
        let Some(extension) = extension_from_channel(dest) else {
            return Applied::default();
        };
        if self.channels.has_other(&extension, dest) {
            return Applied::default();
        }
        self.untrack(dest);
        let Some(peer) = self.peers.get_mut(&extension) else {
            return Applied::default();
        };
        if peer.call().is_none() {
            return Applied::default();
        }
        debug!(
            extension = %extension,
            status = dial.dial_status.as_deref().unwrap_or(""),
            "Dial ended unanswered"
        );
        peer.end_call(now);
        Applied::changed(true)
    }

    fn on_bridge_enter(&mut self, ev: &ChannelEvent, now: DateTime<Utc>) -> Applied {
        let mut channel = ev.to_channel();
        channel.state = "Up".to_string();
        let extension = channel.extension.clone();
        self.track(channel);

        let Some(extension) = extension else {
            return Applied::default();
        };
        let Some(peer) = self.peers.get_mut(&extension) else {
            return Applied::default();
        };
        Applied::changed(peer.begin_talking(
            &ev.channel,
            other_party(&extension, ev.connected_line_num.as_deref()),
            ev.connected_line_name.as_deref(),
            now,
        ))
    }

    fn on_device_state(&mut self, device: &str, state: &str, now: DateTime<Utc>) -> Applied {
        let Some(extension) = extension_from_device(device) else {
            return Applied::default();
        };
        let Some(kind) = DeviceState::classify(state) else {
            trace!(device = %device, state = %state, "Ignoring device state");
            return Applied::default();
        };
        let Some(peer) = self.peers.get_mut(&extension) else {
            return Applied::default();
        };
        if !peer.is_online() {
            return Applied::default();
        }

        let best = self.channels.best_for(&extension);
        let changed = match kind {
            DeviceState::Idle => {
                // A stale idle report must not end a call that still has legs
                let stuck = peer.call().is_some() || peer.call_state() == CallState::Unavailable;
                if best.is_none() && stuck {
                    peer.end_call(now);
                    true
                } else {
                    false
                }
            }
            DeviceState::Ringing => {
                if peer.call().is_some() {
                    peer.set_call_state(CallState::Calling, now)
                } else if let Some(ch) = best {
                    peer.mark_ringing(
                        &ch.id,
                        other_party(&extension, ch.counterpart_num()),
                        ch.counterpart_name(),
                        now,
                    )
                } else {
                    false
                }
            }
            DeviceState::InUse => {
                if peer.call().is_some() {
                    peer.set_call_state(CallState::Talking, now)
                } else if let Some(ch) = best {
                    peer.begin_talking(
                        &ch.id,
                        other_party(&extension, ch.counterpart_num()),
                        ch.counterpart_name(),
                        now,
                    )
                } else {
                    false
                }
            }
            DeviceState::Unavailable => {
                peer.set_unavailable(now);
                true
            }
        };
        Applied::changed(changed)
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    fn on_channels_complete(&mut self, now: DateTime<Utc>) -> Applied {
        let Some(fresh) = self.pending.take() else {
            debug!("Channel listing completed without an outstanding poll");
            return Applied::default();
        };
        debug!(
            previous = self.channels.len(),
            current = fresh.len(),
            "Reconciling peers against channel listing"
        );
        self.channels = fresh;

        for peer in self.peers.values_mut() {
            peer.reconcile(self.channels.best_for(peer.extension()), now);
        }
        Applied::changed(true)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Filters out empty numbers and the peer's own extension.
fn other_party<'a>(extension: &Extension, num: Option<&'a str>) -> Option<&'a str> {
    num.filter(|n| !n.is_empty() && *n != extension.as_str())
}

/// Overlays the fields present in `update` onto an existing entry.
fn merge_channel(existing: Option<&Channel>, update: Channel) -> Channel {
    let Some(existing) = existing else {
        return update;
    };
    let mut merged = existing.clone();
    merged.state = update.state;
    merged.caller_id_num = update.caller_id_num.or(merged.caller_id_num);
    merged.caller_id_name = update.caller_id_name.or(merged.caller_id_name);
    merged.connected_line_num = update.connected_line_num.or(merged.connected_line_num);
    merged.connected_line_name = update.connected_line_name.or(merged.connected_line_name);
    merged.unique_id = update.unique_id.or(merged.unique_id);
    merged.linked_id = update.linked_id.or(merged.linked_id);
    merged.application = update.application.or(merged.application);
    merged.duration = update.duration.or(merged.duration);
    merged
}

/// Splits `10.0.0.2:5060` into host and port.
fn split_address(address: Option<&str>) -> (Option<String>, Option<u16>) {
    let Some(address) = address.map(str::trim).filter(|a| !a.is_empty()) else {
        return (None, None);
    };
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            (Some(host.to_string()), port.parse().ok().filter(|p| *p != 0))
        }
        _ => (Some(address.to_string()), None),
    }
}

fn secs_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_seconds()).unwrap_or(0)
}

/// Builds the event-sourced history record for a finished call.
fn completed_record(
    extension: &Extension,
    call: ActiveCall,
    cause_txt: Option<&str>,
    now: DateTime<Utc>,
) -> Option<HistoryRecord> {
    let started_at = call.started_at?;
    let phone = call.counterpart().map(str::to_string);
    let mut record = HistoryRecord::new(Provenance::Event, extension.clone(), started_at);

    if call.direction == CallDirection::Outgoing {
        record.src = Some(extension.to_string());
        record.dst = phone.clone();
    } else {
        record.src = phone.clone();
        record.dst = Some(extension.to_string());
    }
    record.direction = call.direction.refine_for_counterpart(phone.as_deref());
    record.duration_secs = secs_between(started_at, now);
    match call.answered_at {
        Some(answered) => {
            record.disposition = Disposition::Answered;
            record.billable_secs = record.duration_secs;
            record.answered_at = Some(answered);
        }
        None => {
            record.disposition = Disposition::from_hangup_cause(cause_txt.unwrap_or(""));
        }
    }
    record.ended_at = Some(now);
    record.phone = phone;
    record.lead = call.lead;
    Some(record)
}
