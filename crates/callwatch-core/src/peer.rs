//! Peer state machine and the snapshot view handed to consumers.
//!
//! # State Model
//!
//! ```text
//!                register                 new channel / dial
//!   offline ─────────────▶ free ─────────────────────────▶ calling
//! (unavailable)             ▲                                 │ up / bridge
//!        ▲                  │ last channel hung up            ▼
//!        │                  └────────────────────────────── talking
//!        └──── unregistered / unreachable (from any state) ────┘
//! ```
//!
//! All call-specific fields live in one [`ActiveCall`] value. A peer that is
//! `calling` or `talking` always holds one; returning to `free` or going
//! offline drops it as a whole, so consumers never observe a partially
//! cleared call.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::extension::Extension;
use crate::history::{parse_hms, CallDirection};
use crate::identity::{AgentInfo, LeadIdentity};

// ============================================================================
// States
// ============================================================================

/// SIP registration state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Online,
    #[default]
    Offline,
}

impl RegistrationState {
    /// Maps a PBX status string to a registration state.
    ///
    /// `OK (12 ms)`, `Registered`, `Reachable` and `Lagged` are online;
    /// anything else (`UNKNOWN`, `UNREACHABLE`, `Unregistered`) is offline.
    pub fn from_status(status: &str) -> Self {
        let status = status.trim();
        let online = status.starts_with("OK")
            || ["registered", "reachable", "lagged"]
                .iter()
                .any(|s| status.eq_ignore_ascii_case(s));
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

/// Call activity of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Free,
    /// Ringing or dialing, not yet answered
    Calling,
    /// Answered and bridged
    Talking,
    #[default]
    Unavailable,
}

impl CallState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Calling => "calling",
            Self::Talking => "talking",
            Self::Unavailable => "unavailable",
        }
    }

    /// Returns true for `calling` and `talking`.
    #[must_use]
    pub fn is_in_call(&self) -> bool {
        matches!(self, Self::Calling | Self::Talking)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Active Call
// ============================================================================

/// Call-specific data carried while a peer is in a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCall {
    /// Channel currently driving the peer's state (never empty)
    pub channel: String,
    pub caller_id_num: Option<String>,
    pub caller_id_name: Option<String>,
    /// Number of the party the peer is bridged with
    pub talking_to: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set on the first transition to `talking`
    pub answered_at: Option<DateTime<Utc>>,
    pub direction: CallDirection,
    pub lead: Option<LeadIdentity>,
}

impl ActiveCall {
    fn new(channel: &str, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            channel: channel.to_string(),
            caller_id_num: None,
            caller_id_name: None,
            talking_to: None,
            started_at,
            answered_at: None,
            direction: CallDirection::Unknown,
            lead: None,
        }
    }

    /// Number of the other party: the bridged number, else the caller id.
    pub fn counterpart(&self) -> Option<&str> {
        self.talking_to
            .as_deref()
            .or(self.caller_id_num.as_deref())
            .filter(|n| !n.is_empty())
    }

    /// Whether the call reached the talking state.
    #[must_use]
    pub fn was_answered(&self) -> bool {
        self.answered_at.is_some()
    }

    fn set_caller(&mut self, num: Option<&str>, name: Option<&str>) {
        let previous = self.counterpart().map(str::to_string);
        if let Some(num) = num.filter(|n| !n.is_empty()) {
            self.caller_id_num = Some(num.to_string());
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            self.caller_id_name = Some(name.to_string());
        }
        if self.counterpart().map(str::to_string) != previous {
            self.lead = None;
        }
    }

    fn set_talking_to(&mut self, num: Option<&str>) {
        let previous = self.counterpart().map(str::to_string);
        if let Some(num) = num.filter(|n| !n.is_empty()) {
            self.talking_to = Some(num.to_string());
        }
        if self.counterpart().map(str::to_string) != previous {
            self.lead = None;
        }
    }
}

// ============================================================================
// Peer
// ============================================================================

/// One known extension and its live state.
///
/// Fields are private; every mutation goes through a method that keeps
/// the registration and call invariants intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    extension: Extension,
    registration: RegistrationState,
    call_state: CallState,
    address: Option<String>,
    port: Option<u16>,
    call: Option<ActiveCall>,
    updated_at: DateTime<Utc>,
}

impl Peer {
    /// Creates an offline peer.
    pub fn new(extension: Extension, now: DateTime<Utc>) -> Self {
        Self {
            extension,
            registration: RegistrationState::Offline,
            call_state: CallState::Unavailable,
            address: None,
            port: None,
            call: None,
            updated_at: now,
        }
    }

    pub fn extension(&self) -> &Extension {
        &self.extension
    }

    pub fn registration(&self) -> RegistrationState {
        self.registration
    }

    pub fn call_state(&self) -> CallState {
        self.call_state
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn call(&self) -> Option<&ActiveCall> {
        self.call.as_ref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.registration == RegistrationState::Online
    }

    #[must_use]
    pub fn is_in_call(&self) -> bool {
        self.call_state.is_in_call()
    }

    /// Checks the peer invariants.
    ///
    /// Offline implies unavailable with no call; calling or talking implies
    /// a call with a non-empty channel; any other state implies no call.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        let offline_ok = self.is_online()
            || (self.call_state == CallState::Unavailable && self.call.is_none());
        let call_ok = match self.call_state {
            CallState::Calling | CallState::Talking => {
                self.call.as_ref().is_some_and(|c| !c.channel.is_empty())
            }
            CallState::Free | CallState::Unavailable => self.call.is_none(),
        };
        offline_ok && call_ok
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Marks the peer registered. An unavailable peer becomes free.
    pub fn set_online(&mut self, address: Option<String>, port: Option<u16>, now: DateTime<Utc>) {
        self.registration = RegistrationState::Online;
        if address.is_some() {
            self.address = address;
        }
        if port.is_some() {
            self.port = port;
        }
        if self.call_state == CallState::Unavailable {
            self.call_state = CallState::Free;
        }
        self.updated_at = now;
    }

    /// Marks the peer unregistered, dropping any call in progress.
    pub fn set_offline(&mut self, now: DateTime<Utc>) {
        self.registration = RegistrationState::Offline;
        self.call_state = CallState::Unavailable;
        self.call = None;
        self.updated_at = now;
    }

    /// Marks a registered peer unavailable (device reported unusable).
    pub fn set_unavailable(&mut self, now: DateTime<Utc>) {
        self.call_state = CallState::Unavailable;
        self.call = None;
        self.updated_at = now;
    }

    // ------------------------------------------------------------------------
    // Call Transitions
    // ------------------------------------------------------------------------

    /// Enters `calling` on `channel`.
    ///
    /// A peer that was idle gets its call-start stamped now. Ignored (returns
    /// false) while offline, and while talking so a second leg ringing in
    /// does not demote the answered call.
    pub fn begin_calling(
        &mut self,
        channel: &str,
        caller_num: Option<&str>,
        caller_name: Option<&str>,
        direction: CallDirection,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.is_online() || channel.is_empty() || self.call_state == CallState::Talking {
            return false;
        }
        let call = self
            .call
            .get_or_insert_with(|| ActiveCall::new(channel, Some(now)));
        call.channel = channel.to_string();
        call.set_caller(caller_num, caller_name);
        if call.direction == CallDirection::Unknown {
            call.direction = direction;
        }
        self.call_state = CallState::Calling;
        self.updated_at = now;
        true
    }

    /// Keeps or enters `calling` because `channel` is ringing.
    pub fn mark_ringing(
        &mut self,
        channel: &str,
        caller_num: Option<&str>,
        caller_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.is_online() || channel.is_empty() {
            return false;
        }
        let call = self.call.get_or_insert_with(|| ActiveCall::new(channel, None));
        call.channel = channel.to_string();
        call.started_at.get_or_insert(now);
        call.set_caller(caller_num, caller_name);
        if self.call_state != CallState::Talking {
            self.call_state = CallState::Calling;
        }
        self.updated_at = now;
        true
    }

    /// Enters `talking` on `channel` with the given counterpart.
    pub fn begin_talking(
        &mut self,
        channel: &str,
        counterpart_num: Option<&str>,
        counterpart_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.is_online() || channel.is_empty() {
            return false;
        }
        let call = self.call.get_or_insert_with(|| ActiveCall::new(channel, None));
        call.channel = channel.to_string();
        call.started_at.get_or_insert(now);
        call.answered_at.get_or_insert(now);
        call.set_talking_to(counterpart_num);
        call.set_caller(counterpart_num, counterpart_name);
        self.call_state = CallState::Talking;
        self.updated_at = now;
        true
    }

    /// Switches the state of an ongoing call without touching its details.
    ///
    /// Returns false when there is no call to switch.
    pub fn set_call_state(&mut self, state: CallState, now: DateTime<Utc>) -> bool {
        if !self.is_online() || !state.is_in_call() {
            return false;
        }
        let Some(call) = self.call.as_mut() else {
            return false;
        };
        if state == CallState::Talking {
            call.answered_at.get_or_insert(now);
        }
        self.call_state = state;
        self.updated_at = now;
        true
    }

    /// Ends the current call and returns its data.
    ///
    /// The peer becomes `free`, or stays `unavailable` while offline.
    pub fn end_call(&mut self, now: DateTime<Utc>) -> Option<ActiveCall> {
        let call = self.call.take();
        self.call_state = if self.is_online() {
            CallState::Free
        } else {
            CallState::Unavailable
        };
        self.updated_at = now;
        call
    }

    /// Overwrites the call state from a reconciliation poll.
    ///
    /// `channel` is the peer's best tracked channel, if any. A peer found in
    /// a call without a stamped start gets one from the channel's reported
    /// elapsed time.
    pub fn reconcile(&mut self, channel: Option<&Channel>, now: DateTime<Utc>) {
        if !self.is_online() {
            self.call_state = CallState::Unavailable;
            self.call = None;
            return;
        }
        let Some(channel) = channel else {
            if self.call.is_some() || self.call_state != CallState::Free {
                self.call = None;
                self.call_state = CallState::Free;
                self.updated_at = now;
            }
            return;
        };

        let started = channel
            .duration
            .as_deref()
            .and_then(|d| parse_hms(d).ok())
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| now - Duration::seconds(secs))
            .unwrap_or(now);

        let call = self
            .call
            .get_or_insert_with(|| ActiveCall::new(&channel.id, None));
        call.channel = channel.id.clone();
        call.started_at.get_or_insert(started);
        call.set_caller(channel.counterpart_num(), channel.counterpart_name());
        call.set_talking_to(channel.connected_line_num.as_deref());
        self.call_state = if channel.is_up() {
            call.answered_at.get_or_insert(started);
            CallState::Talking
        } else {
            CallState::Calling
        };
        self.updated_at = now;
    }

    // ------------------------------------------------------------------------
    // Enrichment
    // ------------------------------------------------------------------------

    /// Attaches a resolved lead to the current call if the counterpart
    /// still matches the number it was resolved for.
    pub fn set_lead(&mut self, counterpart: &str, lead: LeadIdentity) -> bool {
        match self.call.as_mut() {
            Some(call) if call.counterpart() == Some(counterpart) => {
                call.lead = Some(lead);
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// Peer View
// ============================================================================

/// Read-only snapshot of a peer, enriched with its agent identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerView {
    pub extension: Extension,
    pub registration: RegistrationState,
    pub call_state: CallState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id_num: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talking_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<CallDirection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead: Option<LeadIdentity>,
    pub updated_at: DateTime<Utc>,
}

impl PeerView {
    /// Builds a view from a peer and its directory entry.
    pub fn from_peer(peer: &Peer, agent: Option<&AgentInfo>) -> Self {
        let call = peer.call();
        Self {
            extension: peer.extension.clone(),
            registration: peer.registration,
            call_state: peer.call_state,
            address: peer.address.clone(),
            port: peer.port,
            channel: call.map(|c| c.channel.clone()),
            caller_id_num: call.and_then(|c| c.caller_id_num.clone()),
            caller_id_name: call.and_then(|c| c.caller_id_name.clone()),
            talking_to: call.and_then(|c| c.talking_to.clone()),
            call_started_at: call.and_then(|c| c.started_at),
            direction: call.map(|c| c.direction),
            agent: agent.cloned(),
            lead: call.and_then(|c| c.lead.clone()),
            updated_at: peer.updated_at,
        }
    }

    /// Agent name if known, else the extension.
    pub fn display_name(&self) -> &str {
        self.agent
            .as_ref()
            .map(|a| a.display_name.as_str())
            .unwrap_or_else(|| self.extension.as_str())
    }
}

/// Sorts views: online peers first, then by display name in natural order.
pub fn sort_views(views: &mut [PeerView]) {
    views.sort_by(|a, b| {
        let a_online = a.registration == RegistrationState::Online;
        let b_online = b.registration == RegistrationState::Online;
        b_online
            .cmp(&a_online)
            .then_with(|| natural_cmp(a.display_name(), b.display_name()))
            .then_with(|| a.extension.cmp(&b.extension))
    });
}

/// Compares strings treating runs of ASCII digits as numbers ("9" < "10").
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a_chars = a.chars().peekable();
    let mut b_chars = b.chars().peekable();
    loop {
        match (a_chars.peek().copied(), b_chars.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let x_num = take_number(&mut a_chars);
                let y_num = take_number(&mut b_chars);
                let ord = x_num
                    .trim_start_matches('0')
                    .len()
                    .cmp(&y_num.trim_start_matches('0').len())
                    .then_with(|| x_num.trim_start_matches('0').cmp(y_num.trim_start_matches('0')));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                a_chars.next();
                b_chars.next();
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(c);
        chars.next();
    }
    digits
}
