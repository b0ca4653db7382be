//! Typed decoding of inbound PBX messages.
//!
//! Raw [`AmiMessage`]s are classified once, at the parser boundary, into
//! login/command [`Response`]s or named [`AmiEvent`]s carrying only the
//! fields their handlers need. Unknown event names decode to
//! [`AmiEvent::Unknown`] and are ignored downstream.

use callwatch_core::Channel;

use crate::packet::AmiMessage;

/// Message text the PBX sends when a login is accepted.
const AUTH_ACCEPTED: &str = "Authentication accepted";

/// Message text the PBX sends when a login is rejected.
const AUTH_FAILED: &str = "Authentication failed";

// ============================================================================
// Classification
// ============================================================================

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Response(Response),
    Event(AmiEvent),
    /// Neither a response nor an event
    Other,
}

/// Response to a command sent by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    AuthAccepted,
    AuthRejected {
        message: String,
    },
    Success {
        action_id: Option<String>,
        message: Option<String>,
    },
    Error {
        action_id: Option<String>,
        message: String,
    },
}

impl Inbound {
    /// Classifies a parsed message.
    pub fn classify(msg: &AmiMessage) -> Self {
        if let Some(response) = msg.response() {
            let message = msg.get_owned("Message");
            let action_id = msg.get_owned("ActionID");
            let is_auth = |text: &str| {
                message
                    .as_deref()
                    .is_some_and(|m| m.eq_ignore_ascii_case(text))
            };
            let response = if response.eq_ignore_ascii_case("success") {
                if is_auth(AUTH_ACCEPTED) {
                    Response::AuthAccepted
                } else {
                    Response::Success { action_id, message }
                }
            } else if response.eq_ignore_ascii_case("error") {
                if is_auth(AUTH_FAILED) {
                    Response::AuthRejected {
                        message: message.unwrap_or_default(),
                    }
                } else {
                    Response::Error {
                        action_id,
                        message: message.unwrap_or_default(),
                    }
                }
            } else {
                // "Follows", "Goodbye" and list acknowledgements
                Response::Success { action_id, message }
            };
            return Self::Response(response);
        }
        match msg.event_name() {
            Some(_) => Self::Event(AmiEvent::from_message(msg)),
            None => Self::Other,
        }
    }
}

// ============================================================================
// Event Payloads
// ============================================================================

/// Fields shared by channel lifecycle events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelEvent {
    pub channel: String,
    pub state_desc: Option<String>,
    pub caller_id_num: Option<String>,
    pub caller_id_name: Option<String>,
    pub connected_line_num: Option<String>,
    pub connected_line_name: Option<String>,
    pub unique_id: Option<String>,
    pub linked_id: Option<String>,
    pub application: Option<String>,
    pub duration: Option<String>,
}

impl ChannelEvent {
    fn from_message(msg: &AmiMessage) -> Self {
        Self {
            channel: msg.get_owned("Channel").unwrap_or_default(),
            state_desc: msg.get_owned("ChannelStateDesc"),
            caller_id_num: msg.get_owned("CallerIDNum").filter(|v| !is_unknown(v)),
            caller_id_name: msg.get_owned("CallerIDName").filter(|v| !is_unknown(v)),
            connected_line_num: msg.get_owned("ConnectedLineNum").filter(|v| !is_unknown(v)),
            connected_line_name: msg.get_owned("ConnectedLineName").filter(|v| !is_unknown(v)),
            unique_id: msg.get_owned("Uniqueid"),
            linked_id: msg.get_owned("Linkedid"),
            application: msg.get_owned("Application"),
            duration: msg.get_owned("Duration"),
        }
    }

    /// Builds the channel-table entry for this event.
    pub fn to_channel(&self) -> Channel {
        let mut channel = Channel::new(
            self.channel.clone(),
            self.state_desc.clone().unwrap_or_else(|| "Down".to_string()),
        );
        channel.caller_id_num = self.caller_id_num.clone();
        channel.caller_id_name = self.caller_id_name.clone();
        channel.connected_line_num = self.connected_line_num.clone();
        channel.connected_line_name = self.connected_line_name.clone();
        channel.unique_id = self.unique_id.clone();
        channel.linked_id = self.linked_id.clone();
        channel.application = self.application.clone();
        channel.duration = self.duration.clone();
        channel
    }
}

/// The PBX reports missing caller-id as `<unknown>`.
fn is_unknown(value: &str) -> bool {
    value.eq_ignore_ascii_case("<unknown>")
}

/// Fields of `DialBegin` / `DialEnd`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialEvent {
    pub channel: Option<String>,
    pub dest_channel: Option<String>,
    pub caller_id_num: Option<String>,
    pub caller_id_name: Option<String>,
    pub connected_line_num: Option<String>,
    pub connected_line_name: Option<String>,
    pub dest_caller_id_num: Option<String>,
    pub dest_caller_id_name: Option<String>,
    /// Outcome (`ANSWER`, `BUSY`, `NOANSWER`, `CANCEL`, ...); end only
    pub dial_status: Option<String>,
}

impl DialEvent {
    fn from_message(msg: &AmiMessage) -> Self {
        Self {
            channel: msg.get_owned("Channel"),
            dest_channel: msg.get_owned("DestChannel"),
            caller_id_num: msg.get_owned("CallerIDNum").filter(|v| !is_unknown(v)),
            caller_id_name: msg.get_owned("CallerIDName").filter(|v| !is_unknown(v)),
            connected_line_num: msg.get_owned("ConnectedLineNum").filter(|v| !is_unknown(v)),
            connected_line_name: msg.get_owned("ConnectedLineName").filter(|v| !is_unknown(v)),
            dest_caller_id_num: msg.get_owned("DestCallerIDNum").filter(|v| !is_unknown(v)),
            dest_caller_id_name: msg.get_owned("DestCallerIDName").filter(|v| !is_unknown(v)),
            dial_status: msg.get_owned("DialStatus"),
        }
    }

    /// Whether the dial ended in an answer.
    #[must_use]
    pub fn is_answered(&self) -> bool {
        self.dial_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("answer"))
    }
}

/// Fields of a CDR event emitted by the PBX CDR manager backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CdrEvent {
    pub source: Option<String>,
    pub destination: Option<String>,
    pub channel: Option<String>,
    pub destination_channel: Option<String>,
    pub caller_id: Option<String>,
    pub disposition: Option<String>,
    pub duration: u64,
    pub billable_seconds: u64,
    pub start_time: Option<String>,
    pub answer_time: Option<String>,
    pub end_time: Option<String>,
}

impl CdrEvent {
    fn from_message(msg: &AmiMessage) -> Self {
        let secs = |key: &str| {
            msg.get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0)
        };
        Self {
            source: msg.get_owned("Source"),
            destination: msg.get_owned("Destination"),
            channel: msg.get_owned("Channel"),
            destination_channel: msg.get_owned("DestinationChannel"),
            caller_id: msg.get_owned("CallerID"),
            disposition: msg.get_owned("Disposition"),
            duration: secs("Duration"),
            billable_seconds: secs("BillableSeconds"),
            start_time: msg.get_owned("StartTime"),
            answer_time: msg.get_owned("AnswerTime"),
            end_time: msg.get_owned("EndTime"),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Named events the engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmiEvent {
    /// One SIP peer from a `SIPpeers` listing
    PeerEntry {
        object_name: String,
        status: Option<String>,
        ip_address: Option<String>,
        ip_port: Option<u16>,
    },
    PeerListComplete,
    /// Registration change (`Peer: SIP/602`, `PeerStatus: Registered`)
    PeerStatus {
        peer: String,
        peer_status: String,
        address: Option<String>,
    },
    NewChannel(ChannelEvent),
    NewState(ChannelEvent),
    Hangup {
        channel: String,
        cause: Option<String>,
        cause_txt: Option<String>,
    },
    DialBegin(DialEvent),
    DialEnd(DialEvent),
    BridgeEnter(ChannelEvent),
    DeviceStateChange {
        device: String,
        state: String,
    },
    /// One active channel from a `CoreShowChannels` listing
    CoreShowChannel(ChannelEvent),
    CoreShowChannelsComplete,
    Cdr(CdrEvent),
    /// Any event the engine does not handle
    Unknown(String),
}

impl AmiEvent {
    /// Decodes a message carrying an `Event` field.
    pub fn from_message(msg: &AmiMessage) -> Self {
        let name = msg.event_name().unwrap_or_default();
        match name.to_ascii_lowercase().as_str() {
            "peerentry" => {
                let ip_address = msg
                    .get_owned("IPaddress")
                    .filter(|ip| ip != "-none-" && ip != "(null)");
                Self::PeerEntry {
                    object_name: msg.get_owned("ObjectName").unwrap_or_default(),
                    status: msg.get_owned("Status"),
                    ip_port: msg
                        .get("IPport")
                        .and_then(|p| p.parse::<u16>().ok())
                        .filter(|p| *p != 0),
                    ip_address,
                }
            }
            "peerlistcomplete" => Self::PeerListComplete,
            "peerstatus" => Self::PeerStatus {
                peer: msg.get_owned("Peer").unwrap_or_default(),
                peer_status: msg.get_owned("PeerStatus").unwrap_or_default(),
                address: msg.get_owned("Address"),
            },
            "newchannel" => Self::NewChannel(ChannelEvent::from_message(msg)),
            "newstate" => Self::NewState(ChannelEvent::from_message(msg)),
            "hangup" => Self::Hangup {
                channel: msg.get_owned("Channel").unwrap_or_default(),
                cause: msg.get_owned("Cause"),
                cause_txt: msg.get_owned("Cause-txt"),
            },
            "dialbegin" => Self::DialBegin(DialEvent::from_message(msg)),
            "dialend" => Self::DialEnd(DialEvent::from_message(msg)),
            "bridgeenter" => Self::BridgeEnter(ChannelEvent::from_message(msg)),
            "devicestatechange" => Self::DeviceStateChange {
                device: msg.get_owned("Device").unwrap_or_default(),
                state: msg.get_owned("State").unwrap_or_default(),
            },
            "coreshowchannel" => Self::CoreShowChannel(ChannelEvent::from_message(msg)),
            "coreshowchannelscomplete" => Self::CoreShowChannelsComplete,
            "cdr" => Self::Cdr(CdrEvent::from_message(msg)),
            _ => Self::Unknown(name.to_string()),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::PeerEntry { .. } => "PeerEntry",
            Self::PeerListComplete => "PeerlistComplete",
            Self::PeerStatus { .. } => "PeerStatus",
            Self::NewChannel(_) => "Newchannel",
            Self::NewState(_) => "Newstate",
            Self::Hangup { .. } => "Hangup",
            Self::DialBegin(_) => "DialBegin",
            Self::DialEnd(_) => "DialEnd",
            Self::BridgeEnter(_) => "BridgeEnter",
            Self::DeviceStateChange { .. } => "DeviceStateChange",
            Self::CoreShowChannel(_) => "CoreShowChannel",
            Self::CoreShowChannelsComplete => "CoreShowChannelsComplete",
            Self::Cdr(_) => "Cdr",
            Self::Unknown(name) => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callwatch_core::Extension;

    fn parse(text: &str) -> Inbound {
        Inbound::classify(&AmiMessage::parse(text))
    }

    #[test]
    fn test_auth_accepted() {
        let inbound = parse("Response: Success\r\nMessage: Authentication accepted");
        assert_eq!(inbound, Inbound::Response(Response::AuthAccepted));
    }

    #[test]
    fn test_auth_rejected() {
        let inbound = parse("Response: Error\r\nMessage: Authentication failed");
        assert!(matches!(inbound, Inbound::Response(Response::AuthRejected { .. })));
    }

    #[test]
    fn test_generic_error_and_success() {
        let inbound = parse("Response: Error\r\nActionID: 3\r\nMessage: Permission denied");
        assert_eq!(
            inbound,
            Inbound::Response(Response::Error {
                action_id: Some("3".to_string()),
                message: "Permission denied".to_string()
            })
        );
        let inbound = parse("Response: Success\r\nPing: Pong");
        assert!(matches!(inbound, Inbound::Response(Response::Success { .. })));
    }

    #[test]
    fn test_peer_entry() {
        let inbound = parse(
            "Event: PeerEntry\r\nObjectName: 602\r\nIPaddress: 10.0.0.2\r\nIPport: 5060\r\nStatus: OK (12 ms)",
        );
        assert_eq!(
            inbound,
            Inbound::Event(AmiEvent::PeerEntry {
                object_name: "602".to_string(),
                status: Some("OK (12 ms)".to_string()),
                ip_address: Some("10.0.0.2".to_string()),
                ip_port: Some(5060),
            })
        );
    }

    #[test]
    fn test_peer_entry_without_ip() {
        let inbound = parse("Event: PeerEntry\r\nObjectName: 603\r\nIPaddress: -none-\r\nIPport: 0\r\nStatus: UNKNOWN");
        match inbound {
            Inbound::Event(AmiEvent::PeerEntry { ip_address, ip_port, .. }) => {
                assert_eq!(ip_address, None);
                assert_eq!(ip_port, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_new_channel_to_channel() {
        let inbound = parse(
            "Event: Newchannel\r\nChannel: SIP/602-00000001\r\nChannelStateDesc: Ring\r\nCallerIDNum: +15551234567\r\nCallerIDName: <unknown>\r\nUniqueid: 1700000000.1",
        );
        let Inbound::Event(AmiEvent::NewChannel(ev)) = inbound else {
            panic!("expected Newchannel");
        };
        assert_eq!(ev.caller_id_name, None);
        let channel = ev.to_channel();
        assert_eq!(channel.extension, Some(Extension::new("602")));
        assert!(channel.is_ringing());
        assert_eq!(channel.unique_id.as_deref(), Some("1700000000.1"));
    }

    #[test]
    fn test_dial_end_status() {
        let inbound = parse("Event: DialEnd\r\nChannel: SIP/602-1\r\nDestChannel: SIP/605-2\r\nDialStatus: BUSY");
        let Inbound::Event(AmiEvent::DialEnd(dial)) = inbound else {
            panic!("expected DialEnd");
        };
        assert!(!dial.is_answered());
        assert_eq!(dial.dest_channel.as_deref(), Some("SIP/605-2"));
    }

    #[test]
    fn test_cdr_event_numbers() {
        let inbound = parse(
            "Event: Cdr\r\nSource: 602\r\nDestination: +4420\r\nDuration: 61\r\nBillableSeconds: x\r\nStartTime: 2024-05-01 14:03:22",
        );
        let Inbound::Event(AmiEvent::Cdr(cdr)) = inbound else {
            panic!("expected Cdr");
        };
        assert_eq!(cdr.duration, 61);
        assert_eq!(cdr.billable_seconds, 0);
        assert_eq!(cdr.start_time.as_deref(), Some("2024-05-01 14:03:22"));
    }

    #[test]
    fn test_unknown_event_and_other() {
        assert_eq!(
            parse("Event: VarSet\r\nVariable: X"),
            Inbound::Event(AmiEvent::Unknown("VarSet".to_string()))
        );
        assert_eq!(parse("Foo: bar"), Inbound::Other);
    }

    #[test]
    fn test_event_names_case_insensitive() {
        assert_eq!(
            parse("Event: PeerlistComplete"),
            Inbound::Event(AmiEvent::PeerListComplete)
        );
        assert_eq!(
            parse("Event: CoreShowChannelsComplete\r\nListItems: 0"),
            Inbound::Event(AmiEvent::CoreShowChannelsComplete)
        );
    }
}
