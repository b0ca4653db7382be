//! Outgoing PBX management commands.

use std::fmt;

/// ActionID tagging the bootstrap peer list request.
pub const ACTION_ID_INIT_PEERS: &str = "init_peers";

/// ActionID tagging the bootstrap channel list request.
pub const ACTION_ID_INIT_CHANNELS: &str = "init_channels";

/// ActionID tagging periodic reconciliation polls.
pub const ACTION_ID_POLL: &str = "poll_channels";

/// One outgoing command, serialized as `Action: <name>` plus fields.
#[derive(Clone, PartialEq, Eq)]
pub struct Action {
    name: String,
    action_id: Option<String>,
    fields: Vec<(String, String)>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_id: None,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_action_id(mut self, id: impl Into<String>) -> Self {
        self.action_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Credential login, subscribing to all events.
    pub fn login(username: &str, secret: &str) -> Self {
        Self::new("Login")
            .with_field("Username", username)
            .with_field("Secret", secret)
            .with_field("Events", "on")
    }

    pub fn logoff() -> Self {
        Self::new("Logoff")
    }

    pub fn ping() -> Self {
        Self::new("Ping")
    }

    /// Requests one `PeerEntry` event per SIP peer.
    pub fn sip_peers() -> Self {
        Self::new("SIPpeers")
    }

    /// Requests one `CoreShowChannel` event per active channel.
    pub fn core_show_channels() -> Self {
        Self::new("CoreShowChannels")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action_id(&self) -> Option<&str> {
        self.action_id.as_deref()
    }

    /// Serializes the action with CRLF line endings and a blank line.
    pub fn to_wire(&self) -> String {
        let mut out = format!("Action: {}\r\n", self.name);
        if let Some(id) = &self.action_id {
            out.push_str(&format!("ActionID: {id}\r\n"));
        }
        for (key, value) in &self.fields {
            out.push_str(&format!("{key}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case("secret") {
                    (k.as_str(), "<redacted>")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("action_id", &self.action_id)
            .field("fields", &fields)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_wire_format() {
        let wire = Action::login("monitor", "s3cret").to_wire();
        assert_eq!(
            wire,
            "Action: Login\r\nUsername: monitor\r\nSecret: s3cret\r\nEvents: on\r\n\r\n"
        );
    }

    #[test]
    fn test_action_id_follows_action_line() {
        let wire = Action::sip_peers()
            .with_action_id(ACTION_ID_INIT_PEERS)
            .to_wire();
        assert_eq!(wire, "Action: SIPpeers\r\nActionID: init_peers\r\n\r\n");
    }

    #[test]
    fn test_simple_actions() {
        assert_eq!(Action::ping().to_wire(), "Action: Ping\r\n\r\n");
        assert_eq!(Action::logoff().name(), "Logoff");
        assert_eq!(Action::core_show_channels().name(), "CoreShowChannels");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", Action::login("monitor", "s3cret"));
        assert!(debug.contains("monitor"));
        assert!(!debug.contains("s3cret"));
    }
}
