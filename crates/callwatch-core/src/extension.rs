//! Extension identifiers and agent/trunk classification.
//!
//! The PBX reports every SIP endpoint the same way, whether it is an
//! agent's desk phone or a gateway line towards a carrier. Only agent
//! extensions are tracked; trunks are recognised by their naming prefix.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name prefixes (case-insensitive) of PBX-to-carrier trunks and gateways.
pub const TRUNK_PREFIXES: &[&str] = &["ev", "eb", "gsm", "cloudcart"];

/// Channel technologies whose channel names carry a peer name.
pub const PEER_TECHNOLOGIES: &[&str] = &["SIP", "PJSIP"];

/// Short numeric extension code reported by the PBX (e.g. "602").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extension(String);

impl Extension {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Classification of this extension.
    #[must_use]
    pub fn kind(&self) -> ExtensionKind {
        classify_extension(&self.0)
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Extension {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Extension {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Extension {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What kind of endpoint a peer name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    /// An agent's phone line - tracked.
    Agent,
    /// A carrier trunk or gateway leg - never tracked.
    Trunk,
}

/// Classifies a peer name as an agent extension or a trunk.
pub fn classify_extension(name: &str) -> ExtensionKind {
    let lower = name.to_ascii_lowercase();
    if TRUNK_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        ExtensionKind::Trunk
    } else {
        ExtensionKind::Agent
    }
}

/// Returns true for a 2-4 digit extension number.
pub fn is_short_extension(value: &str) -> bool {
    (2..=4).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_digit())
}

/// Strips a known technology prefix ("SIP/") case-insensitively.
fn strip_technology(value: &str) -> Option<&str> {
    let (tech, rest) = value.split_once('/')?;
    PEER_TECHNOLOGIES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(tech))
        .then_some(rest)
}

fn agent(name: &str) -> Option<Extension> {
    if name.is_empty() || classify_extension(name) == ExtensionKind::Trunk {
        return None;
    }
    Some(Extension::new(name))
}

/// Extracts the agent extension from a channel name.
///
/// `SIP/602-00001234` yields `602`. Trunk channels and channels of other
/// technologies (Local/, DAHDI/...) yield `None`.
pub fn extension_from_channel(channel: &str) -> Option<Extension> {
    let rest = strip_technology(channel)?;
    let name = rest.split('-').next().unwrap_or(rest);
    agent(name)
}

/// Extracts the agent extension from a peer or device name (`SIP/602`).
///
/// Bare names without a technology prefix are accepted as-is.
pub fn extension_from_device(device: &str) -> Option<Extension> {
    let name = strip_technology(device).unwrap_or(device);
    agent(name.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_trunks() {
        assert_eq!(classify_extension("ev1"), ExtensionKind::Trunk);
        assert_eq!(classify_extension("EB22"), ExtensionKind::Trunk);
        assert_eq!(classify_extension("gsm-gateway"), ExtensionKind::Trunk);
        assert_eq!(classify_extension("CloudCart"), ExtensionKind::Trunk);
        assert_eq!(classify_extension("602"), ExtensionKind::Agent);
        assert_eq!(Extension::new("610").kind(), ExtensionKind::Agent);
    }

    #[test]
    fn test_short_extension() {
        assert!(is_short_extension("60"));
        assert!(is_short_extension("602"));
        assert!(is_short_extension("6020"));
        assert!(!is_short_extension("6"));
        assert!(!is_short_extension("60200"));
        assert!(!is_short_extension("+4475"));
        assert!(!is_short_extension(""));
    }

    #[test]
    fn test_extension_from_channel() {
        assert_eq!(
            extension_from_channel("SIP/602-00001234"),
            Some(Extension::new("602"))
        );
        assert_eq!(
            extension_from_channel("sip/605-0000abcd"),
            Some(Extension::new("605"))
        );
        assert_eq!(
            extension_from_channel("PJSIP/610-00000001"),
            Some(Extension::new("610"))
        );
        assert_eq!(extension_from_channel("SIP/ev1-00000001"), None);
        assert_eq!(extension_from_channel("Local/602@from-internal-1;1"), None);
        assert_eq!(extension_from_channel(""), None);
    }

    #[test]
    fn test_extension_from_device() {
        assert_eq!(extension_from_device("SIP/602"), Some(Extension::new("602")));
        assert_eq!(extension_from_device("620"), Some(Extension::new("620")));
        assert_eq!(extension_from_device("SIP/gsm1"), None);
        assert_eq!(extension_from_device(""), None);
    }
}
