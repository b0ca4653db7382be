//! Agent and lead identities used to enrich peers and history.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use regex::Regex;

/// Minimum length of a normalized phone number worth looking up.
pub const MIN_PHONE_LEN: usize = 5;

/// A human agent resolved from the directory by extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Directory identifier of the agent
    pub id: String,
    /// Display name ("Jane Doe")
    pub display_name: String,
    /// Code as stored in the directory, before zero stripping ("0602")
    pub code: String,
}

/// Brief identity of a contact matched by phone or email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadIdentity {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl LeadIdentity {
    /// Builds a display name from first/last name parts.
    pub fn full_name(first: Option<&str>, last: Option<&str>) -> String {
        format!("{} {}", first.unwrap_or(""), last.unwrap_or(""))
            .trim()
            .to_string()
    }
}

/// Normalizes a phone number for lookup.
///
/// Keeps digits and a single leading `+`; everything else is stripped.
/// Returns `None` when fewer than [`MIN_PHONE_LEN`] characters remain.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let mut out = String::with_capacity(trimmed.len());
    if trimmed.starts_with('+') {
        out.push('+');
    }
    out.extend(trimmed.chars().filter(|c| c.is_ascii_digit()));
    (out.len() >= MIN_PHONE_LEN).then_some(out)
}

/// Lowercases and trims an email; `None` when it is not email-shaped.
pub fn normalize_email(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_lowercase();
    let (local, domain) = normalized.split_once('@')?;
    if local.is_empty() || !domain.contains('.') {
        return None;
    }
    Some(normalized)
}

/// Converts a directory code into the SIP extension ("0602" -> "602").
pub fn sip_extension_from_code(code: &str) -> String {
    let code = code.trim();
    let stripped = code.trim_start_matches('0');
    if stripped.is_empty() {
        code.to_string()
    } else {
        stripped.to_string()
    }
}

/// Contact details embedded in a caller-id name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerAlias {
    pub email: Option<String>,
    pub phone: Option<String>,
}

fn email_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[\w.+-]+@[\w.-]+\.\w+").ok())
        .as_ref()
}

fn phone_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\+?\d[\d\s-]{6,}").ok())
        .as_ref()
}

/// Parses an alias like `"john@example.com +447535964504"` into its parts.
///
/// Agents often type the lead's email and number into the caller-id name
/// when dialing out; either part may be missing.
pub fn parse_alias(caller_id_name: &str) -> CallerAlias {
    if caller_id_name.trim().is_empty() {
        return CallerAlias::default();
    }
    let email = email_pattern()
        .and_then(|re| re.find(caller_id_name))
        .map(|m| m.as_str().to_string());
    let phone = phone_pattern()
        .and_then(|re| re.find(caller_id_name))
        .map(|m| {
            m.as_str()
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '-')
                .collect()
        });
    CallerAlias { email, phone }
}
