//! Key/value messages of the PBX management protocol.

use std::fmt;

/// One parsed PBX message: an ordered list of `Key: Value` fields.
///
/// Keys keep their original case but lookups ignore it, since PBX versions
/// disagree on spellings such as `Uniqueid` and `UniqueID`. When a key
/// repeats, lookups return the last occurrence.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AmiMessage {
    fields: Vec<(String, String)>,
}

impl AmiMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the text of one frame (without its terminating blank line).
    ///
    /// Each line is split at its first colon; key and value are trimmed.
    /// Lines without a colon are ignored.
    pub fn parse(text: &str) -> Self {
        let fields = text
            .lines()
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.trim().to_string()))
            })
            .collect();
        Self { fields }
    }

    /// Appends a field.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    /// Builder-style [`push`](Self::push).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// Value of `key`, last occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Value of `key` if present and non-empty.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Owned non-empty value of `key`.
    pub fn get_owned(&self, key: &str) -> Option<String> {
        self.get_non_empty(key).map(str::to_string)
    }

    pub fn event_name(&self) -> Option<&str> {
        self.get_non_empty("Event")
    }

    pub fn response(&self) -> Option<&str> {
        self.get_non_empty("Response")
    }

    pub fn action_id(&self) -> Option<&str> {
        self.get_non_empty("ActionID")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Debug for AmiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.fields {
            if key.eq_ignore_ascii_case("secret") {
                map.entry(key, &"<redacted>");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}
