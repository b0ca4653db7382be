//! Transient call legs reported by the PBX.
//!
//! A [`Channel`] lives from the moment the PBX announces it until its
//! hangup, or until a reconciliation poll no longer lists it. A peer is
//! in a call exactly when at least one channel in the [`ChannelTable`]
//! references its extension.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::extension::{extension_from_channel, Extension};

/// One leg of a call in progress, keyed by the PBX channel name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Channel {
    /// PBX channel name ("SIP/602-00001234")
    pub id: String,
    /// Owning agent extension; `None` for trunk and gateway legs
    pub extension: Option<Extension>,
    /// Lifecycle state as reported ("Down", "Ring", "Ringing", "Up", ...)
    pub state: String,
    pub caller_id_num: Option<String>,
    pub caller_id_name: Option<String>,
    pub connected_line_num: Option<String>,
    pub connected_line_name: Option<String>,
    pub unique_id: Option<String>,
    pub linked_id: Option<String>,
    /// Dialplan application currently running (poll results only)
    pub application: Option<String>,
    /// Elapsed time as `HH:MM:SS` (poll results only)
    pub duration: Option<String>,
}

impl Channel {
    /// Creates a channel and derives its owning extension from the name.
    pub fn new(id: impl Into<String>, state: impl Into<String>) -> Self {
        let id = id.into();
        let extension = extension_from_channel(&id);
        Self {
            id,
            extension,
            state: state.into(),
            ..Self::default()
        }
    }

    /// Returns true when the channel is answered.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.state.eq_ignore_ascii_case("up")
    }

    /// Returns true when the channel is ringing or being rung.
    #[must_use]
    pub fn is_ringing(&self) -> bool {
        self.state.eq_ignore_ascii_case("ringing") || self.state.eq_ignore_ascii_case("ring")
    }

    /// Number of the party on the other side, preferring the connected line.
    pub fn counterpart_num(&self) -> Option<&str> {
        non_empty(self.connected_line_num.as_deref())
            .or_else(|| non_empty(self.caller_id_num.as_deref()))
    }

    /// Name of the party on the other side, preferring the connected line.
    pub fn counterpart_name(&self) -> Option<&str> {
        non_empty(self.connected_line_name.as_deref())
            .or_else(|| non_empty(self.caller_id_name.as_deref()))
    }

    fn belongs_to(&self, extension: &Extension) -> bool {
        self.extension.as_ref() == Some(extension)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// All channels currently known to be active.
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    channels: HashMap<String, Channel>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a channel, returning the previous entry.
    pub fn insert(&mut self, channel: Channel) -> Option<Channel> {
        self.channels.insert(channel.id.clone(), channel)
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Channel> {
        self.channels.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Channel> {
        self.channels.remove(id)
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Channels owned by `extension`.
    pub fn for_extension<'a, 'e>(
        &'a self,
        extension: &'e Extension,
    ) -> impl Iterator<Item = &'a Channel> + 'e
    where
        'a: 'e,
    {
        self.channels.values().filter(move |c| c.belongs_to(extension))
    }

    /// Number of channels owned by `extension`.
    pub fn count_for(&self, extension: &Extension) -> usize {
        self.for_extension(extension).count()
    }

    /// Returns true if `extension` owns any channel other than `except`.
    pub fn has_other(&self, extension: &Extension, except: &str) -> bool {
        self.for_extension(extension).any(|c| c.id != except)
    }

    /// The channel that best describes the extension's call.
    ///
    /// An answered channel wins over a ringing one; ties are broken by
    /// channel name so the choice is stable across polls.
    pub fn best_for(&self, extension: &Extension) -> Option<&Channel> {
        self.for_extension(extension).min_by(|a, b| {
            b.is_up()
                .cmp(&a.is_up())
                .then_with(|| b.is_ringing().cmp(&a.is_ringing()))
                .then_with(|| a.id.cmp(&b.id))
        })
    }

    /// Replaces the whole table in one step.
    pub fn replace(&mut self, channels: impl IntoIterator<Item = Channel>) {
        self.channels = channels.into_iter().map(|c| (c.id.clone(), c)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(s: &str) -> Extension {
        Extension::new(s)
    }

    #[test]
    fn test_channel_owner_derived_from_name() {
        let ch = Channel::new("SIP/602-00000001", "Ring");
        assert_eq!(ch.extension, Some(ext("602")));
        assert!(ch.is_ringing());
        assert!(!ch.is_up());

        let trunk = Channel::new("SIP/gsm1-00000002", "Up");
        assert_eq!(trunk.extension, None);
        assert!(trunk.is_up());
    }

    #[test]
    fn test_counterpart_prefers_connected_line() {
        let mut ch = Channel::new("SIP/602-00000001", "Up");
        ch.caller_id_num = Some("602".to_string());
        assert_eq!(ch.counterpart_num(), Some("602"));

        ch.connected_line_num = Some("+15551234567".to_string());
        assert_eq!(ch.counterpart_num(), Some("+15551234567"));

        ch.connected_line_num = Some(String::new());
        assert_eq!(ch.counterpart_num(), Some("602"));
    }

    #[test]
    fn test_count_and_has_other() {
        let mut table = ChannelTable::new();
        table.insert(Channel::new("SIP/602-00000001", "Up"));
        table.insert(Channel::new("SIP/602-00000002", "Ringing"));
        table.insert(Channel::new("SIP/605-00000003", "Ring"));
        table.insert(Channel::new("SIP/ev1-00000004", "Up"));

        assert_eq!(table.len(), 4);
        assert_eq!(table.count_for(&ext("602")), 2);
        assert_eq!(table.count_for(&ext("605")), 1);
        assert_eq!(table.count_for(&ext("610")), 0);
        assert!(table.has_other(&ext("602"), "SIP/602-00000001"));
        assert!(!table.has_other(&ext("605"), "SIP/605-00000003"));
    }

    #[test]
    fn test_best_for_prefers_answered() {
        let mut table = ChannelTable::new();
        table.insert(Channel::new("SIP/602-00000001", "Ringing"));
        table.insert(Channel::new("SIP/602-00000002", "Up"));
        table.insert(Channel::new("SIP/602-00000003", "Down"));

        let best = table.best_for(&ext("602"));
        assert_eq!(best.map(|c| c.id.as_str()), Some("SIP/602-00000002"));

        table.remove("SIP/602-00000002");
        let best = table.best_for(&ext("602"));
        assert_eq!(best.map(|c| c.id.as_str()), Some("SIP/602-00000001"));
    }

    #[test]
    fn test_replace_drops_missing_channels() {
        let mut table = ChannelTable::new();
        table.insert(Channel::new("SIP/610-00000001", "Up"));
        table.replace(vec![Channel::new("SIP/602-00000009", "Up")]);

        assert!(table.get("SIP/610-00000001").is_none());
        assert!(table.get("SIP/602-00000009").is_some());
        table.clear();
        assert!(table.is_empty());
    }
}
