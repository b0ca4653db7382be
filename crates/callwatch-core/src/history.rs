//! Completed-call records and the bounded merged history.
//!
//! Records arrive from two independent sources: the live event stream
//! (emitted when the last channel of a peer hangs up) and the CDR table.
//! [`CallHistory`] merges both into one newest-first list with at most one
//! entry per [`HistoryKey`].
//!
//! # Duplicate Precedence
//!
//! Two records describe the same call when they share the start second and
//! the extension. Event-sourced records win: a CDR record whose key already
//! exists is discarded, and an event record whose key matches a CDR record
//! replaces it in place. Between records of the same provenance the first
//! one is kept.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DomainError, DomainResult};
use crate::extension::{is_short_extension, Extension};
use crate::identity::LeadIdentity;

/// Default bound on the number of retained history records.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Timestamp layout used by the PBX in CDR events and tables.
const PBX_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// Record Attributes
// ============================================================================

/// Outcome classification of a call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Disposition {
    #[serde(rename = "ANSWERED")]
    Answered,
    #[default]
    #[serde(rename = "NO ANSWER")]
    NoAnswer,
    #[serde(rename = "BUSY")]
    Busy,
    #[serde(rename = "CONGESTION")]
    Congestion,
    #[serde(rename = "FAILED")]
    Failed,
}

impl Disposition {
    /// Parses the disposition column of a CDR row.
    ///
    /// Unrecognized values map to [`Disposition::Failed`].
    pub fn from_cdr(value: &str) -> Self {
        let upper = value.trim().to_ascii_uppercase();
        match upper.as_str() {
            "ANSWERED" | "ANSWER" => Self::Answered,
            "NO ANSWER" | "NOANSWER" | "CANCEL" => Self::NoAnswer,
            "BUSY" => Self::Busy,
            "CONGESTION" => Self::Congestion,
            _ => Self::Failed,
        }
    }

    /// Classifies an unanswered call from its hangup cause text.
    pub fn from_hangup_cause(cause_text: &str) -> Self {
        let upper = cause_text.to_ascii_uppercase();
        if upper.contains("BUSY") {
            Self::Busy
        } else if upper.contains("CONGESTION") {
            Self::Congestion
        } else {
            Self::NoAnswer
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Answered => "ANSWERED",
            Self::NoAnswer => "NO ANSWER",
            Self::Busy => "BUSY",
            Self::Congestion => "CONGESTION",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which side placed the call, from the agent's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
    /// Agent to agent
    Internal,
    #[default]
    Unknown,
}

impl CallDirection {
    /// Parses the CDR `call_type` column.
    pub fn from_call_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "incoming" | "inbound" | "in" => Self::Incoming,
            "outgoing" | "outbound" | "out" => Self::Outgoing,
            "internal" | "local" => Self::Internal,
            _ => Self::Unknown,
        }
    }

    /// Returns `Internal` when the counterpart is another short extension.
    #[must_use]
    pub fn refine_for_counterpart(self, counterpart: Option<&str>) -> Self {
        match counterpart {
            Some(num) if is_short_extension(num) => Self::Internal,
            _ => self,
        }
    }
}

/// Where a history record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Built from the live event stream at hangup
    Event,
    /// Read from the CDR table or a CDR event
    Cdr,
}

// ============================================================================
// History Record
// ============================================================================

/// One completed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub provenance: Provenance,
    pub extension: Extension,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Counterpart phone number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    pub direction: CallDirection,
    pub disposition: Disposition,
    pub duration_secs: u64,
    pub billable_secs: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead: Option<LeadIdentity>,
}

impl HistoryRecord {
    /// Creates a record with empty details.
    pub fn new(provenance: Provenance, extension: Extension, started_at: DateTime<Utc>) -> Self {
        Self {
            provenance,
            extension,
            agent_name: None,
            agent_id: None,
            phone: None,
            src: None,
            dst: None,
            direction: CallDirection::Unknown,
            disposition: Disposition::NoAnswer,
            duration_secs: 0,
            billable_secs: 0,
            started_at,
            answered_at: None,
            ended_at: None,
            lead: None,
        }
    }

    /// Key under which duplicates collapse.
    pub fn dedup_key(&self) -> HistoryKey {
        HistoryKey {
            started_at: self.started_at.timestamp(),
            extension: self.extension.clone(),
        }
    }
}

/// Deduplication key: start time in whole seconds plus extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub started_at: i64,
    pub extension: Extension,
}

// ============================================================================
// Call History
// ============================================================================

/// Result of offering a record to [`CallHistory::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Added as a new entry
    Inserted,
    /// Replaced a CDR entry with the same key
    Replaced,
    /// Dropped, an entry with the same key wins
    Duplicate,
    /// Dropped, older than everything in a full history
    TooOld,
}

impl InsertOutcome {
    /// Whether the list changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced)
    }
}

/// Bounded, newest-first, deduplicated list of completed calls.
#[derive(Debug, Clone)]
pub struct CallHistory {
    records: VecDeque<HistoryRecord>,
    keys: HashSet<HistoryKey>,
    capacity: usize,
}

impl CallHistory {
    /// Creates an empty history. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_MAX_HISTORY)),
            keys: HashSet::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains_key(&self, key: &HistoryKey) -> bool {
        self.keys.contains(key)
    }

    /// Records, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.iter()
    }

    pub fn to_vec(&self) -> Vec<HistoryRecord> {
        self.records.iter().cloned().collect()
    }

    /// Offers a record to the history.
    ///
    /// Keeps the list ordered by start time (newest first) and evicts the
    /// oldest entries beyond capacity.
    pub fn insert(&mut self, record: HistoryRecord) -> InsertOutcome {
        let key = record.dedup_key();

        if self.keys.contains(&key) {
            let existing = self.records.iter_mut().find(|r| r.dedup_key() == key);
            return match existing {
                Some(existing)
                    if record.provenance == Provenance::Event
                        && existing.provenance == Provenance::Cdr =>
                {
                    debug!(
                        extension = %record.extension,
                        started_at = %record.started_at,
                        "Event record supersedes CDR record"
                    );
                    *existing = record;
                    InsertOutcome::Replaced
                }
                _ => InsertOutcome::Duplicate,
            };
        }

        if self.records.len() >= self.capacity {
            if let Some(oldest) = self.records.back() {
                if record.started_at < oldest.started_at {
                    return InsertOutcome::TooOld;
                }
            }
        }

        let position = self
            .records
            .iter()
            .position(|r| r.started_at <= record.started_at)
            .unwrap_or(self.records.len());
        self.records.insert(position, record);
        self.keys.insert(key);

        while self.records.len() > self.capacity {
            if let Some(evicted) = self.records.pop_back() {
                debug!(extension = %evicted.extension, "Evicted oldest history record");
                self.keys.remove(&evicted.dedup_key());
            }
        }

        InsertOutcome::Inserted
    }

    /// Offers several records; returns how many changed the list.
    pub fn merge(&mut self, records: impl IntoIterator<Item = HistoryRecord>) -> usize {
        records
            .into_iter()
            .map(|r| self.insert(r))
            .filter(InsertOutcome::changed)
            .count()
    }

    /// Fills in the agent name and id on records that lack them.
    pub fn fill_agents<F>(&mut self, mut resolve: F)
    where
        F: FnMut(&Extension) -> Option<(String, String)>,
    {
        for record in self.records.iter_mut().filter(|r| r.agent_name.is_none()) {
            if let Some((name, id)) = resolve(&record.extension) {
                record.agent_name = Some(name);
                record.agent_id = Some(id);
            }
        }
    }
}

impl Default for CallHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

// ============================================================================
// PBX Time Formats
// ============================================================================

/// Parses a PBX timestamp (`2024-05-01 14:03:22`) as UTC.
///
/// RFC 3339 timestamps are accepted as well.
pub fn parse_pbx_timestamp(value: &str) -> DomainResult<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, PBX_TIMESTAMP_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::parse("timestamp", format!("{value:?}: {e}")))
}

/// Parses an elapsed time of the form `HH:MM:SS` into seconds.
pub fn parse_hms(value: &str) -> DomainResult<u64> {
    let mut parts = value.trim().split(':');
    let mut total: u64 = 0;
    let mut count = 0;
    for part in parts.by_ref() {
        let n: u64 = part
            .parse()
            .map_err(|_| DomainError::parse("duration", format!("{value:?} is not HH:MM:SS")))?;
        total = total.saturating_mul(60).saturating_add(n);
        count += 1;
    }
    if count != 3 {
        return Err(DomainError::InvalidFieldValue {
            field: "duration".to_string(),
            value: value.to_string(),
            expected: "HH:MM:SS".to_string(),
        });
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn record(provenance: Provenance, ext: &str, secs: i64) -> HistoryRecord {
        HistoryRecord::new(provenance, Extension::new(ext), at(secs))
    }

    #[test]
    fn test_disposition_from_cdr() {
        assert_eq!(Disposition::from_cdr("ANSWERED"), Disposition::Answered);
        assert_eq!(Disposition::from_cdr("NO ANSWER"), Disposition::NoAnswer);
        assert_eq!(Disposition::from_cdr("busy"), Disposition::Busy);
        assert_eq!(Disposition::from_cdr("CONGESTION"), Disposition::Congestion);
        assert_eq!(Disposition::from_cdr("???"), Disposition::Failed);
    }

    #[test]
    fn test_disposition_from_hangup_cause() {
        assert_eq!(Disposition::from_hangup_cause("User busy"), Disposition::Busy);
        assert_eq!(
            Disposition::from_hangup_cause("Switching equipment congestion"),
            Disposition::Congestion
        );
        assert_eq!(
            Disposition::from_hangup_cause("Normal Clearing"),
            Disposition::NoAnswer
        );
        assert_eq!(Disposition::from_hangup_cause(""), Disposition::NoAnswer);
    }

    #[test]
    fn test_disposition_serializes_as_pbx_label() {
        let json = serde_json::to_string(&Disposition::NoAnswer).unwrap();
        assert_eq!(json, "\"NO ANSWER\"");
        assert_eq!(Disposition::Answered.to_string(), "ANSWERED");
    }

    #[test]
    fn test_direction_refinement() {
        assert_eq!(CallDirection::from_call_type("outgoing"), CallDirection::Outgoing);
        assert_eq!(CallDirection::from_call_type("Incoming"), CallDirection::Incoming);
        assert_eq!(
            CallDirection::Incoming.refine_for_counterpart(Some("605")),
            CallDirection::Internal
        );
        assert_eq!(
            CallDirection::Outgoing.refine_for_counterpart(Some("+15551234567")),
            CallDirection::Outgoing
        );
    }

    #[test]
    fn test_history_newest_first() {
        let mut history = CallHistory::new(10);
        history.insert(record(Provenance::Event, "602", 10));
        history.insert(record(Provenance::Event, "602", 30));
        history.insert(record(Provenance::Cdr, "605", 20));

        let starts: Vec<_> = history.iter().map(|r| r.started_at).collect();
        assert_eq!(starts, vec![at(30), at(20), at(10)]);
    }

    #[test]
    fn test_history_bounded_evicts_oldest() {
        let mut history = CallHistory::new(3);
        for secs in 0..5 {
            assert_eq!(
                history.insert(record(Provenance::Event, "602", secs)),
                InsertOutcome::Inserted
            );
        }
        assert_eq!(history.len(), 3);
        let starts: Vec<_> = history.iter().map(|r| r.started_at).collect();
        assert_eq!(starts, vec![at(4), at(3), at(2)]);
        assert!(!history.contains_key(&record(Provenance::Event, "602", 0).dedup_key()));

        assert_eq!(
            history.insert(record(Provenance::Cdr, "602", 1)),
            InsertOutcome::TooOld
        );
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_cdr_duplicate_of_event_is_discarded() {
        let mut history = CallHistory::new(10);
        let mut event = record(Provenance::Event, "602", 5);
        event.phone = Some("+15551234567".to_string());
        history.insert(event);

        let mut cdr = record(Provenance::Cdr, "602", 5);
        cdr.started_at += Duration::milliseconds(400);
        assert_eq!(history.insert(cdr), InsertOutcome::Duplicate);
        assert_eq!(history.len(), 1);
        assert_eq!(history.iter().next().map(|r| r.provenance), Some(Provenance::Event));
    }

    #[test]
    fn test_event_replaces_cdr_in_place() {
        let mut history = CallHistory::new(10);
        history.insert(record(Provenance::Cdr, "602", 9));
        history.insert(record(Provenance::Cdr, "602", 5));
        history.insert(record(Provenance::Cdr, "602", 1));

        let outcome = history.insert(record(Provenance::Event, "602", 5));
        assert_eq!(outcome, InsertOutcome::Replaced);
        assert_eq!(history.len(), 3);
        let provenance: Vec<_> = history.iter().map(|r| r.provenance).collect();
        assert_eq!(
            provenance,
            vec![Provenance::Cdr, Provenance::Event, Provenance::Cdr]
        );
    }

    #[test]
    fn test_same_provenance_keeps_first() {
        let mut history = CallHistory::new(10);
        let mut first = record(Provenance::Event, "602", 5);
        first.duration_secs = 42;
        history.insert(first);
        assert_eq!(
            history.insert(record(Provenance::Event, "602", 5)),
            InsertOutcome::Duplicate
        );
        assert_eq!(history.iter().next().map(|r| r.duration_secs), Some(42));
    }

    #[test]
    fn test_same_start_different_extension_kept() {
        let mut history = CallHistory::new(10);
        let merged = history.merge(vec![
            record(Provenance::Cdr, "602", 5),
            record(Provenance::Cdr, "605", 5),
            record(Provenance::Cdr, "602", 5),
        ]);
        assert_eq!(merged, 2);
    }

    #[test]
    fn test_fill_agents() {
        let mut history = CallHistory::new(10);
        history.insert(record(Provenance::Cdr, "602", 5));
        history.insert(record(Provenance::Cdr, "699", 6));
        history.fill_agents(|ext| {
            (ext.as_str() == "602").then(|| ("Jane Doe".to_string(), "a-1".to_string()))
        });
        let names: Vec<_> = history.iter().map(|r| r.agent_name.clone()).collect();
        assert_eq!(names, vec![None, Some("Jane Doe".to_string())]);
    }

    #[test]
    fn test_parse_pbx_timestamp() {
        let ts = parse_pbx_timestamp("2024-05-01 14:03:22").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 1, 14, 3, 22).unwrap());
        assert!(parse_pbx_timestamp("2024-05-01T14:03:22Z").is_ok());
        assert!(parse_pbx_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_parse_hms() {
        assert_eq!(parse_hms("00:01:05").unwrap(), 65);
        assert_eq!(parse_hms("01:00:00").unwrap(), 3600);
        assert!(parse_hms("1:05").is_err());
        assert!(parse_hms("aa:bb:cc").is_err());
    }
}
