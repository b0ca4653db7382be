//! callwatch core - shared types for PBX agent monitoring
//!
//! This crate provides the domain types shared between the protocol
//! layer and the daemon: peers and their call state, transient channels,
//! completed-call history and the identities used to enrich them.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod channel;
pub mod error;
pub mod extension;
pub mod history;
pub mod identity;
pub mod peer;
pub mod status;

// Re-exports for convenience
pub use channel::{Channel, ChannelTable};
pub use error::{DomainError, DomainResult};
pub use extension::{
    classify_extension, extension_from_channel, extension_from_device, is_short_extension,
    Extension, ExtensionKind,
};
pub use history::{
    parse_hms, parse_pbx_timestamp, CallDirection, CallHistory, Disposition, HistoryKey,
    HistoryRecord, InsertOutcome, Provenance, DEFAULT_MAX_HISTORY,
};
pub use identity::{
    normalize_email, normalize_phone, parse_alias, sip_extension_from_code, AgentInfo,
    CallerAlias, LeadIdentity,
};
pub use peer::{natural_cmp, sort_views, ActiveCall, CallState, Peer, PeerView, RegistrationState};
pub use status::EngineStatus;
