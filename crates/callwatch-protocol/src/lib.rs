//! callwatch protocol - wire formats spoken by the daemon
//!
//! Two protocols live here:
//!
//! - The PBX management protocol: a banner line followed by blank-line
//!   terminated `Key: Value` frames, decoded with [`AmiCodec`] into
//!   [`AmiMessage`]s and classified into typed [`Inbound`] values.
//! - The local client protocol: newline-delimited JSON
//!   ([`ClientMessage`]/[`DaemonMessage`]) spoken over the daemon's Unix
//!   socket.

pub mod action;
pub mod codec;
pub mod event;
pub mod message;
pub mod packet;
pub mod version;

pub use action::{Action, ACTION_ID_INIT_CHANNELS, ACTION_ID_INIT_PEERS, ACTION_ID_POLL};
pub use codec::{AmiCodec, AmiFrame, ProtocolError, MAX_FRAME_LEN};
pub use event::{AmiEvent, CdrEvent, ChannelEvent, DialEvent, Inbound, Response};
pub use message::{ClientMessage, DaemonMessage, MessageType, Topic};
pub use packet::AmiMessage;
pub use version::{ProtocolVersion, VersionError};
