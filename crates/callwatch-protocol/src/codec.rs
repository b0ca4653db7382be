//! Stream framing for the PBX management protocol.
//!
//! The PBX greets every new connection with one banner line
//! (`Asterisk Call Manager/5.0.1`). Everything after it is a sequence of
//! `Key: Value` lines terminated by a blank line. [`AmiCodec`] plugs into
//! `tokio_util::codec::Framed` so the socket reader yields whole frames in
//! arrival order, keeping partial frames buffered between reads.
//!
//! # Panic-Free Guarantees
//!
//! Decoding never indexes out of bounds: terminators are located with
//! `windows().position()` and buffers are split with `split_to` at
//! positions derived from those searches.

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::action::Action;
use crate::packet::AmiMessage;

/// Largest frame accepted before the stream is considered corrupt.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors raised while framing the PBX stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame exceeds {max} bytes without a terminator (buffered {len})")]
    FrameTooLarge { len: usize, max: usize },
}

/// One unit decoded from the PBX stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmiFrame {
    /// The greeting line sent once per connection
    Banner(String),
    /// A complete key/value message
    Message(AmiMessage),
}

/// Decoder/encoder for the PBX management protocol.
///
/// A fresh codec is created for every connection, which resets the banner
/// state and drops anything buffered from the previous socket.
#[derive(Debug)]
pub struct AmiCodec {
    banner_seen: bool,
    max_frame_len: usize,
}

impl AmiCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            banner_seen: false,
            max_frame_len,
        }
    }

    /// Whether the banner has been consumed.
    pub fn banner_seen(&self) -> bool {
        self.banner_seen
    }

    fn check_len(&self, src: &BytesMut) -> Result<(), ProtocolError> {
        if src.len() > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len: src.len(),
                max: self.max_frame_len,
            });
        }
        Ok(())
    }
}

impl Default for AmiCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Finds the earliest message terminator, returning `(offset, length)`.
///
/// CRLF CRLF is what the PBX sends; bare LF LF is tolerated.
fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

impl Decoder for AmiCodec {
    type Item = AmiFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<AmiFrame>, ProtocolError> {
        if !self.banner_seen {
            let Some(newline) = src.iter().position(|b| *b == b'\n') else {
                self.check_len(src)?;
                return Ok(None);
            };
            let line = src.split_to(newline + 1);
            self.banner_seen = true;
            let banner = String::from_utf8_lossy(&line).trim().to_string();
            return Ok(Some(AmiFrame::Banner(banner)));
        }

        loop {
            let Some((offset, len)) = find_terminator(src) else {
                self.check_len(src)?;
                return Ok(None);
            };
            let frame = src.split_to(offset);
            src.advance(len);
            let message = AmiMessage::parse(&String::from_utf8_lossy(&frame));
            if !message.is_empty() {
                return Ok(Some(AmiFrame::Message(message)));
            }
            trace!("Skipped empty frame");
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<AmiFrame>, ProtocolError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // A truncated frame at EOF is dropped; the reconnect resyncs.
                if !buf.is_empty() {
                    debug!(bytes = buf.len(), "Discarding partial frame at EOF");
                }
                buf.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Action> for AmiCodec {
    type Error = ProtocolError;

    fn encode(&mut self, action: Action, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(action.to_wire().as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut AmiCodec, buf: &mut BytesMut) -> Vec<AmiFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_banner_then_messages() {
        let mut codec = AmiCodec::new();
        let mut buf = BytesMut::from(
            "Asterisk Call Manager/5.0.1\r\nResponse: Success\r\nMessage: Authentication accepted\r\n\r\nEvent: FullyBooted\r\n\r\n",
        );
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], AmiFrame::Banner("Asterisk Call Manager/5.0.1".to_string()));
        match &frames[1] {
            AmiFrame::Message(m) => assert_eq!(m.get("Message"), Some("Authentication accepted")),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_banner_is_not_parsed_as_message() {
        let mut codec = AmiCodec::new();
        let mut buf = BytesMut::from("Asterisk Call Manager: 2.10\r\n");
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![AmiFrame::Banner("Asterisk Call Manager: 2.10".to_string())]);
        assert!(codec.banner_seen());
    }

    #[test]
    fn test_partial_message_stays_buffered() {
        let mut codec = AmiCodec::new();
        let mut buf = BytesMut::from("Banner\r\nEvent: Hangup\r\nChannel: SIP/602-");
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        assert!(!buf.is_empty());

        buf.extend_from_slice(b"00000001\r\nCause: 16\r\n\r\nEvent: Newstate\r\n");
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            AmiFrame::Message(m) => assert_eq!(m.get("Channel"), Some("SIP/602-00000001")),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(&buf[..], b"Event: Newstate\r\n");
    }

    #[test]
    fn test_split_terminator_across_reads() {
        let mut codec = AmiCodec::new();
        let mut buf = BytesMut::from("Banner\r\nEvent: PeerlistComplete\r\n\r");
        assert_eq!(decode_all(&mut codec, &mut buf).len(), 1);
        buf.extend_from_slice(b"\n");
        assert_eq!(decode_all(&mut codec, &mut buf).len(), 1);
    }

    #[test]
    fn test_blank_frames_skipped() {
        let mut codec = AmiCodec::new();
        let mut buf = BytesMut::from("Banner\r\n\r\n\r\nEvent: Ping\r\n\r\n");
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_bare_lf_terminator_tolerated() {
        let mut codec = AmiCodec::new();
        let mut buf = BytesMut::from("Banner\nEvent: Hangup\nChannel: SIP/605-1\n\n");
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_oversized_frame_is_error() {
        let mut codec = AmiCodec::with_max_frame_len(16);
        let mut buf = BytesMut::from("Banner\r\nEvent: ThisIsWayTooLongForTheLimit");
        assert!(matches!(codec.decode(&mut buf), Ok(Some(AmiFrame::Banner(_)))));
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_decode_eof_drops_partial_frame() {
        let mut codec = AmiCodec::new();
        let mut buf = BytesMut::from("Banner\r\nEvent: Hang");
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_action() {
        let mut codec = AmiCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(Action::ping(), &mut dst).unwrap();
        assert_eq!(&dst[..], b"Action: Ping\r\n\r\n");
    }
}
