//! Wire framing for control messages.
//!
//! # Frame Layout
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────┐
//! │  type (i32)  │  len (u32)   │  payload: len bytes      │
//! │  big-endian  │  big-endian  │  opaque                  │
//! └──────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! Both header fields are in network byte order. The payload is opaque at this
//! layer; [`crate::control`] defines the layouts the handshake relies on.

use crate::{CodecError, ConnectionId, MessageType};
use std::io::{Read, Write};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload a decoder will accept. Bigger transfers belong in a segment.
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024 * 1024;

/// A control message plus the connection it arrived on (if it arrived at all).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub payload: Vec<u8>,
    /// Set by the receiving side; never transmitted.
    pub origin: Option<ConnectionId>,
}

impl Message {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            origin: None,
        }
    }

    /// A message with no payload.
    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn with_origin(mut self, origin: ConnectionId) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Serializes the message into a single contiguous frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, CodecError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge {
                len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        let mut frame = Vec::with_capacity(HEADER_LEN + len);
        frame.extend_from_slice(&self.kind.tag().to_be_bytes());
        frame.extend_from_slice(&(len as u32).to_be_bytes());
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }

    /// Writes one frame. Header and payload go out in a single `write_all` so a
    /// stream socket never sees a header without its body from this side.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        let frame = self.to_frame()?;
        w.write_all(&frame)?;
        w.flush()?;
        Ok(())
    }

    /// Reads exactly one frame, blocking until it is complete.
    ///
    /// End-of-stream at any point (including before the first header byte)
    /// surfaces as an `UnexpectedEof` i/o error; see [`CodecError::is_eof`].
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        let mut header = [0u8; HEADER_LEN];
        r.read_exact(&mut header)?;
        let (kind, len) = parse_header(&header)?;

        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload)?;
        Ok(Self::new(kind, payload))
    }

    /// Total length of the frame starting at `buf`, or `None` while the header
    /// itself is still incomplete.
    pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
        let Some(header) = buf.first_chunk::<HEADER_LEN>() else {
            return Ok(None);
        };
        let (_, len) = parse_header(header)?;
        Ok(Some(HEADER_LEN + len))
    }

    /// Decodes a frame from the front of `buf`, returning the message and the
    /// number of bytes consumed.
    pub fn from_frame(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&buf[..HEADER_LEN]);
        let (kind, len) = parse_header(&header)?;

        let end = HEADER_LEN + len;
        if buf.len() < end {
            return Err(CodecError::Truncated {
                needed: end,
                available: buf.len(),
            });
        }
        Ok((Self::new(kind, buf[HEADER_LEN..end].to_vec()), end))
    }
}

fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(MessageType, usize), CodecError> {
    let tag = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok((MessageType::from_tag(tag), len))
}
