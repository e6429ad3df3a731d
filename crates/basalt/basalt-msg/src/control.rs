//! Payload layouts for the handshake and segment bookkeeping messages.
//!
//! ```text
//! AppContactDm      [port: i32]
//! GetShmKey reply   [key: i32][size: i32]
//! NewSharedSegment  [key: i32][size: i32]
//! SendApplProcId    [pid: u32]              exactly size_of::<u32>() bytes
//! ```
//!
//! All integers are big-endian; there is no padding.

use crate::{CodecError, Message, MessageType, PayloadBuilder, PayloadReader, SegmentKey};

/// Key and size of a shared segment. Used both for the `GetShmKey` reply and
/// for `NewSharedSegment` announcements, which share one layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentAnnouncement {
    pub key: SegmentKey,
    pub size: u32,
}

impl SegmentAnnouncement {
    pub const PAYLOAD_LEN: usize = 8;

    pub fn to_payload(&self) -> Vec<u8> {
        PayloadBuilder::new()
            .put_i32(self.key.0)
            .put_i32(self.size as i32)
            .finish()
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = PayloadReader::new(payload);
        let key = SegmentKey(r.get_i32()?);
        let size = r.get_i32()?;
        if size <= 0 {
            return Err(CodecError::OutOfRange {
                field: "segment size",
                value: size as i64,
            });
        }
        Ok(Self {
            key,
            size: size as u32,
        })
    }

    pub fn into_message(self, kind: MessageType) -> Message {
        Message::new(kind, self.to_payload())
    }
}

/// The controller's pointer to a datamanager listening on `port`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatamanagerAssignment {
    pub port: u16,
}

impl DatamanagerAssignment {
    pub fn to_message(self) -> Message {
        Message::new(
            MessageType::AppContactDm,
            PayloadBuilder::new().put_i32(self.port as i32).finish(),
        )
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CodecError> {
        let port = PayloadReader::new(payload).get_i32()?;
        match u16::try_from(port) {
            Ok(port) if port != 0 => Ok(Self { port }),
            _ => Err(CodecError::OutOfRange {
                field: "datamanager port",
                value: port as i64,
            }),
        }
    }
}

/// A worker's process id as reported to the datamanager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessIdAnnouncement {
    pub pid: u32,
}

impl ProcessIdAnnouncement {
    pub const PAYLOAD_LEN: usize = std::mem::size_of::<u32>();

    pub fn to_message(self) -> Message {
        Message::new(
            MessageType::SendApplProcId,
            self.pid.to_be_bytes().to_vec(),
        )
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() != Self::PAYLOAD_LEN {
            return Err(CodecError::Truncated {
                needed: Self::PAYLOAD_LEN,
                available: payload.len(),
            });
        }
        Ok(Self {
            pid: PayloadReader::new(payload).get_u32()?,
        })
    }
}
