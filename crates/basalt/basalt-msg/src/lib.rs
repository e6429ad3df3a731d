//! Control-message vocabulary shared by every basalt process.
//!
//! A control message is a typed, length-framed record exchanged over a socket
//! connection. Bulk data never travels here; it moves through shared segments
//! whose keys and sizes are announced with the payloads defined in [`control`].

pub mod control;
mod error;
pub mod frame;
mod kind;
pub mod payload;

pub use control::{DatamanagerAssignment, ProcessIdAnnouncement, SegmentAnnouncement};
pub use error::CodecError;
pub use frame::{HEADER_LEN, MAX_PAYLOAD_LEN, Message};
pub use kind::MessageType;
pub use payload::{PayloadBuilder, PayloadReader};

// ConnectionId and SegmentKey are stable identifiers used by several crates.
// repr(transparent) keeps them layout-identical to their single field.

/// Identifies one connection inside a process-local connection registry.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u32);

/// Integer key naming a shared-memory segment, unique per host.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SegmentKey(pub i32);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

impl std::fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
