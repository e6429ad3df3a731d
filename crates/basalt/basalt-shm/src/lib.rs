//! Shared-memory access for one process.
//!
//! A segment is a file-backed shared mapping named by an integer
//! [`SegmentKey`]. This crate only does attach/detach bookkeeping; what the
//! bytes inside a segment mean is agreed between the communicating processes
//! through control messages.

mod access;
mod error;
mod segment;

pub use access::{SharedMemoryAccess, remove_segment, segment_path};
pub use basalt_msg::SegmentKey;
pub use error::ShmError;
pub use segment::SegmentHandle;
