use basalt_msg::SegmentKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared segment {key} ({size} bytes) unavailable: {reason}")]
    SegmentUnavailable {
        key: SegmentKey,
        size: usize,
        reason: String,
    },

    #[error("access of {len} bytes at offset {offset} exceeds segment size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}
