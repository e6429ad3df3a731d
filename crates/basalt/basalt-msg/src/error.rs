use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error while framing message")]
    Io(#[from] std::io::Error),

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("payload truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("payload string is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("{field} value {value} is out of range")]
    OutOfRange { field: &'static str, value: i64 },
}

impl CodecError {
    /// True when the underlying stream hit end-of-file before a frame completed.
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }

    /// True for every way a peer can go away: orderly close, reset, abort or
    /// a write into a closed pipe.
    pub fn is_disconnect(&self) -> bool {
        match self {
            CodecError::Io(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }
}

fn is_disconnect_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        kind,
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected
    )
}
