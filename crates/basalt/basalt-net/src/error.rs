use basalt_msg::{CodecError, ConnectionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid IP address '{0}'")]
    InvalidAddress(String),

    #[error("host '{0}' could not be resolved")]
    HostNotFound(String),

    #[error("connection {0} closed by peer")]
    ConnectionClosed(ConnectionId),

    #[error("failed to connect to {endpoint}:{port}")]
    Connect {
        endpoint: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("no connection {0} in registry")]
    UnknownConnection(ConnectionId),

    #[error("message framing failed")]
    Codec(#[from] CodecError),

    #[error("socket i/o failed")]
    Io(#[from] std::io::Error),
}
