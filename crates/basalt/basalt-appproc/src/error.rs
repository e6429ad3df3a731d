use crate::ProcessState;
use basalt_msg::{CodecError, MessageType};
use basalt_net::{NetError, Role};
use basalt_shm::ShmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("protocol violation while {stage}: expected {expected}, received {received}")]
    ProtocolViolation {
        stage: ProcessState,
        expected: MessageType,
        received: MessageType,
    },

    #[error("{role} disconnected")]
    PeerDisconnected { role: Role },

    #[error("datamanager unreachable")]
    DatamanagerUnreachable,

    #[error("no {role} connection")]
    MissingConnection { role: Role },

    #[error("{operation} is not possible while {state}")]
    InvalidState {
        operation: &'static str,
        state: ProcessState,
    },

    #[error(transparent)]
    Segment(#[from] ShmError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("malformed control message")]
    Codec(#[from] CodecError),
}

impl AppError {
    /// Whether the coordinator can make no further progress after this error.
    ///
    /// Losing the controller or datamanager is fatal; losing a peer module is
    /// not, nor are local mistakes such as a bad address or an out-of-range
    /// segment access.
    pub fn is_fatal(&self) -> bool {
        match self {
            AppError::ProtocolViolation { .. } | AppError::DatamanagerUnreachable => true,
            AppError::PeerDisconnected { role } | AppError::MissingConnection { role } => {
                *role != Role::Peer
            }
            AppError::InvalidState { .. } | AppError::Codec(_) => false,
            AppError::Segment(e) => matches!(e, ShmError::SegmentUnavailable { .. }),
            AppError::Net(e) => !matches!(
                e,
                NetError::InvalidAddress(_) | NetError::UnknownConnection(_)
            ),
        }
    }
}
