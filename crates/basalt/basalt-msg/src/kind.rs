/// Kind of a control message.
///
/// The tag space is closed over the kinds this crate knows about. Any other tag
/// read off the wire becomes [`MessageType::Unknown`] and keeps its raw value,
/// so it re-encodes to exactly the tag that arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Quit,
    Start,
    Finished,
    Error,
    Warning,
    Info,
    Parinfo,
    Render,
    NewObject,
    DeleteObject,
    /// Sentinel for a connection that went away; never expected as a reply.
    SocketClosed,
    /// Controller tells a worker which datamanager port to contact.
    AppContactDm,
    /// Request and reply for the worker's primary segment key.
    GetShmKey,
    /// Datamanager announces a freshly created segment; handled in place.
    NewSharedSegment,
    /// Worker reports its process id to the datamanager.
    SendApplProcId,
    Unknown(i32),
}

impl MessageType {
    pub fn from_tag(tag: i32) -> Self {
        match tag {
            1 => MessageType::Quit,
            2 => MessageType::Start,
            3 => MessageType::Finished,
            4 => MessageType::Error,
            5 => MessageType::Warning,
            6 => MessageType::Info,
            7 => MessageType::Parinfo,
            8 => MessageType::Render,
            9 => MessageType::NewObject,
            10 => MessageType::DeleteObject,
            11 => MessageType::SocketClosed,
            12 => MessageType::AppContactDm,
            13 => MessageType::GetShmKey,
            14 => MessageType::NewSharedSegment,
            15 => MessageType::SendApplProcId,
            other => MessageType::Unknown(other),
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            MessageType::Quit => 1,
            MessageType::Start => 2,
            MessageType::Finished => 3,
            MessageType::Error => 4,
            MessageType::Warning => 5,
            MessageType::Info => 6,
            MessageType::Parinfo => 7,
            MessageType::Render => 8,
            MessageType::NewObject => 9,
            MessageType::DeleteObject => 10,
            MessageType::SocketClosed => 11,
            MessageType::AppContactDm => 12,
            MessageType::GetShmKey => 13,
            MessageType::NewSharedSegment => 14,
            MessageType::SendApplProcId => 15,
            MessageType::Unknown(tag) => tag,
        }
    }

    #[inline]
    pub fn is_known(self) -> bool {
        !matches!(self, MessageType::Unknown(_))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Unknown(tag) => write!(f, "UNKNOWN({tag})"),
            known => write!(f, "{known:?}"),
        }
    }
}
