use crate::{Endpoint, NetError};
use basalt_msg::{CodecError, ConnectionId, HEADER_LEN, Message};
use std::io::{self, Read};
use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Read timeout once the deadline has passed; also the shortest one armed.
const EXPIRED_READ_WINDOW: Duration = Duration::from_millis(1);

/// What the process at the other end of a connection is to us.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Controller,
    Datamanager,
    Peer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Controller => "controller",
            Role::Datamanager => "datamanager",
            Role::Peer => "peer",
        })
    }
}

/// A framed, blocking byte stream to one other process.
///
/// A failed send or receive marks the connection dead. It does not reconnect
/// and does not remove itself; that is the owner's call.
///
/// Frames are read incrementally into `partial`, so a deadline that expires
/// halfway through a frame leaves the stream in sync: the next receive picks
/// up where the last one stopped.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    role: Role,
    endpoint: Endpoint,
    port: u16,
    stream: TcpStream,
    alive: bool,
    partial: Vec<u8>,
    read_timeout_set: bool,
}

impl Connection {
    pub fn connect(
        id: ConnectionId,
        role: Role,
        endpoint: Endpoint,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<Self, NetError> {
        let addr = SocketAddr::V4(SocketAddrV4::new(endpoint.addr(), port));
        let connected = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        let stream = connected.map_err(|source| NetError::Connect {
            endpoint: endpoint.to_string(),
            port,
            source,
        })?;
        stream.set_nodelay(true)?;
        debug!(%id, %role, %endpoint, port, "connected");
        Ok(Self::from_stream(id, role, endpoint, port, stream))
    }

    fn from_stream(
        id: ConnectionId,
        role: Role,
        endpoint: Endpoint,
        port: u16,
        stream: TcpStream,
    ) -> Self {
        Self {
            id,
            role,
            endpoint,
            port,
            stream,
            alive: true,
            partial: Vec::new(),
            read_timeout_set: false,
        }
    }

    pub fn send(&mut self, msg: &Message) -> Result<(), NetError> {
        if !self.alive {
            return Err(NetError::ConnectionClosed(self.id));
        }
        trace!(id = %self.id, kind = %msg.kind, len = msg.payload.len(), "send");
        msg.write_to(&mut self.stream).map_err(|e| self.failed(e))
    }

    /// Block until one complete frame has arrived.
    ///
    /// The returned message carries this connection's id as its origin. A peer
    /// that closes or resets, before or inside a frame, yields
    /// `ConnectionClosed`; nothing of the partial frame survives.
    pub fn receive(&mut self) -> Result<Message, NetError> {
        match self.read_frame(None)? {
            Some(msg) => Ok(msg),
            None => Err(NetError::Io(io::ErrorKind::TimedOut.into())),
        }
    }

    /// Like [`receive`](Self::receive) but gives up at `deadline`, returning
    /// `None`. Bytes of a frame that was still arriving are kept for the next
    /// call.
    pub fn receive_until(&mut self, deadline: Instant) -> Result<Option<Message>, NetError> {
        self.read_frame(Some(deadline))
    }

    /// True while part of a frame is buffered.
    pub fn has_partial_frame(&self) -> bool {
        !self.partial.is_empty()
    }

    fn read_frame(&mut self, deadline: Option<Instant>) -> Result<Option<Message>, NetError> {
        if !self.alive {
            return Err(NetError::ConnectionClosed(self.id));
        }
        loop {
            let wanted = match Message::frame_len(&self.partial) {
                Ok(Some(total)) if self.partial.len() == total => {
                    let decoded = Message::from_frame(&self.partial);
                    self.partial.clear();
                    let (msg, _) = decoded.map_err(|e| self.failed(e))?;
                    trace!(id = %self.id, kind = %msg.kind, len = msg.payload.len(), "recv");
                    return Ok(Some(msg.with_origin(self.id)));
                }
                Ok(Some(total)) => total,
                Ok(None) => HEADER_LEN,
                Err(e) => return Err(self.failed(e)),
            };

            self.arm_read_timeout(deadline)?;

            let filled = self.partial.len();
            self.partial.resize(wanted, 0);
            let read = self.stream.read(&mut self.partial[filled..]);
            match read {
                Ok(0) => {
                    self.partial.truncate(filled);
                    return Err(self.failed(CodecError::Io(io::ErrorKind::UnexpectedEof.into())));
                }
                Ok(n) => self.partial.truncate(filled + n),
                Err(e) => {
                    self.partial.truncate(filled);
                    match e.kind() {
                        io::ErrorKind::Interrupted => {}
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            if deadline.is_some() =>
                        {
                            return Ok(None);
                        }
                        _ => return Err(self.failed(e.into())),
                    }
                }
            }
        }
    }

    /// Point the socket's read timeout at `deadline`. Past the deadline each
    /// read still gets a short window, so bytes that already arrived are
    /// consumed and only a stalled frame is left buffered.
    fn arm_read_timeout(&mut self, deadline: Option<Instant>) -> Result<(), NetError> {
        match deadline {
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                self.stream.set_read_timeout(Some(left.max(EXPIRED_READ_WINDOW)))?;
                self.read_timeout_set = true;
            }
            None if self.read_timeout_set => {
                self.stream.set_read_timeout(None)?;
                self.read_timeout_set = false;
            }
            None => {}
        }
        Ok(())
    }

    /// Mark the connection dead and classify the failure.
    fn failed(&mut self, e: CodecError) -> NetError {
        self.alive = false;
        self.partial.clear();
        if e.is_disconnect() {
            debug!(id = %self.id, role = %self.role, error = ?e, "peer went away");
            return NetError::ConnectionClosed(self.id);
        }
        NetError::from(e)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
