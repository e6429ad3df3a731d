use crate::{Connection, Endpoint, NetError, Role};
use basalt_msg::{ConnectionId, Message};
use std::io;
use std::time::{Duration, Instant};
use tracing::debug;

/// Every live connection of one process.
///
/// Lookup by role returns the most recently added connection with that role.
/// Single-threaded: callers that share it across threads must lock around it.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Insertion order; newest last.
    conns: Vec<Connection>,
    next_id: u32,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Open a connection to `endpoint:port` and register it under `role`.
    pub fn add(
        &mut self,
        role: Role,
        endpoint: Endpoint,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<ConnectionId, NetError> {
        let id = self.allocate_id();
        let conn = Connection::connect(id, role, endpoint, port, timeout)?;
        self.conns.push(conn);
        Ok(id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let pos = self.conns.iter().position(|c| c.id() == id)?;
        let conn = self.conns.remove(pos);
        debug!(%id, role = %conn.role(), "connection removed");
        Some(conn)
    }

    pub fn find(&self, role: Role) -> Option<&Connection> {
        self.conns.iter().rev().find(|c| c.role() == role)
    }

    pub fn find_id(&self, role: Role) -> Option<ConnectionId> {
        self.find(role).map(Connection::id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.conns.iter().find(|c| c.id() == id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.conns.iter_mut().find(|c| c.id() == id)
    }

    pub fn send(&mut self, id: ConnectionId, msg: &Message) -> Result<(), NetError> {
        self.get_mut(id)
            .ok_or(NetError::UnknownConnection(id))?
            .send(msg)
    }

    pub fn receive(&mut self, id: ConnectionId) -> Result<Message, NetError> {
        self.get_mut(id)
            .ok_or(NetError::UnknownConnection(id))?
            .receive()
    }

    /// [`Connection::receive_until`] on connection `id`.
    pub fn receive_until(
        &mut self,
        id: ConnectionId,
        deadline: Instant,
    ) -> Result<Option<Message>, NetError> {
        self.get_mut(id)
            .ok_or(NetError::UnknownConnection(id))?
            .receive_until(deadline)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.iter()
    }

    /// Wait until one of `ids` has data (or a hangup) to read.
    ///
    /// `None` timeout waits indefinitely. Returns `Ok(None)` once the timeout
    /// elapses with nothing readable, or at once if `ids` names no registered
    /// connection. When several are ready the first in `ids` order wins.
    pub fn poll_readable(
        &self,
        ids: &[ConnectionId],
        timeout: Option<Duration>,
    ) -> Result<Option<ConnectionId>, NetError> {
        let watched: Vec<&Connection> = ids.iter().filter_map(|id| self.get(*id)).collect();
        if watched.is_empty() {
            return Ok(None);
        }

        let mut fds: Vec<libc::pollfd> = watched
            .iter()
            .map(|c| libc::pollfd {
                fd: c.raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let wait_ms = match deadline {
                None => -1,
                Some(d) => duration_to_poll_ms(d.saturating_duration_since(Instant::now())),
            };

            // SAFETY: fds is a valid, exclusively borrowed array of fds.len() pollfds
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, wait_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(NetError::Io(err));
            }
            if rc == 0 {
                return Ok(None);
            }

            // error states count as readable so the following receive reports them
            let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
            if let Some(i) = fds.iter().position(|p| p.revents & ready != 0) {
                return Ok(Some(watched[i].id()));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
        }
    }
}

/// Round up so a sub-millisecond remainder still waits instead of spinning.
fn duration_to_poll_ms(d: Duration) -> libc::c_int {
    let ms = d.as_micros().div_ceil(1000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}
