use crate::{AppError, MessageQueue, ProcessState};
use basalt_config::ModuleConfig;
use basalt_msg::{
    ConnectionId, DatamanagerAssignment, Message, MessageType, ProcessIdAnnouncement,
    SegmentAnnouncement, SegmentKey,
};
use basalt_net::{ConnectionRegistry, Endpoint, NetError, Role};
use basalt_shm::{SegmentHandle, SharedMemoryAccess};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// The worker side of a pipeline module: one per process, owned by the entry
/// point and passed to whatever needs it.
///
/// All I/O is blocking and happens on the caller's thread. Messages that are
/// not what a wait is looking for go to the [`MessageQueue`], and every
/// receive operation serves that queue before touching the network.
/// `NewSharedSegment` announcements are consumed wherever they show up: the
/// segment is attached and the wait carries on.
pub struct ApplicationProcess {
    config: ModuleConfig,
    pid: u32,
    state: ProcessState,
    connections: ConnectionRegistry,
    shm: Option<SharedMemoryAccess>,
    queue: MessageQueue,
    controller: Option<ConnectionId>,
    datamanager: Option<ConnectionId>,
    /// Host the controller was reached on; the datamanager lives there too.
    controller_endpoint: Option<Endpoint>,
}

impl ApplicationProcess {
    pub fn new(config: ModuleConfig) -> Self {
        let queue = MessageQueue::with_high_water(config.queue_high_water);
        Self {
            config,
            pid: std::process::id(),
            state: ProcessState::Unstarted,
            connections: ConnectionRegistry::new(),
            shm: None,
            queue,
            controller: None,
            datamanager: None,
            controller_endpoint: None,
        }
    }

    /// Create the process object and run the full startup handshake.
    pub fn start(config: ModuleConfig) -> Result<Self, AppError> {
        let mut process = Self::new(config);
        process.run_handshake()?;
        Ok(process)
    }

    /// Controller, datamanager, shared-memory key, attach, announce pid.
    ///
    /// No step is retried. On failure the process is left `Terminated` and the
    /// error is logged with the stage it happened in.
    pub fn run_handshake(&mut self) -> Result<(), AppError> {
        if self.state != ProcessState::Unstarted {
            return Err(AppError::InvalidState {
                operation: "handshake",
                state: self.state,
            });
        }

        let result = self.handshake_steps();
        if let Err(e) = &result {
            error!(
                stage = %self.state,
                module = %self.config.module_name,
                error = %e,
                "handshake failed"
            );
            self.state = ProcessState::Terminated;
        }
        result
    }

    fn handshake_steps(&mut self) -> Result<(), AppError> {
        self.contact_controller()?;
        let port = self.await_datamanager_assignment()?;
        self.contact_datamanager(port)?;
        self.announce_pid()?;
        info!(
            module = %self.config.module_name,
            id = self.config.module_id,
            pid = self.pid,
            "module running"
        );
        Ok(())
    }

    fn contact_controller(&mut self) -> Result<(), AppError> {
        self.state = ProcessState::ContactingController;
        let endpoint = Endpoint::resolve(&self.config.controller_host)?;
        // an unresolved endpoint is 0.0.0.0, which would reach this machine
        if !endpoint.is_resolved() {
            return Err(NetError::HostNotFound(self.config.controller_host.clone()).into());
        }
        let port = self.config.controller_port;
        info!(%endpoint, port, "contacting controller");

        let id = self.connections.add(
            Role::Controller,
            endpoint.clone(),
            port,
            self.config.connect_timeout(),
        )?;
        self.controller = Some(id);
        self.controller_endpoint = Some(endpoint);
        self.state = ProcessState::AwaitingDatamanagerAssignment;
        Ok(())
    }

    fn await_datamanager_assignment(&mut self) -> Result<u16, AppError> {
        let msg = self.wait_for_control_message()?;
        if msg.kind != MessageType::AppContactDm {
            return Err(AppError::ProtocolViolation {
                stage: self.state,
                expected: MessageType::AppContactDm,
                received: msg.kind,
            });
        }
        let assignment = DatamanagerAssignment::from_payload(&msg.payload)?;
        debug!(port = assignment.port, "datamanager assigned");
        Ok(assignment.port)
    }

    fn contact_datamanager(&mut self, port: u16) -> Result<(), AppError> {
        self.state = ProcessState::ContactingDatamanager;
        let endpoint = self
            .controller_endpoint
            .clone()
            .ok_or(AppError::MissingConnection {
                role: Role::Controller,
            })?;
        info!(%endpoint, port, "contacting datamanager");
        let id = self.connections.add(
            Role::Datamanager,
            endpoint,
            port,
            self.config.connect_timeout(),
        )?;
        self.datamanager = Some(id);

        self.state = ProcessState::AwaitingShmKey;
        let reply = self.exchange(
            id,
            Message::empty(MessageType::GetShmKey),
            &[MessageType::GetShmKey],
        )?;
        if reply.payload.is_empty() {
            return Err(AppError::ProtocolViolation {
                stage: self.state,
                expected: MessageType::GetShmKey,
                received: reply.kind,
            });
        }
        let assigned = SegmentAnnouncement::from_payload(&reply.payload)?;

        // a fresh access object replaces whatever was attached before
        let mut shm = SharedMemoryAccess::new(self.config.shm_dir.clone());
        shm.attach(assigned.key, assigned.size as usize)?;
        self.shm = Some(shm);
        info!(key = %assigned.key, size = assigned.size, "shared memory attached");
        self.state = ProcessState::Attached;
        Ok(())
    }

    fn announce_pid(&mut self) -> Result<(), AppError> {
        let msg = ProcessIdAnnouncement { pid: self.pid }.to_message();
        self.send_to_datamanager(&msg)?;
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Block until a control message from the controller or datamanager is
    /// available. Deferred messages are returned first.
    pub fn wait_for_control_message(&mut self) -> Result<Message, AppError> {
        loop {
            match self.next_message(None)? {
                Some(msg) => {
                    if let Some(msg) = self.consume_in_place(msg)? {
                        return Ok(msg);
                    }
                }
                None => {
                    return Err(AppError::MissingConnection {
                        role: Role::Controller,
                    });
                }
            }
        }
    }

    /// Like [`wait_for_control_message`](Self::wait_for_control_message) but
    /// gives up after `timeout`, returning `None`. Time spent attaching an
    /// announced segment counts against the timeout, and so does a frame that
    /// is still arriving when the timeout expires; its bytes are kept for the
    /// next receive.
    pub fn check_for_control_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Message>, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(msg) = self.next_message(Some(deadline))? else {
                return Ok(None);
            };
            if let Some(msg) = self.consume_in_place(msg)? {
                return Ok(Some(msg));
            }
        }
    }

    /// Send `request` on `conn`, then receive from that connection until a
    /// message whose kind is in `expected` arrives.
    ///
    /// Everything else received meanwhile is deferred in arrival order, except
    /// `NewSharedSegment`, which is attached immediately and never returned.
    /// A closed connection (or an explicit `SocketClosed`) removes the
    /// connection and fails with `PeerDisconnected`.
    pub fn exchange(
        &mut self,
        conn: ConnectionId,
        request: Message,
        expected: &[MessageType],
    ) -> Result<Message, AppError> {
        let role = self
            .connections
            .get(conn)
            .map(|c| c.role())
            .ok_or(AppError::Net(NetError::UnknownConnection(conn)))?;

        if let Err(e) = self.connections.send(conn, &request) {
            warn!(%role, error = %e, "send failed during exchange");
            return Err(self.send_failed(conn));
        }

        loop {
            let msg = match self.connections.receive(conn) {
                Ok(msg) => msg,
                Err(e) => return Err(self.receive_failed(conn, e)),
            };

            if msg.kind == MessageType::NewSharedSegment {
                self.handle_segment_announcement(&msg)?;
            } else if expected.contains(&msg.kind) {
                return Ok(msg);
            } else if msg.kind == MessageType::SocketClosed {
                return Err(self.connection_lost(conn));
            } else {
                debug!(kind = %msg.kind, %role, "deferring message");
                self.queue.push(msg);
            }
        }
    }

    /// [`exchange`](Self::exchange) with the datamanager.
    pub fn exchange_with_datamanager(
        &mut self,
        request: Message,
        expected: &[MessageType],
    ) -> Result<Message, AppError> {
        let dm = self.datamanager.ok_or(AppError::DatamanagerUnreachable)?;
        self.exchange(dm, request, expected)
    }

    /// Fire-and-forget send to the datamanager. A failed send drops the
    /// datamanager connection.
    pub fn send_to_datamanager(&mut self, msg: &Message) -> Result<(), AppError> {
        let dm = self.datamanager.ok_or(AppError::DatamanagerUnreachable)?;
        if let Err(e) = self.connections.send(dm, msg) {
            warn!(error = %e, kind = %msg.kind, "send to datamanager failed");
            return Err(self.send_failed(dm));
        }
        Ok(())
    }

    /// Block for the next frame on the datamanager connection, bypassing the
    /// deferred queue.
    pub fn recv_from_datamanager(&mut self) -> Result<Message, AppError> {
        let dm = self.datamanager.ok_or(AppError::DatamanagerUnreachable)?;
        self.connections
            .receive(dm)
            .map_err(|e| self.receive_failed(dm, e))
    }

    /// True if deferred messages are waiting; the next receive will return
    /// them before reading the network.
    pub fn has_deferred(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Take the oldest deferred message without touching the network.
    pub fn pop_deferred(&mut self) -> Option<Message> {
        self.queue.pop()
    }

    /// The working segment assigned by the datamanager.
    pub fn shared_memory(&self) -> Option<SegmentHandle> {
        self.shm.as_ref().and_then(SharedMemoryAccess::primary)
    }

    pub fn segment(&self, key: SegmentKey) -> Option<SegmentHandle> {
        self.shm.as_ref().and_then(|s| s.get(key))
    }

    pub fn shared_memory_access(&self) -> Option<&SharedMemoryAccess> {
        self.shm.as_ref()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Mutable registry access, e.g. to add peer connections.
    pub fn connections_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.connections
    }

    pub fn controller(&self) -> Option<ConnectionId> {
        self.controller
    }

    pub fn datamanager(&self) -> Option<ConnectionId> {
        self.datamanager
    }

    /// Detach every segment and drop every connection.
    pub fn shutdown(&mut self) {
        if self.state == ProcessState::Terminated && self.connections.is_empty() {
            return;
        }
        info!(module = %self.config.module_name, "shutting down");
        self.shm = None;
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.id()).collect();
        for id in ids {
            self.connections.remove(id);
        }
        self.controller = None;
        self.datamanager = None;
        self.state = ProcessState::Terminated;
    }

    /// Next message from the deferred queue, or else from whichever of the
    /// controller and datamanager connections becomes readable first.
    fn next_message(&mut self, deadline: Option<Instant>) -> Result<Option<Message>, AppError> {
        if let Some(msg) = self.queue.pop() {
            return Ok(Some(msg));
        }

        let watched: Vec<ConnectionId> = [self.controller, self.datamanager]
            .into_iter()
            .flatten()
            .collect();
        if watched.is_empty() {
            return Ok(None);
        }

        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let Some(id) = self.connections.poll_readable(&watched, timeout)? else {
            return Ok(None);
        };
        let received = match deadline {
            Some(d) => self.connections.receive_until(id, d),
            None => self.connections.receive(id).map(Some),
        };
        match received {
            Ok(Some(msg)) => {
                debug!(kind = %msg.kind, conn = %id, "control message received");
                Ok(Some(msg))
            }
            Ok(None) => {
                debug!(conn = %id, "deadline passed inside a frame");
                Ok(None)
            }
            Err(e) => Err(self.receive_failed(id, e)),
        }
    }

    /// Swallow messages that are handled transparently; pass the rest on.
    fn consume_in_place(&mut self, msg: Message) -> Result<Option<Message>, AppError> {
        match msg.kind {
            MessageType::NewSharedSegment => {
                self.handle_segment_announcement(&msg)?;
                Ok(None)
            }
            _ => Ok(Some(msg)),
        }
    }

    /// A malformed announcement is dropped so the surrounding wait stays in
    /// step with the stream; a segment that cannot be attached is fatal.
    fn handle_segment_announcement(&mut self, msg: &Message) -> Result<(), AppError> {
        let ann = match SegmentAnnouncement::from_payload(&msg.payload) {
            Ok(ann) => ann,
            Err(e) => {
                warn!(error = %e, origin = ?msg.origin, "ignoring malformed segment announcement");
                return Ok(());
            }
        };
        let shm = self
            .shm
            .get_or_insert_with(|| SharedMemoryAccess::new(self.config.shm_dir.clone()));
        shm.attach(ann.key, ann.size as usize)?;
        info!(key = %ann.key, size = ann.size, "new shared segment");
        Ok(())
    }

    /// Remove a connection the peer closed and classify the loss.
    fn connection_lost(&mut self, id: ConnectionId) -> AppError {
        let role = self
            .connections
            .remove(id)
            .map_or(Role::Peer, |c| c.role());
        self.forget(id);
        match role {
            Role::Controller | Role::Datamanager => {
                error!(%role, "lost connection; coordinator cannot continue");
                self.terminate();
            }
            Role::Peer => warn!(conn = %id, "peer connection closed"),
        }
        AppError::PeerDisconnected { role }
    }

    /// A frame that failed to arrive leaves the stream unusable either way.
    /// Closes, resets and broken pipes all arrive here as `ConnectionClosed`.
    fn receive_failed(&mut self, id: ConnectionId, e: NetError) -> AppError {
        match e {
            NetError::ConnectionClosed(_) => self.connection_lost(id),
            other => {
                warn!(conn = %id, error = %other, "receive failed; dropping connection");
                self.connection_lost(id);
                other.into()
            }
        }
    }

    fn send_failed(&mut self, id: ConnectionId) -> AppError {
        if Some(id) == self.datamanager {
            self.connections.remove(id);
            self.forget(id);
            error!("datamanager unreachable; coordinator cannot continue");
            self.terminate();
            AppError::DatamanagerUnreachable
        } else {
            self.connection_lost(id)
        }
    }

    /// The handshake records its own failure stage before terminating.
    fn terminate(&mut self) {
        if !self.state.is_handshaking() {
            self.state = ProcessState::Terminated;
        }
    }

    fn forget(&mut self, id: ConnectionId) {
        if self.controller == Some(id) {
            self.controller = None;
        }
        if self.datamanager == Some(id) {
            self.datamanager = None;
        }
    }
}

impl Drop for ApplicationProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ApplicationProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationProcess")
            .field("module", &self.config.module_name)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("connections", &self.connections.len())
            .field("deferred", &self.queue.len())
            .field("shm", &self.shm)
            .finish()
    }
}
