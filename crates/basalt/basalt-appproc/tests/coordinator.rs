//! Coordinator scenarios against a scripted controller and datamanager.
//!
//! ```text
//! [Controller thread]  accept -> AppContactDm(port) -> script -> hold until EOF
//! [Datamanager thread] accept -> preamble -> GetShmKey reply -> read pid -> script -> count until EOF
//! [Test thread]        ApplicationProcess::start -> scenario -> drop
//! ```

use basalt_appproc::{AppError, ApplicationProcess, ProcessState};
use basalt_config::ModuleConfig;
use basalt_msg::{
    DatamanagerAssignment, Message, MessageType, ProcessIdAnnouncement, SegmentAnnouncement,
    SegmentKey,
};
use basalt_net::{Endpoint, NetError, Role};
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const PRIMARY: SegmentAnnouncement = SegmentAnnouncement {
    key: SegmentKey(4101),
    size: 8192,
};

struct ScratchDir(PathBuf);

impl ScratchDir {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("basalt_coord_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        Self(dir)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn listener() -> (TcpListener, u16) {
    let l = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let port = l.local_addr().unwrap().port();
    (l, port)
}

fn send(s: &mut TcpStream, msg: Message) {
    msg.write_to(s).expect("script send");
}

fn recv(s: &mut TcpStream) -> Message {
    Message::read_from(s).expect("script recv")
}

/// Count frames of `kind` until the worker hangs up.
fn drain_counting(s: &mut TcpStream, kind: MessageType) -> usize {
    let mut n = 0;
    while let Ok(m) = Message::read_from(s) {
        if m.kind == kind {
            n += 1;
        }
    }
    n
}

fn spawn_controller<F>(l: TcpListener, dm_port: u16, script: F) -> JoinHandle<()>
where
    F: FnOnce(&mut TcpStream) + Send + 'static,
{
    thread::spawn(move || {
        let (mut s, _) = l.accept().expect("controller accept");
        send(&mut s, DatamanagerAssignment { port: dm_port }.to_message());
        script(&mut s);
        drain_counting(&mut s, MessageType::Quit);
    })
}

/// `preamble` runs after the key request arrives and before it is answered.
/// Returns the number of pid announcements the worker sent in total.
fn spawn_datamanager<P, F>(l: TcpListener, preamble: P, script: F) -> JoinHandle<usize>
where
    P: FnOnce(&mut TcpStream) + Send + 'static,
    F: FnOnce(&mut TcpStream) + Send + 'static,
{
    thread::spawn(move || {
        let (mut s, _) = l.accept().expect("datamanager accept");
        let req = recv(&mut s);
        assert_eq!(req.kind, MessageType::GetShmKey);
        preamble(&mut s);
        send(&mut s, PRIMARY.into_message(MessageType::GetShmKey));

        let pid = recv(&mut s);
        assert_eq!(pid.kind, MessageType::SendApplProcId);
        assert_eq!(
            ProcessIdAnnouncement::from_payload(&pid.payload).unwrap().pid,
            std::process::id()
        );

        script(&mut s);
        1 + drain_counting(&mut s, MessageType::SendApplProcId)
    })
}

struct Cluster {
    controller: JoinHandle<()>,
    datamanager: JoinHandle<usize>,
    config: ModuleConfig,
    _dir: ScratchDir,
}

impl Cluster {
    fn new<C, D>(name: &str, controller_script: C, datamanager_script: D) -> Self
    where
        C: FnOnce(&mut TcpStream) + Send + 'static,
        D: FnOnce(&mut TcpStream) + Send + 'static,
    {
        Self::with_preamble(name, controller_script, |_| {}, datamanager_script)
    }

    fn with_preamble<C, P, D>(
        name: &str,
        controller_script: C,
        key_preamble: P,
        datamanager_script: D,
    ) -> Self
    where
        C: FnOnce(&mut TcpStream) + Send + 'static,
        P: FnOnce(&mut TcpStream) + Send + 'static,
        D: FnOnce(&mut TcpStream) + Send + 'static,
    {
        let dir = ScratchDir::new(name);
        let (ctrl_l, ctrl_port) = listener();
        let (dm_l, dm_port) = listener();

        let mut config = ModuleConfig::with_controller("127.0.0.1", ctrl_port);
        config.module_name = name.to_string();
        config.shm_dir = dir.0.clone();

        Self {
            controller: spawn_controller(ctrl_l, dm_port, controller_script),
            datamanager: spawn_datamanager(dm_l, key_preamble, datamanager_script),
            config,
            _dir: dir,
        }
    }

    fn start(&self) -> ApplicationProcess {
        ApplicationProcess::start(self.config.clone()).expect("handshake failed")
    }

    /// Join the scripted peers; returns the pid announcement count.
    fn finish(self) -> usize {
        self.controller.join().expect("controller thread panicked");
        self.datamanager.join().expect("datamanager thread panicked")
    }
}

fn kinds(p: &mut ApplicationProcess) -> Vec<MessageType> {
    std::iter::from_fn(|| p.pop_deferred())
        .map(|m| m.kind)
        .collect()
}

#[test]
fn handshake_reaches_running_with_segment_attached() {
    let cluster = Cluster::new("happy", |_| {}, |_| {});
    let mut p = cluster.start();

    assert_eq!(p.state(), ProcessState::Running);
    let seg = p.shared_memory().expect("primary segment attached");
    assert_eq!(seg.key(), PRIMARY.key);
    assert_eq!(seg.len(), PRIMARY.size as usize);
    seg.write_at(0, b"hello").unwrap();

    assert!(p.controller().is_some());
    assert!(p.datamanager().is_some());
    assert!(!p.has_deferred());

    p.shutdown();
    assert_eq!(p.state(), ProcessState::Terminated);
    drop(p);
    assert_eq!(cluster.finish(), 1, "exactly one pid message expected");
}

#[test]
fn exchange_defers_unrelated_messages_in_order() {
    let cluster = Cluster::new(
        "order",
        |_| {},
        |s| {
            assert_eq!(recv(s).kind, MessageType::Start);
            send(s, Message::new(MessageType::Info, b"A".to_vec()));
            send(s, Message::new(MessageType::Warning, b"B".to_vec()));
            send(s, Message::new(MessageType::Render, b"C".to_vec()));
            send(s, Message::new(MessageType::Finished, b"D".to_vec()));
        },
    );
    let mut p = cluster.start();

    let reply = p
        .exchange_with_datamanager(
            Message::empty(MessageType::Start),
            &[MessageType::Finished],
        )
        .unwrap();
    assert_eq!(reply.kind, MessageType::Finished);
    assert_eq!(reply.payload, b"D");
    assert_eq!(reply.origin, p.datamanager());

    let payloads: Vec<Vec<u8>> = p.queue().iter().map(|m| m.payload.clone()).collect();
    assert_eq!(payloads, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    assert_eq!(
        kinds(&mut p),
        vec![MessageType::Info, MessageType::Warning, MessageType::Render]
    );

    drop(p);
    cluster.finish();
}

#[test]
fn segment_announcements_are_handled_in_place() {
    let extra = SegmentAnnouncement {
        key: SegmentKey(4102),
        size: 4096,
    };
    let cluster = Cluster::new("announce", |_| {}, move |s| {
        assert_eq!(recv(s).kind, MessageType::Parinfo);
        send(s, Message::empty(MessageType::Info));
        send(s, extra.into_message(MessageType::NewSharedSegment));
        send(s, Message::empty(MessageType::Finished));
    });
    let mut p = cluster.start();

    // asking for the announcement type must not make it surface
    let reply = p
        .exchange_with_datamanager(
            Message::empty(MessageType::Parinfo),
            &[MessageType::NewSharedSegment, MessageType::Finished],
        )
        .unwrap();
    assert_eq!(reply.kind, MessageType::Finished);

    assert_eq!(kinds(&mut p), vec![MessageType::Info]);
    let seg = p.segment(extra.key).expect("announced segment attached");
    assert_eq!(seg.len(), extra.size as usize);
    assert_eq!(p.shared_memory().unwrap().key(), PRIMARY.key);
    assert_eq!(p.shared_memory_access().unwrap().mapping_count(), 2);

    drop(p);
    cluster.finish();
}

#[test]
fn wait_skips_announcements_and_serves_queue_first() {
    let extra = SegmentAnnouncement {
        key: SegmentKey(4103),
        size: 1024,
    };
    let cluster = Cluster::new(
        "priority",
        |s| {
            // sits in the socket while the datamanager handshake runs
            send(s, Message::empty(MessageType::Quit));
        },
        move |s| {
            assert_eq!(recv(s).kind, MessageType::Start);
            send(s, extra.into_message(MessageType::NewSharedSegment));
            send(s, Message::empty(MessageType::Info));
            send(s, Message::empty(MessageType::Finished));
        },
    );
    let mut p = cluster.start();

    p.exchange_with_datamanager(
        Message::empty(MessageType::Start),
        &[MessageType::Finished],
    )
    .unwrap();
    assert!(p.has_deferred());

    let first = p.wait_for_control_message().unwrap();
    assert_eq!(first.kind, MessageType::Info, "queued message goes first");
    assert!(!p.has_deferred());

    let second = p.wait_for_control_message().unwrap();
    assert_eq!(second.kind, MessageType::Quit);
    assert_eq!(second.origin, p.controller());
    assert!(p.segment(extra.key).is_some());

    drop(p);
    cluster.finish();
}

#[test]
fn check_for_control_message_attaches_and_keeps_waiting() {
    let extra = SegmentAnnouncement {
        key: SegmentKey(4104),
        size: 2048,
    };
    let cluster = Cluster::new("check", |_| {}, move |s| {
        send(s, extra.into_message(MessageType::NewSharedSegment));
        send(s, Message::empty(MessageType::NewObject));
    });
    let mut p = cluster.start();

    let msg = p
        .check_for_control_message(Duration::from_secs(5))
        .unwrap()
        .expect("a message within the timeout");
    assert_eq!(msg.kind, MessageType::NewObject);
    assert!(p.segment(extra.key).is_some());

    drop(p);
    cluster.finish();
}

#[test]
fn check_for_control_message_times_out() {
    let cluster = Cluster::new("timeout", |_| {}, |_| {});
    let mut p = cluster.start();

    let start = Instant::now();
    let got = p.check_for_control_message(Duration::from_millis(100)).unwrap();
    let elapsed = start.elapsed();

    assert!(got.is_none());
    assert!(elapsed >= Duration::from_millis(90), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "blocked too long: {elapsed:?}");
    assert_eq!(p.state(), ProcessState::Running);

    drop(p);
    cluster.finish();
}

#[test]
fn unknown_message_kind_is_deferred_not_rejected() {
    let cluster = Cluster::new(
        "unknown",
        |_| {},
        |s| {
            assert_eq!(recv(s).kind, MessageType::Render);
            send(s, Message::new(MessageType::Unknown(999), vec![9, 9]));
            send(s, Message::empty(MessageType::Finished));
        },
    );
    let mut p = cluster.start();

    let reply = p
        .exchange_with_datamanager(
            Message::empty(MessageType::Render),
            &[MessageType::Finished],
        )
        .unwrap();
    assert_eq!(reply.kind, MessageType::Finished);
    assert_eq!(p.queue().len(), 1);
    let deferred = p.pop_deferred().unwrap();
    assert_eq!(deferred.kind, MessageType::Unknown(999));
    assert_eq!(deferred.payload, vec![9, 9]);

    drop(p);
    cluster.finish();
}

#[test]
fn datamanager_hangup_during_exchange_is_peer_disconnected() {
    let cluster = Cluster::new(
        "hangup",
        |_| {},
        |s| {
            assert_eq!(recv(s).kind, MessageType::Start);
            s.shutdown(std::net::Shutdown::Both).unwrap();
        },
    );
    let mut p = cluster.start();

    let err = p
        .exchange_with_datamanager(
            Message::empty(MessageType::Start),
            &[MessageType::Finished],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::PeerDisconnected {
            role: Role::Datamanager
        }
    ));
    assert!(err.is_fatal());
    assert!(!p.has_deferred());
    assert_eq!(p.datamanager(), None);
    assert_eq!(p.state(), ProcessState::Terminated);

    assert!(matches!(
        p.send_to_datamanager(&Message::empty(MessageType::Info)),
        Err(AppError::DatamanagerUnreachable)
    ));

    drop(p);
    cluster.finish();
}

#[test]
fn wrong_first_message_is_a_protocol_violation() {
    let dir = ScratchDir::new("violation");
    let (l, port) = listener();
    let controller = thread::spawn(move || {
        let (mut s, _) = l.accept().unwrap();
        send(&mut s, Message::empty(MessageType::Start));
        drain_counting(&mut s, MessageType::Quit);
    });

    let mut config = ModuleConfig::with_controller("127.0.0.1", port);
    config.shm_dir = dir.0.clone();
    let mut p = ApplicationProcess::new(config);
    let err = p.run_handshake().unwrap_err();

    match &err {
        AppError::ProtocolViolation {
            stage,
            expected,
            received,
        } => {
            assert_eq!(*stage, ProcessState::AwaitingDatamanagerAssignment);
            assert_eq!(*expected, MessageType::AppContactDm);
            assert_eq!(*received, MessageType::Start);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_fatal());
    assert_eq!(p.state(), ProcessState::Terminated);
    assert!(p.shared_memory().is_none());

    drop(p);
    controller.join().unwrap();
}

#[test]
fn datamanager_closing_before_key_reply_fails_handshake() {
    let dir = ScratchDir::new("nokey");
    let (ctrl_l, ctrl_port) = listener();
    let (dm_l, dm_port) = listener();
    let controller = spawn_controller(ctrl_l, dm_port, |_| {});
    let datamanager = thread::spawn(move || {
        let (mut s, _) = dm_l.accept().unwrap();
        assert_eq!(recv(&mut s).kind, MessageType::GetShmKey);
        send(&mut s, Message::empty(MessageType::Info));
        // closes without replying
    });

    let mut config = ModuleConfig::with_controller("127.0.0.1", ctrl_port);
    config.shm_dir = dir.0.clone();
    let err = ApplicationProcess::start(config).unwrap_err();
    assert!(matches!(
        err,
        AppError::PeerDisconnected {
            role: Role::Datamanager
        }
    ));

    datamanager.join().unwrap();
    controller.join().unwrap();
}

#[test]
fn controller_refusing_connection_is_fatal() {
    let (l, port) = listener();
    drop(l);
    let mut config = ModuleConfig::with_controller("127.0.0.1", port);
    config.connect_timeout_ms = 1000;

    let err = ApplicationProcess::start(config).unwrap_err();
    assert!(matches!(err, AppError::Net(_)));
    assert!(err.is_fatal());
}

#[test]
fn unresolvable_controller_host_never_dials_this_machine() {
    // anything dialling 0.0.0.0 would land here
    let l = TcpListener::bind("0.0.0.0:0").expect("bind wildcard");
    let port = l.local_addr().unwrap().port();
    l.set_nonblocking(true).unwrap();

    let config = ModuleConfig::with_controller("no-such-host.invalid", port);
    let err = ApplicationProcess::start(config).unwrap_err();

    assert!(
        matches!(&err, AppError::Net(NetError::HostNotFound(h)) if h == "no-such-host.invalid"),
        "{err:?}"
    );
    assert!(err.is_fatal());
    assert_eq!(
        l.accept().map(|_| ()).unwrap_err().kind(),
        io::ErrorKind::WouldBlock
    );
}

#[test]
fn partial_frame_does_not_block_a_timed_check() {
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let frame = Message::new(MessageType::Info, vec![1, 2, 3, 4])
        .to_frame()
        .unwrap();
    let cluster = Cluster::new("partial", |_| {}, move |s| {
        // header promises 4 payload bytes; they follow only on request
        s.write_all(&frame[..8]).unwrap();
        go_rx.recv().unwrap();
        s.write_all(&frame[8..]).unwrap();
    });
    let mut p = cluster.start();

    let start = Instant::now();
    let got = p.check_for_control_message(Duration::from_millis(100)).unwrap();
    let elapsed = start.elapsed();
    assert!(got.is_none());
    assert!(elapsed < Duration::from_secs(2), "blocked too long: {elapsed:?}");
    assert_eq!(p.state(), ProcessState::Running);
    assert!(p.datamanager().is_some());

    go_tx.send(()).unwrap();
    let msg = p
        .check_for_control_message(Duration::from_secs(5))
        .unwrap()
        .expect("rest of the frame arrived");
    assert_eq!(msg.kind, MessageType::Info);
    assert_eq!(msg.payload, vec![1, 2, 3, 4]);
    assert_eq!(msg.origin, p.datamanager());

    drop(p);
    cluster.finish();
}

#[test]
fn announcement_during_key_wait_is_replaced_by_the_assigned_segment() {
    let early = SegmentAnnouncement {
        key: SegmentKey(4105),
        size: 1024,
    };
    let cluster = Cluster::with_preamble(
        "early",
        |_| {},
        move |s| send(s, early.into_message(MessageType::NewSharedSegment)),
        |_| {},
    );
    let p = cluster.start();

    assert_eq!(p.state(), ProcessState::Running);
    assert!(p.segment(early.key).is_none());
    assert_eq!(p.shared_memory().unwrap().key(), PRIMARY.key);
    assert_eq!(p.shared_memory_access().unwrap().mapping_count(), 1);
    assert!(!p.has_deferred());

    drop(p);
    cluster.finish();
}

#[test]
fn losing_a_peer_module_leaves_the_coordinator_running() {
    let (peer_l, peer_port) = listener();
    let peer = thread::spawn(move || {
        let (mut s, _) = peer_l.accept().unwrap();
        assert_eq!(recv(&mut s).kind, MessageType::NewObject);
        send(&mut s, Message::empty(MessageType::Info));
        send(&mut s, Message::empty(MessageType::Finished));
        // unread request in the buffer turns the close into a reset
        s.peek(&mut [0u8; 1]).unwrap();
        drop(s);
    });
    let cluster = Cluster::new(
        "peer",
        |_| {},
        |s| {
            assert_eq!(recv(s).kind, MessageType::Render);
            send(s, Message::empty(MessageType::Finished));
        },
    );
    let mut p = cluster.start();

    let loopback = Endpoint::resolve_numeric("127.0.0.1").unwrap();
    let peer_id = p
        .connections_mut()
        .add(Role::Peer, loopback, peer_port, None)
        .unwrap();

    let reply = p
        .exchange(
            peer_id,
            Message::empty(MessageType::NewObject),
            &[MessageType::Finished],
        )
        .unwrap();
    assert_eq!(reply.origin, Some(peer_id));
    assert_eq!(kinds(&mut p), vec![MessageType::Info]);

    let err = p
        .exchange(
            peer_id,
            Message::new(MessageType::NewObject, vec![0; 32]),
            &[MessageType::Finished],
        )
        .unwrap_err();
    assert!(
        matches!(err, AppError::PeerDisconnected { role: Role::Peer }),
        "{err:?}"
    );
    assert!(!err.is_fatal());
    assert!(p.connections().get(peer_id).is_none());
    assert_eq!(p.state(), ProcessState::Running);
    assert!(p.controller().is_some());
    assert!(p.datamanager().is_some());

    let reply = p
        .exchange_with_datamanager(Message::empty(MessageType::Render), &[MessageType::Finished])
        .unwrap();
    assert_eq!(reply.kind, MessageType::Finished);

    peer.join().unwrap();
    drop(p);
    cluster.finish();
}

#[test]
fn malformed_announcement_is_skipped_without_losing_the_reply() {
    let cluster = Cluster::new(
        "malformed",
        |_| {},
        |s| {
            assert_eq!(recv(s).kind, MessageType::Start);
            send(s, Message::new(MessageType::NewSharedSegment, vec![1, 2, 3]));
            send(s, Message::new(MessageType::Finished, b"ok".to_vec()));
        },
    );
    let mut p = cluster.start();

    let reply = p
        .exchange_with_datamanager(Message::empty(MessageType::Start), &[MessageType::Finished])
        .unwrap();
    assert_eq!(reply.kind, MessageType::Finished);
    assert_eq!(reply.payload, b"ok");
    assert!(!p.has_deferred());
    assert_eq!(p.shared_memory_access().unwrap().mapping_count(), 1);
    assert_eq!(p.state(), ProcessState::Running);

    drop(p);
    cluster.finish();
}

#[test]
fn recv_from_datamanager_bypasses_the_queue() {
    let cluster = Cluster::new(
        "direct",
        |s| send(s, Message::empty(MessageType::Quit)),
        |s| {
            assert_eq!(recv(s).kind, MessageType::Start);
            send(s, Message::empty(MessageType::Render));
            send(s, Message::empty(MessageType::Finished));
            send(s, Message::new(MessageType::Info, b"direct".to_vec()));
        },
    );
    let mut p = cluster.start();

    p.exchange_with_datamanager(Message::empty(MessageType::Start), &[MessageType::Finished])
        .unwrap();
    assert_eq!(p.queue().len(), 1);

    let direct = p.recv_from_datamanager().unwrap();
    assert_eq!(direct.kind, MessageType::Info);
    assert_eq!(direct.payload, b"direct");
    assert_eq!(direct.origin, p.datamanager());
    assert_eq!(p.queue().len(), 1, "queued message untouched");

    assert_eq!(p.wait_for_control_message().unwrap().kind, MessageType::Render);
    assert_eq!(p.wait_for_control_message().unwrap().kind, MessageType::Quit);

    drop(p);
    cluster.finish();
}
