use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::pools::ConnectionPools;
use crate::transport::{CommandHandler, Dispatcher, DispatcherConfig, HandlerContext, Link, ServerCommandHandler};
use crate::wire::codec::{CodecConfig, WireCodec};
use crate::wire::command::{Answer, AnswerBody, Command};

pub(crate) const MANAGEMENT_SERVER_ID: u64 = 1;
pub(crate) const SERVER_CONNECTION_ID: u64 = 100;
pub(crate) const AGENT_CONNECTION_ID: u64 = 200;
pub(crate) const CONSOLE_PORT: u16 = 5901;

/// In-memory link. Every written frame is handed straight to the peer
/// dispatcher; without a peer, frames are counted and dropped.
pub(crate) struct PipeLink {
    id: u64,
    peer: Mutex<Option<(Weak<Dispatcher>, u64)>>,
    closed: AtomicBool,
    written: AtomicUsize,
}

impl PipeLink {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
            written: AtomicUsize::new(0),
        })
    }

    pub(crate) fn connect(&self, peer: &Arc<Dispatcher>, peer_connection_id: u64) {
        *self.peer.lock().expect("peer lock") = Some((Arc::downgrade(peer), peer_connection_id));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn frames_written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

impl Link for PipeLink {
    fn id(&self) -> u64 {
        self.id
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        self.written.fetch_add(1, Ordering::SeqCst);

        let peer = self.peer.lock().expect("peer lock").clone();
        if let Some((peer, connection_id)) = peer {
            if let Some(peer) = peer.upgrade() {
                let _ = peer.on_receive(connection_id, frame);
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Agent-side command handler that pretends to drive a hypervisor and keeps
/// a log of what it was asked to do.
#[derive(Default)]
pub(crate) struct FakeAgent {
    log: Mutex<Vec<String>>,
    refuse_volumes: AtomicBool,
}

impl FakeAgent {
    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }

    pub(crate) fn refuse_volumes(&self) {
        self.refuse_volumes.store(true, Ordering::SeqCst);
    }

    fn record(&self, entry: String) {
        self.log.lock().expect("log lock").push(entry);
    }
}

impl CommandHandler for FakeAgent {
    fn handle(&self, command: &Command, _context: &HandlerContext) -> Answer {
        match command {
            Command::Ping(_) => Answer::success(command, "pong"),
            Command::StartVm(cmd) => {
                self.record(format!("start-vm:{}", cmd.vm_name));
                Answer::with_body(
                    command,
                    true,
                    "running",
                    AnswerBody::VmStarted {
                        console_port: CONSOLE_PORT,
                    },
                )
            }
            Command::StopVm(cmd) => {
                self.record(format!("stop-vm:{}", cmd.vm_name));
                Answer::success(command, "stopped")
            }
            Command::CreateVolume(cmd) => {
                if self.refuse_volumes.load(Ordering::SeqCst) {
                    return Answer::failure(command, "storage pool is full");
                }
                let path = format!("/{}/{}", cmd.pool, cmd.name);
                self.record(format!("create-volume:{path}"));
                Answer::with_body(
                    command,
                    true,
                    "created",
                    AnswerBody::VolumeCreated {
                        path,
                        size_bytes: cmd.size_bytes,
                    },
                )
            }
            Command::DestroyVolume(cmd) => {
                self.record(format!("destroy-volume:{}", cmd.path));
                Answer::success(command, "destroyed")
            }
            Command::Maintenance(cmd) => {
                if cmd.host_id == 0 {
                    return Answer::failure(command, "unknown host");
                }
                self.record(format!("begin:{}", cmd.host_id));
                thread::sleep(Duration::from_millis(30));
                self.record(format!("end:{}", cmd.host_id));
                Answer::success(command, "maintenance toggled")
            }
            _ => Answer::unsupported(command),
        }
    }
}

pub(crate) fn codec() -> WireCodec {
    WireCodec::new(CodecConfig::default())
}

pub(crate) fn dispatcher_config(from_server: bool) -> DispatcherConfig {
    DispatcherConfig {
        management_server_id: MANAGEMENT_SERVER_ID,
        from_server,
        default_timeout: Duration::from_secs(2),
        ..DispatcherConfig::default()
    }
}

pub(crate) fn server_dispatcher_with(config: DispatcherConfig) -> Arc<Dispatcher> {
    let dispatcher = Dispatcher::new(
        config,
        codec(),
        Arc::new(ServerCommandHandler),
        Arc::new(ConnectionPools::new()),
    )
    .expect("dispatcher should start");
    Arc::new(dispatcher)
}

pub(crate) fn server_dispatcher() -> Arc<Dispatcher> {
    server_dispatcher_with(dispatcher_config(true))
}

/// A management-server dispatcher and an agent dispatcher joined by a pair
/// of pipes.
pub(crate) struct AgentPair {
    pub(crate) server: Arc<Dispatcher>,
    pub(crate) agent: Arc<Dispatcher>,
    pub(crate) fake: Arc<FakeAgent>,
    pub(crate) server_link: Arc<PipeLink>,
}

/// With `Some(agent_id)` the server side starts out knowing the agent; with
/// `None` the agent still has to announce itself.
pub(crate) fn agent_pair(known_agent: Option<u64>) -> AgentPair {
    connect_agent(server_dispatcher(), known_agent)
}

/// Joins a fresh fake agent to an existing management-server dispatcher.
pub(crate) fn connect_agent(server: Arc<Dispatcher>, known_agent: Option<u64>) -> AgentPair {
    let fake = Arc::new(FakeAgent::default());
    let agent = Dispatcher::new(
        dispatcher_config(false),
        codec(),
        Arc::clone(&fake) as Arc<dyn CommandHandler>,
        Arc::new(ConnectionPools::new()),
    )
    .expect("agent dispatcher should start");
    let agent = Arc::new(agent);

    let server_link = PipeLink::new(SERVER_CONNECTION_ID);
    let agent_link = PipeLink::new(AGENT_CONNECTION_ID);
    server_link.connect(&agent, AGENT_CONNECTION_ID);
    agent_link.connect(&server, SERVER_CONNECTION_ID);

    server
        .attach(Arc::clone(&server_link) as Arc<dyn Link>, known_agent)
        .expect("server side should attach");
    agent
        .attach(agent_link as Arc<dyn Link>, Some(MANAGEMENT_SERVER_ID))
        .expect("agent side should attach");

    AgentPair {
        server,
        agent,
        fake,
        server_link,
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// passes.
pub(crate) fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
