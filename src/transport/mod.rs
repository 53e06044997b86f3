//! Request/response transport over agent connections.
//!
//! Every attached connection gets a channel holding its outbound sequence
//! counter, the table of requests still waiting for a response, a frame
//! reassembly buffer and a sequencer thread that runs `execute_in_sequence`
//! batches strictly in arrival order. Unflagged batches from all connections
//! share a fixed pool of batch workers behind a bounded queue; when the queue
//! is full the batch is answered with failures instead of being run.

pub mod handler;
pub mod link;
mod outstanding;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;

use crate::config::AppConfig;
use crate::events::{EventEmitter, AGENT_CONNECTED_EVENT, AGENT_DISCONNECTED_EVENT};
use crate::pools::{AgentMetadata, ConnectionPools, PoolError};
use crate::wire::codec::{CodecError, FrameBuffer, WireCodec};
use crate::wire::command::Answer;
use crate::wire::envelope::{Frame, Request, Response};
use crate::wire::handshake::{accept_startup, rejection_answers, HandshakeError};

pub use handler::{execute_batch, CommandHandler, HandlerContext, ServerCommandHandler};
pub use link::Link;
use outstanding::OutstandingTable;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("agent on connection {connection_id} is unavailable: {reason}")]
    AgentUnavailable { connection_id: u64, reason: String },
    #[error("request {sequence} timed out after {waited_ms}ms")]
    Timeout { sequence: u64, waited_ms: u64 },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("connection {connection_id} is not attached")]
    UnknownConnection { connection_id: u64 },
    #[error("agent {agent_id} has no live connection")]
    UnknownAgent { agent_id: u64 },
    #[error("connection {connection_id} is already attached")]
    AlreadyAttached { connection_id: u64 },
    #[error("request {sequence} lost its resolver")]
    ResolverDropped { sequence: u64 },
    #[error("failed to spawn dispatcher thread: {source}")]
    Spawn { source: io::Error },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

const AGENT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub management_server_id: u64,
    /// Set on every request this side originates.
    pub from_server: bool,
    pub default_timeout: Duration,
    pub batch_workers: usize,
    pub batch_queue_depth: usize,
    /// How long `send_to_agent` waits for an agent without a live
    /// connection to come back.
    pub reconnect_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            management_server_id: 0,
            from_server: true,
            default_timeout: Duration::from_secs(30),
            batch_workers: 4,
            batch_queue_depth: 64,
            reconnect_grace: Duration::ZERO,
        }
    }
}

impl DispatcherConfig {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        let dispatcher = &app_config.dispatcher;
        Self {
            management_server_id: app_config.server.management_server_id,
            from_server: true,
            default_timeout: Duration::from_millis(dispatcher.default_timeout_ms),
            batch_workers: dispatcher.batch_workers,
            batch_queue_depth: dispatcher.batch_queue_depth,
            reconnect_grace: Duration::from_millis(dispatcher.reconnect_grace_ms),
        }
    }
}

/// What `on_receive` did with each complete frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Request { sequence: u64, sequenced: bool },
    Response { sequence: u64, matched: bool },
    Startup { agent_id: u64 },
    StartupRejected { reason: HandshakeError },
    Dropped { reason: String },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Executes inbound batches for one connection and writes their responses.
struct BatchRunner {
    connection_id: u64,
    link: Arc<dyn Link>,
    codec: WireCodec,
    handler: Arc<dyn CommandHandler>,
    from_server: bool,
}

impl BatchRunner {
    fn run(&self, request: Request) {
        let answers = execute_batch(self.handler.as_ref(), &request, self.connection_id);
        self.respond(&request, answers);
    }

    fn respond(&self, request: &Request, answers: Vec<Answer>) {
        let response = Response::for_request(request, answers, self.from_server);
        tracing::debug!(target: "transport::dispatch", connection_id = self.connection_id, "sending {response}");

        let frame = match self.codec.encode_frame(&Frame::Response(response)) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::error!(
                    target: "transport::dispatch",
                    connection_id = self.connection_id,
                    sequence = request.sequence,
                    %error,
                    "failed to encode response"
                );
                return;
            }
        };
        if let Err(error) = self.link.write_frame(&frame) {
            // A partial write leaves the stream unframed for the peer.
            tracing::warn!(
                target: "transport::dispatch",
                connection_id = self.connection_id,
                sequence = request.sequence,
                %error,
                "failed to write response; closing connection"
            );
            self.link.close();
        }
    }
}

type BatchTask = (Arc<BatchRunner>, Request);

/// Worker threads shared by every connection for batches that need no
/// ordering.
struct BatchPool {
    queue: SyncSender<BatchTask>,
}

fn batch_worker(tasks: &Mutex<Receiver<BatchTask>>) {
    loop {
        let task = lock(tasks).recv();
        let Ok((runner, request)) = task else {
            break;
        };
        runner.run(request);
    }
}

impl BatchPool {
    fn start(workers: usize, queue_depth: usize) -> Result<Self, DispatchError> {
        let (queue, tasks) = sync_channel::<BatchTask>(queue_depth);
        let tasks = Arc::new(Mutex::new(tasks));
        for index in 0..workers.max(1) {
            let tasks = Arc::clone(&tasks);
            thread::Builder::new()
                .name(format!("fleetd-batch-{index}"))
                .spawn(move || batch_worker(&tasks))
                .map_err(|source| DispatchError::Spawn { source })?;
        }
        Ok(Self { queue })
    }

    /// Hands the task back when no worker can take it.
    fn submit(&self, task: BatchTask) -> Result<(), BatchTask> {
        self.queue.try_send(task).map_err(|error| match error {
            TrySendError::Full(task) | TrySendError::Disconnected(task) => task,
        })
    }
}

struct Channel {
    link: Arc<dyn Link>,
    agent_id: AtomicU64,
    awaiting_startup: AtomicBool,
    next_sequence: AtomicU64,
    outstanding: OutstandingTable,
    frames: Mutex<FrameBuffer>,
    runner: Arc<BatchRunner>,
    sequencer: Mutex<Option<Sender<Request>>>,
}

impl Channel {
    fn agent_id(&self) -> u64 {
        self.agent_id.load(Ordering::SeqCst)
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    codec: WireCodec,
    handler: Arc<dyn CommandHandler>,
    pools: Arc<ConnectionPools>,
    emitter: Option<Arc<EventEmitter>>,
    channels: Mutex<HashMap<u64, Arc<Channel>>>,
    batches: BatchPool,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        codec: WireCodec,
        handler: Arc<dyn CommandHandler>,
        pools: Arc<ConnectionPools>,
    ) -> Result<Self, DispatchError> {
        let batches = BatchPool::start(config.batch_workers, config.batch_queue_depth)?;
        Ok(Self {
            config,
            codec,
            handler,
            pools,
            emitter: None,
            channels: Mutex::new(HashMap::new()),
            batches,
        })
    }

    pub fn with_emitter(mut self, emitter: Arc<EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config
    }

    pub fn pools(&self) -> &Arc<ConnectionPools> {
        &self.pools
    }

    fn channel(&self, connection_id: u64) -> Result<Arc<Channel>, DispatchError> {
        lock(&self.channels)
            .get(&connection_id)
            .cloned()
            .ok_or(DispatchError::UnknownConnection { connection_id })
    }

    /// Starts serving a connection. Without an `agent_id` the peer must
    /// announce itself with a startup request before anything else.
    pub fn attach(&self, link: Arc<dyn Link>, agent_id: Option<u64>) -> Result<u64, DispatchError> {
        let connection_id = link.id();
        if lock(&self.channels).contains_key(&connection_id) {
            return Err(DispatchError::AlreadyAttached { connection_id });
        }

        let runner = Arc::new(BatchRunner {
            connection_id,
            link: Arc::clone(&link),
            codec: self.codec.clone(),
            handler: Arc::clone(&self.handler),
            from_server: self.config.from_server,
        });
        let (sequencer_tx, sequencer_rx) = channel::<Request>();
        let sequenced_runner = Arc::clone(&runner);
        thread::Builder::new()
            .name(format!("fleetd-seq-{connection_id}"))
            .spawn(move || {
                for request in sequencer_rx {
                    sequenced_runner.run(request);
                }
            })
            .map_err(|source| DispatchError::Spawn { source })?;

        match agent_id {
            Some(agent_id) => {
                if let Some(superseded) =
                    self.pools
                        .register_agent(agent_id, Arc::clone(&link), AgentMetadata::default())
                {
                    self.detach_quietly(superseded, "superseded by a newer connection");
                }
            }
            None => {
                self.pools.register_anonymous(Arc::clone(&link))?;
            }
        }

        let description = link.describe();
        let channel = Arc::new(Channel {
            link,
            agent_id: AtomicU64::new(agent_id.unwrap_or_default()),
            awaiting_startup: AtomicBool::new(agent_id.is_none()),
            next_sequence: AtomicU64::new(1),
            outstanding: OutstandingTable::default(),
            frames: Mutex::new(self.codec.frame_buffer()),
            runner,
            sequencer: Mutex::new(Some(sequencer_tx)),
        });
        lock(&self.channels).insert(connection_id, channel);

        tracing::info!(
            target: "transport::dispatch",
            connection_id,
            agent_id = ?agent_id,
            link = %description,
            "connection attached"
        );
        Ok(connection_id)
    }

    /// Tears a connection down and fails every request still waiting on it
    /// with `AgentUnavailable`. Returns how many requests were failed.
    pub fn detach(&self, connection_id: u64, reason: &str) -> Result<usize, DispatchError> {
        let channel = lock(&self.channels)
            .remove(&connection_id)
            .ok_or(DispatchError::UnknownConnection { connection_id })?;

        let failed = channel.outstanding.fail_all(|_| DispatchError::AgentUnavailable {
            connection_id,
            reason: reason.to_owned(),
        });
        lock(&channel.sequencer).take();
        channel.link.close();
        let agent_id = self.pools.remove_connection(connection_id);

        tracing::info!(
            target: "transport::dispatch",
            connection_id,
            agent_id = ?agent_id,
            failed_requests = failed,
            reason,
            "connection detached"
        );
        if let (Some(agent_id), Some(emitter)) = (agent_id, &self.emitter) {
            emitter.emit_logged(
                AGENT_DISCONNECTED_EVENT,
                Some(json!({"agent_id": agent_id, "connection_id": connection_id, "reason": reason})),
            );
        }
        Ok(failed)
    }

    fn detach_quietly(&self, connection_id: u64, reason: &str) {
        if let Err(error) = self.detach(connection_id, reason) {
            tracing::debug!(target: "transport::dispatch", connection_id, %error, "detach skipped");
        }
    }

    pub fn detach_all(&self, reason: &str) -> usize {
        let ids = self.connection_ids();
        ids.into_iter()
            .filter_map(|connection_id| self.detach(connection_id, reason).ok())
            .sum()
    }

    pub fn connection_ids(&self) -> Vec<u64> {
        lock(&self.channels).keys().copied().collect()
    }

    pub fn outstanding_count(&self, connection_id: u64) -> Result<usize, DispatchError> {
        Ok(self.channel(connection_id)?.outstanding.len())
    }

    pub fn is_outstanding(&self, connection_id: u64, sequence: u64) -> Result<bool, DispatchError> {
        Ok(self.channel(connection_id)?.outstanding.contains(sequence))
    }

    /// Sends `request` and blocks the calling thread until its response
    /// arrives, the deadline passes, or the connection fails. The request is
    /// registered as outstanding before a single byte is written. A failed
    /// write detaches the connection.
    pub fn send(&self, connection_id: u64, mut request: Request, deadline: Instant) -> Result<Response, DispatchError> {
        let channel = self.channel(connection_id)?;
        if channel.awaiting_startup.load(Ordering::SeqCst) {
            return Err(DispatchError::AgentUnavailable {
                connection_id,
                reason: "connection has not completed startup".to_owned(),
            });
        }

        let sequence = channel.next_sequence.fetch_add(1, Ordering::SeqCst);
        request.sequence = sequence;
        request.from_server = self.config.from_server;
        if request.routing.agent_id == 0 {
            request.routing.agent_id = channel.agent_id();
        }
        if request.routing.via_id == 0 {
            request.routing.via_id = request.routing.agent_id;
        }
        if request.routing.management_server_id == 0 {
            request.routing.management_server_id = self.config.management_server_id;
        }
        tracing::debug!(target: "transport::dispatch", connection_id, "sending {request}");

        let frame = self.codec.encode_frame(&Frame::Request(request))?;
        let Some(slot) = channel.outstanding.register(sequence) else {
            return Err(DispatchError::AgentUnavailable {
                connection_id,
                reason: "connection is closing".to_owned(),
            });
        };
        if let Err(error) = channel.link.write_frame(&frame) {
            channel.outstanding.cancel(sequence);
            let reason = format!("write failed: {error}");
            tracing::warn!(target: "transport::dispatch", connection_id, sequence, %error, "write failed; detaching");
            self.detach_quietly(connection_id, &reason);
            return Err(DispatchError::AgentUnavailable { connection_id, reason });
        }

        let outcome = channel.outstanding.wait(sequence, slot, deadline);
        if let Err(DispatchError::Timeout { waited_ms, .. }) = &outcome {
            tracing::warn!(target: "transport::dispatch", connection_id, sequence, waited_ms, "request timed out");
        }
        outcome
    }

    pub fn send_with_timeout(
        &self,
        connection_id: u64,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, DispatchError> {
        self.send(connection_id, request, Instant::now() + timeout)
    }

    /// Routes a request to whatever connection the agent is currently on,
    /// giving a disconnected agent the reconnect grace to come back first.
    pub fn send_to_agent(
        &self,
        agent_id: u64,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, DispatchError> {
        let connection_id = self
            .await_agent(agent_id)
            .ok_or(DispatchError::UnknownAgent { agent_id })?;
        self.send_with_timeout(
            connection_id,
            request,
            timeout.unwrap_or(self.config.default_timeout),
        )
    }

    fn await_agent(&self, agent_id: u64) -> Option<u64> {
        let deadline = Instant::now() + self.config.reconnect_grace;
        let mut logged = false;
        loop {
            let connection_id = self.pools.agents.connection_for(agent_id);
            if connection_id.is_some() || Instant::now() >= deadline {
                return connection_id;
            }
            if !logged {
                tracing::debug!(
                    target: "transport::dispatch",
                    agent_id,
                    grace_ms = self.config.reconnect_grace.as_millis() as u64,
                    "waiting for agent to reconnect"
                );
                logged = true;
            }
            thread::sleep(AGENT_POLL_INTERVAL);
        }
    }

    /// Feeds bytes read from a connection. Complete frames are decoded and
    /// either resolve an outstanding request or are scheduled for execution.
    pub fn on_receive(&self, connection_id: u64, bytes: &[u8]) -> Result<Vec<Inbound>, DispatchError> {
        let channel = self.channel(connection_id)?;

        let mut frames = Vec::new();
        let poisoned = {
            let mut buffer = lock(&channel.frames);
            buffer.extend(bytes);
            let poisoned = loop {
                match buffer.next_frame() {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break None,
                    Err(malformed) => break Some(malformed),
                }
            };
            if poisoned.is_none() && buffer.buffered_len() > 0 {
                tracing::trace!(
                    target: "transport::dispatch",
                    connection_id,
                    buffered = buffer.buffered_len(),
                    "partial frame buffered"
                );
            }
            poisoned
        };
        if let Some(malformed) = poisoned {
            tracing::warn!(target: "transport::dispatch", connection_id, error = %malformed, "unrecoverable framing error");
            self.detach_quietly(connection_id, "unrecoverable framing error");
            return Err(CodecError::MalformedFrame(malformed).into());
        }

        let agent_id = channel.agent_id();
        if agent_id != 0 && !frames.is_empty() {
            if let Err(error) = self.pools.agents.touch_now(agent_id) {
                tracing::debug!(target: "transport::dispatch", connection_id, agent_id, %error, "agent activity not recorded");
            }
        }

        let mut inbound = Vec::with_capacity(frames.len());
        for frame in frames {
            match self.codec.decode_frame(&frame) {
                Ok(Frame::Response(response)) => inbound.push(self.accept_response(&channel, connection_id, response)),
                Ok(Frame::Request(request)) => {
                    let outcome = self.accept_request(&channel, connection_id, request);
                    let rejected = matches!(outcome, Inbound::StartupRejected { .. });
                    inbound.push(outcome);
                    if rejected {
                        break;
                    }
                }
                Err(error @ CodecError::ProtocolVersionMismatch { .. }) => {
                    tracing::error!(target: "transport::dispatch", connection_id, %error, "closing connection");
                    self.detach_quietly(connection_id, "protocol version mismatch");
                    return Err(error.into());
                }
                Err(error) => {
                    tracing::warn!(target: "transport::dispatch", connection_id, %error, "dropping malformed frame");
                    inbound.push(Inbound::Dropped {
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(inbound)
    }

    fn accept_response(&self, channel: &Channel, connection_id: u64, response: Response) -> Inbound {
        let sequence = response.sequence;
        tracing::debug!(target: "transport::dispatch", connection_id, "received {response}");
        let matched = channel.outstanding.resolve(sequence, Ok(response));
        if !matched {
            tracing::warn!(
                target: "transport::dispatch",
                connection_id,
                sequence,
                "response matches no outstanding request; dropped"
            );
        }
        Inbound::Response { sequence, matched }
    }

    fn accept_request(&self, channel: &Channel, connection_id: u64, request: Request) -> Inbound {
        tracing::debug!(target: "transport::dispatch", connection_id, "received {request}");
        if channel.awaiting_startup.load(Ordering::SeqCst) {
            return self.accept_startup_request(channel, connection_id, request);
        }

        let sequence = request.sequence;
        let sequenced = request.execute_in_sequence
            || request.commands.iter().any(|command| command.execute_in_sequence());

        if sequenced {
            let delivered = match lock(&channel.sequencer).as_ref() {
                Some(sequencer) => sequencer.send(request).is_ok(),
                None => false,
            };
            if !delivered {
                tracing::warn!(target: "transport::dispatch", connection_id, sequence, "sequencer stopped; batch dropped");
            }
        } else if let Err((runner, request)) = self.batches.submit((Arc::clone(&channel.runner), request)) {
            tracing::warn!(target: "transport::dispatch", connection_id, sequence, "batch queue full; batch refused");
            let answers = request
                .commands
                .iter()
                .map(|command| Answer::failure(command, "dispatcher is overloaded; retry later"))
                .collect();
            runner.respond(&request, answers);
            return Inbound::Dropped {
                reason: "batch queue is full".to_owned(),
            };
        }

        Inbound::Request { sequence, sequenced }
    }

    fn accept_startup_request(&self, channel: &Channel, connection_id: u64, request: Request) -> Inbound {
        match accept_startup(&request, self.config.management_server_id) {
            Ok((announcement, answer)) => {
                let metadata = AgentMetadata {
                    host_name: announcement.host_name.clone(),
                    agent_version: announcement.agent_version.clone(),
                };
                match self
                    .pools
                    .promote_anonymous_to_agent(connection_id, announcement.agent_id, metadata)
                {
                    Ok(Some(superseded)) => self.detach_quietly(superseded, "superseded by a newer connection"),
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(target: "transport::dispatch", connection_id, %error, "startup promotion failed");
                    }
                }
                // Identity is settled before the agent can see the acceptance.
                channel.agent_id.store(announcement.agent_id, Ordering::SeqCst);
                channel.awaiting_startup.store(false, Ordering::SeqCst);
                channel.runner.respond(&request, vec![answer]);

                tracing::info!(
                    target: "transport::dispatch",
                    connection_id,
                    agent_id = announcement.agent_id,
                    host_name = %announcement.host_name,
                    agent_version = %announcement.agent_version,
                    "agent completed startup"
                );
                if let Some(emitter) = &self.emitter {
                    emitter.emit_logged(
                        AGENT_CONNECTED_EVENT,
                        Some(json!({
                            "agent_id": announcement.agent_id,
                            "connection_id": connection_id,
                            "host_name": announcement.host_name,
                        })),
                    );
                }
                Inbound::Startup {
                    agent_id: announcement.agent_id,
                }
            }
            Err(reason) => {
                channel.runner.respond(&request, rejection_answers(&request, &reason));
                tracing::warn!(target: "transport::dispatch", connection_id, error = %reason, "startup rejected; closing connection");
                self.detach_quietly(connection_id, "startup rejected");
                Inbound::StartupRejected { reason }
            }
        }
    }
}
