use std::io;
use std::process;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use fleetd::compensation::DelegateRegistry;
use fleetd::config::AppConfig;
use fleetd::events::EventEmitter;
use fleetd::heartbeat::{Heartbeat, HeartbeatConfig, HEARTBEAT_EVENT};
use fleetd::logging;
use fleetd::orchestrator::jobs::{
    register_builtin_operations, JobManager, JobManagerConfig, JobServices, JobStore, OperationRegistry,
    ResourceRegistry, ResourceType, SledJobStore, StoragePeerDirectory, TrackedResourceLifecycle,
};
use fleetd::pools::ConnectionPools;
use fleetd::server::{PersistentConnection, TcpServer};
use fleetd::shutdown::ShutdownHooks;
use fleetd::storage::StorageFacade;
use fleetd::transport::{DispatchError, Dispatcher, DispatcherConfig, Link, ServerCommandHandler};
use fleetd::wire::codec::WireCodec;

const READ_CHUNK_BYTES: usize = 64 * 1024;
const JOB_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let log_level = or_exit("logging initialization error", logging::init(&app_config.logging));
    tracing::debug!(target: "main::config", level = ?log_level, "logging initialized");

    let storage = Arc::new(or_exit(
        "storage initialization error",
        StorageFacade::initialize(&app_config),
    ));
    tracing::info!(
        target: "main::storage",
        engine = storage.engine().as_str(),
        path = %storage.data_path().display(),
        "storage ready"
    );
    let codec = or_exit(
        "wire codec configuration error",
        WireCodec::from_app_config(&app_config),
    );
    tracing::info!(
        target: "main::wire",
        max_envelope_size_bytes = codec.max_envelope_size_bytes(),
        "wire codec initialized"
    );

    let server = or_exit("server startup error", TcpServer::from_app_config(&app_config));
    let bound_addr = or_exit("server startup error", server.local_addr());
    tracing::info!(
        target: "main::server",
        bind_address = %bound_addr,
        management_server_id = app_config.server.management_server_id,
        tls_enabled = app_config.server.tls_enabled,
        "{} v{} listening for agents",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let emitter = Arc::new(EventEmitter::new());
    let pools = Arc::new(ConnectionPools::new());
    let dispatcher = or_exit(
        "dispatcher startup error",
        Dispatcher::new(
            DispatcherConfig::from_app_config(&app_config),
            codec,
            Arc::new(ServerCommandHandler),
            Arc::clone(&pools),
        ),
    );
    let dispatcher = Arc::new(dispatcher.with_emitter(Arc::clone(&emitter)));

    let jobs = Arc::new(build_job_manager(
        &app_config,
        &storage,
        &dispatcher,
        &emitter,
    ));
    let peers = Arc::new(StoragePeerDirectory::new(
        Arc::clone(&storage),
        chrono::Duration::milliseconds(app_config.heartbeat.peer_ttl_ms as i64),
    ));
    match peers.live_peers_at(Utc::now()) {
        Ok(live) => tracing::info!(target: "main::jobs", live_peers = ?live, "peer heartbeats loaded"),
        Err(error) => tracing::warn!(target: "main::jobs", %error, "failed to list peer heartbeats"),
    }

    register_heartbeat_listeners(&app_config, &emitter, &peers, Arc::downgrade(&jobs));
    let mut heartbeat = or_exit(
        "heartbeat configuration error",
        Heartbeat::new(Arc::clone(&emitter), HeartbeatConfig::from_app_config(&app_config)),
    );
    or_exit("heartbeat startup error", heartbeat.start());

    let shutdown_hooks = or_exit("failed to install shutdown hooks", ShutdownHooks::install());
    tracing::info!(target: "main::shutdown", "shutdown hooks installed for SIGINT/SIGTERM");

    let poll_interval = Duration::from_millis(app_config.dispatcher.poll_interval_ms.max(1));
    let startup_timeout = chrono::Duration::milliseconds(app_config.wire.startup_timeout_ms as i64);
    let mut read_buffer = vec![0_u8; READ_CHUNK_BYTES];

    let recovery = spawn_recovery(Arc::clone(&jobs), Arc::clone(&peers));
    while !shutdown_hooks.is_triggered() {
        accept_pending(&server, &dispatcher);

        for connection in server.active_connections() {
            pump_connection(&server, &dispatcher, &connection, &mut read_buffer);
        }

        for connection_id in pools.anonymous.expired(Utc::now(), startup_timeout) {
            tracing::warn!(target: "main::server", connection_id, "no startup announcement in time");
            close_connection(&server, &dispatcher, connection_id, "startup handshake timed out");
        }

        thread::sleep(poll_interval);
    }

    tracing::info!(target: "main::shutdown", "shutdown signal received, starting graceful shutdown");
    if let Err(error) = heartbeat.stop() {
        tracing::warn!(target: "main::shutdown", %error, "heartbeat did not stop cleanly");
    }
    if let Some(recovery) = recovery {
        if recovery.is_finished() && recovery.join().is_err() {
            tracing::error!(target: "main::jobs", "job recovery panicked");
        }
    }
    jobs.shutdown(JOB_DRAIN_TIMEOUT);
    let failed = dispatcher.detach_all("management server shutting down");
    let open_sockets = server.connection_count();
    server.shutdown_all_connections();
    tracing::info!(
        target: "main::shutdown",
        failed_requests = failed,
        open_sockets,
        "agent connections closed"
    );

    emitter.begin_shutdown();
    if emitter.wait_for_idle(LISTENER_DRAIN_TIMEOUT) {
        tracing::info!(target: "main::shutdown", "all running listeners completed before timeout");
    } else {
        tracing::warn!(target: "main::shutdown", "listener drain timeout reached; continuing shutdown");
    }

    if let Err(error) = storage.flush() {
        tracing::error!(target: "main::shutdown", %error, "failed to flush storage");
    }
    tracing::info!(target: "main::shutdown", "shutdown completed");
}

fn build_job_manager(
    app_config: &AppConfig,
    storage: &Arc<StorageFacade>,
    dispatcher: &Arc<Dispatcher>,
    emitter: &Arc<EventEmitter>,
) -> JobManager {
    let delegates = Arc::new(DelegateRegistry::new());
    let operations = Arc::new(OperationRegistry::new());
    or_exit(
        "operation registration error",
        register_builtin_operations(&operations, &delegates, Arc::clone(dispatcher)),
    );

    let resources = Arc::new(ResourceRegistry::new());
    for resource_type in [ResourceType::VirtualMachine, ResourceType::Volume] {
        or_exit(
            "resource lifecycle registration error",
            resources.register(resource_type, Arc::new(TrackedResourceLifecycle::new("error"))),
        );
    }

    let store: Arc<dyn JobStore> = Arc::new(SledJobStore::new(Arc::clone(storage)));
    let services = JobServices::new(store)
        .with_delegates(delegates)
        .with_operations(operations)
        .with_resources(resources)
        .with_dispatcher(Arc::clone(dispatcher))
        .with_emitter(Arc::clone(emitter));

    or_exit(
        "job manager startup error",
        JobManager::new(JobManagerConfig::from_app_config(app_config), services),
    )
}

/// Recovery runs beside the accept loop so agents of orphaned jobs can
/// reconnect while their compensations wait out the reconnect grace.
fn spawn_recovery(jobs: Arc<JobManager>, peers: Arc<StoragePeerDirectory>) -> Option<thread::JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("fleetd-recovery".to_owned())
        .spawn(move || match jobs.recover(peers.as_ref()) {
            Ok(report) => tracing::info!(target: "main::jobs", ?report, "recovered unfinished jobs"),
            Err(error) => tracing::error!(target: "main::jobs", %error, "job recovery failed"),
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(error) => {
            tracing::error!(target: "main::jobs", %error, "failed to spawn job recovery thread");
            None
        }
    }
}

fn register_heartbeat_listeners(
    app_config: &AppConfig,
    emitter: &EventEmitter,
    peers: &Arc<StoragePeerDirectory>,
    jobs: Weak<JobManager>,
) {
    let own_id = app_config.server.management_server_id;
    let liveness = Arc::clone(peers);
    emitter.on(HEARTBEAT_EVENT, move |_event| {
        liveness
            .record_heartbeat(own_id, Utc::now())
            .map_err(|error| error.to_string())
    });

    let purge_every = app_config.jobs.purge_every_ticks.max(1);
    let retention = chrono::Duration::seconds(app_config.jobs.retention_secs as i64);
    emitter.on_async(HEARTBEAT_EVENT, move |event| {
        let tick = event
            .payload
            .as_ref()
            .and_then(|payload| payload.get("tick"))
            .and_then(Value::as_u64)
            .unwrap_or_default();
        if tick % purge_every != 0 {
            return Ok(());
        }
        let Some(jobs) = jobs.upgrade() else {
            return Ok(());
        };
        jobs.purge_finished(retention)
            .map(|_| ())
            .map_err(|error| error.to_string())
    });
}

fn accept_pending(server: &TcpServer, dispatcher: &Dispatcher) {
    loop {
        match server.try_accept_persistent() {
            Ok(Some(connection)) => {
                let connection_id = connection.id();
                tracing::info!(
                    target: "main::server",
                    connection_id,
                    peer_addr = %connection.peer_addr(),
                    "accepted agent connection"
                );
                if let Err(error) = dispatcher.attach(connection, None) {
                    tracing::error!(target: "main::server", connection_id, %error, "failed to attach connection");
                    server.drop_connection(connection_id);
                }
            }
            Ok(None) => return,
            Err(error) => {
                tracing::error!(target: "main::server", %error, "accept failed");
                return;
            }
        }
    }
}

fn pump_connection(
    server: &TcpServer,
    dispatcher: &Dispatcher,
    connection: &PersistentConnection,
    buffer: &mut [u8],
) {
    let connection_id = connection.id();
    loop {
        match connection.try_read(buffer) {
            Ok(0) => {
                close_connection(server, dispatcher, connection_id, "agent closed the connection");
                return;
            }
            Ok(read) => match dispatcher.on_receive(connection_id, &buffer[..read]) {
                Ok(_) => {}
                Err(DispatchError::UnknownConnection { .. }) => {
                    server.drop_connection(connection_id);
                    return;
                }
                Err(error) => {
                    tracing::warn!(target: "main::server", connection_id, %error, "closing connection");
                    close_connection(server, dispatcher, connection_id, "fatal protocol error");
                    return;
                }
            },
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                tracing::warn!(target: "main::server", connection_id, %error, "read failed");
                close_connection(server, dispatcher, connection_id, "read failed");
                return;
            }
        }
    }
}

fn close_connection(server: &TcpServer, dispatcher: &Dispatcher, connection_id: u64, reason: &str) {
    if let Err(error) = dispatcher.detach(connection_id, reason) {
        tracing::debug!(target: "main::server", connection_id, %error, "connection already detached");
    }
    server.drop_connection(connection_id);
}

fn or_exit<T, E: std::fmt::Display>(context: &str, result: Result<T, E>) -> T {
    result.unwrap_or_else(|error| {
        eprintln!("{context}: {error}");
        process::exit(2);
    })
}

fn load_config_or_exit() -> AppConfig {
    or_exit(
        "configuration error",
        AppConfig::load_with_discovery(std::env::args().skip(1)),
    )
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: fleetd is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;31m";
    const DIM_GRAY: &str = "\x1b[2;90m";

    println!(
        "{BANNER_COLOR}{} v{}{RESET}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    println!("{DIM_GRAY}{}{RESET}", env!("CARGO_PKG_DESCRIPTION"));
    println!();
}
