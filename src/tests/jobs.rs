use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::compensation::{CompensationFrame, DelegateRegistry};
use crate::orchestrator::jobs::{
    register_builtin_operations, Job, JobError, JobManager, JobManagerConfig, JobServices, JobState, JobStore,
    MemoryJobStore, OperationRegistry, ResourceLifecycle, ResourceRef, ResourceRegistry, ResourceType, Resume,
    SledJobStore, StaticPeerDirectory, TrackedResourceLifecycle, WorkError, CREATE_VOLUME_OPERATION,
    DESTROY_VOLUME_DELEGATE, INLINE_OPERATION, START_VM_OPERATION, STOP_VM_DELEGATE,
};
use crate::wire::command::{Command, PingCommand};
use crate::wire::envelope::{Request, Routing};
use crate::storage::open_temp_storage;

use super::support::{agent_pair, AgentPair, CONSOLE_PORT, MANAGEMENT_SERVER_ID};

const AGENT_ID: u64 = 42;
const DEAD_PEER: u64 = 9;
const LIVE_PEER: u64 = 5;
const SETTLE: Duration = Duration::from_secs(5);

struct Fixture {
    pair: AgentPair,
    manager: JobManager,
    operations: Arc<OperationRegistry>,
    vms: Arc<TrackedResourceLifecycle>,
    volumes: Arc<TrackedResourceLifecycle>,
}

fn fixture(store: Arc<dyn JobStore>) -> Fixture {
    let pair = agent_pair(Some(AGENT_ID));
    let delegates = Arc::new(DelegateRegistry::new());
    let operations = Arc::new(OperationRegistry::new());
    register_builtin_operations(&operations, &delegates, Arc::clone(&pair.server))
        .expect("builtins should register");

    let vms = Arc::new(TrackedResourceLifecycle::new("error"));
    let volumes = Arc::new(TrackedResourceLifecycle::new("error"));
    let resources = Arc::new(ResourceRegistry::new());
    resources
        .register(ResourceType::VirtualMachine, Arc::clone(&vms) as Arc<dyn ResourceLifecycle>)
        .expect("lifecycle should register");
    resources
        .register(ResourceType::Volume, Arc::clone(&volumes) as Arc<dyn ResourceLifecycle>)
        .expect("lifecycle should register");

    let services = JobServices::new(store)
        .with_delegates(delegates)
        .with_operations(Arc::clone(&operations))
        .with_resources(resources)
        .with_dispatcher(Arc::clone(&pair.server));
    let manager = JobManager::new(
        JobManagerConfig {
            management_server_id: MANAGEMENT_SERVER_ID,
            worker_threads: 2,
        },
        services,
    )
    .expect("manager should start");

    Fixture {
        pair,
        manager,
        operations,
        vms,
        volumes,
    }
}

fn vm(id: &str) -> ResourceRef {
    ResourceRef::new(ResourceType::VirtualMachine, id)
}

fn start_vm_params(vm_name: &str) -> serde_json::Value {
    json!({
        "agent_id": AGENT_ID,
        "vm_name": vm_name,
        "cpus": 2,
        "memory_mb": 2048,
        "boot_volume": "/primary/root-1",
    })
}

fn orphan(owner_server: u64, operation: &str, state: JobState, resource: ResourceRef) -> Job {
    let mut job = Job::new("admin", resource, operation, None, owner_server);
    if state != JobState::Queued {
        job.transition(state).expect("orphan state should be reachable");
    }
    job
}

#[test]
fn vm_start_completes_against_agent() {
    let fx = fixture(Arc::new(MemoryJobStore::new()));

    let job_id = fx
        .manager
        .submit_operation("admin", vm("vm-1"), START_VM_OPERATION, Some(start_vm_params("vm-1")))
        .expect("submit should pass");
    let snapshot = fx
        .manager
        .wait_until_settled(job_id, SETTLE)
        .expect("job should exist");

    assert_eq!(snapshot.state, JobState::Completed);
    assert_eq!(
        snapshot.result,
        Some(json!({ "vm_name": "vm-1", "console_port": CONSOLE_PORT }))
    );
    assert_eq!(snapshot.pending_compensation, 0);
    assert_eq!(fx.pair.fake.log(), vec!["start-vm:vm-1".to_owned()]);
    let state = fx.vms.state("vm-1").expect("vm should be tracked");
    assert_eq!(state.name, "running");
    assert!(!state.transient);
}

#[test]
fn refused_volume_fails_without_compensation() {
    let fx = fixture(Arc::new(MemoryJobStore::new()));
    fx.pair.fake.refuse_volumes();

    let params = json!({ "agent_id": AGENT_ID, "pool": "primary", "name": "data-1", "size_bytes": 1024 });
    let job_id = fx
        .manager
        .submit_operation(
            "admin",
            ResourceRef::new(ResourceType::Volume, "data-1"),
            CREATE_VOLUME_OPERATION,
            Some(params),
        )
        .expect("submit should pass");
    let snapshot = fx
        .manager
        .wait_until_settled(job_id, SETTLE)
        .expect("job should exist");

    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("agent rejected the command: storage pool is full")
    );
    assert!(snapshot.warnings.is_empty());
    assert!(fx.pair.fake.log().is_empty());
    let state = fx.volumes.state("data-1").expect("volume should be tracked");
    assert_eq!(state.name, "error");
    assert!(!state.transient);
}

#[test]
fn cancelled_work_that_still_returns_ok_is_unwound() {
    let fx = fixture(Arc::new(MemoryJobStore::new()));
    fx.vms.set_state("vm-c", "starting", true);

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let job_id = fx
        .manager
        .submit("admin", vm("vm-c"), move |context| {
            context.push_compensation(STOP_VM_DELEGATE, json!({ "agent_id": AGENT_ID, "vm_name": "vm-c" }))?;
            let _ = started_tx.send(());
            let deadline = Instant::now() + SETTLE;
            while !context.is_cancelled() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(Some(json!({ "vm_name": "vm-c" })))
        })
        .expect("submit should pass");

    started_rx.recv_timeout(SETTLE).expect("work should start");
    fx.manager.cancel(job_id).expect("cancel should pass");
    let snapshot = fx
        .manager
        .wait_until_settled(job_id, SETTLE)
        .expect("job should exist");

    assert_eq!(snapshot.state, JobState::Cancelled);
    assert_eq!(snapshot.result, None);
    assert_eq!(snapshot.pending_compensation, 0);
    assert!(snapshot.warnings.is_empty());
    assert_eq!(fx.pair.fake.log(), vec!["stop-vm:vm-c".to_owned()]);
    assert_eq!(fx.vms.state("vm-c").expect("vm should be tracked").name, "error");
}

#[test]
fn failure_unwinds_frames_newest_first_and_settles_resource() {
    let fx = fixture(Arc::new(MemoryJobStore::new()));
    fx.vms.set_state("vm-a", "starting", true);

    let job_id = fx
        .manager
        .submit("admin", vm("vm-a"), |context| {
            context.push_compensation(STOP_VM_DELEGATE, json!({ "agent_id": AGENT_ID, "vm_name": "vm-a" }))?;
            context.push_compensation(
                DESTROY_VOLUME_DELEGATE,
                json!({ "agent_id": AGENT_ID, "pool": "primary", "path": "/primary/vol-a" }),
            )?;
            Err(WorkError::failed("hypervisor refused the domain"))
        })
        .expect("submit should pass");
    let snapshot = fx
        .manager
        .wait_until_settled(job_id, SETTLE)
        .expect("job should exist");

    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.error.as_deref(), Some("hypervisor refused the domain"));
    assert!(snapshot.warnings.is_empty());
    assert_eq!(snapshot.pending_compensation, 0);
    assert_eq!(
        fx.pair.fake.log(),
        vec!["destroy-volume:/primary/vol-a".to_owned(), "stop-vm:vm-a".to_owned()]
    );
    let settled = fx.vms.state("vm-a").expect("vm should be tracked");
    assert_eq!(settled.name, "error");
    assert!(!settled.transient);
}

#[test]
fn unreachable_agent_during_unwind_becomes_warning() {
    let fx = fixture(Arc::new(MemoryJobStore::new()));

    let job_id = fx
        .manager
        .submit("admin", vm("vm-b"), |context| {
            context.push_compensation(STOP_VM_DELEGATE, json!({ "agent_id": 77, "vm_name": "vm-b" }))?;
            context.push_compensation(STOP_VM_DELEGATE, json!({ "agent_id": AGENT_ID, "vm_name": "vm-b" }))?;
            Err(WorkError::failed("boot volume missing"))
        })
        .expect("submit should pass");
    let snapshot = fx
        .manager
        .wait_until_settled(job_id, SETTLE)
        .expect("job should exist");

    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.warnings.len(), 1);
    assert!(snapshot.warnings[0].contains("agent 77 has no live connection"));
    assert_eq!(fx.pair.fake.log(), vec!["stop-vm:vm-b".to_owned()]);
}

#[test]
fn recovery_unwinds_fails_and_cancels_orphans() {
    let (_dir, storage) = open_temp_storage();
    let store: Arc<dyn JobStore> = Arc::new(SledJobStore::new(Arc::new(storage)));

    let mut running = orphan(DEAD_PEER, INLINE_OPERATION, JobState::InProgress, vm("vm-orphan"));
    running.compensation = vec![CompensationFrame {
        index: 0,
        delegate_key: STOP_VM_DELEGATE.to_owned(),
        context: json!({ "agent_id": AGENT_ID, "vm_name": "vm-orphan" }),
    }];
    let queued = orphan(DEAD_PEER, INLINE_OPERATION, JobState::Queued, vm("vm-never"));
    let guarded = orphan(LIVE_PEER, INLINE_OPERATION, JobState::InProgress, vm("vm-busy"));
    let finished = orphan(DEAD_PEER, INLINE_OPERATION, JobState::Cancelled, vm("vm-done"));
    for job in [&running, &queued, &guarded, &finished] {
        store.create(job).expect("seed job should persist");
    }

    let fx = fixture(Arc::clone(&store));
    let report = fx
        .manager
        .recover(&StaticPeerDirectory::new([LIVE_PEER]))
        .expect("recovery should pass");

    assert_eq!(report.resumed, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.skipped_live_peer, 1);
    assert_eq!(fx.pair.fake.log(), vec!["stop-vm:vm-orphan".to_owned()]);

    let failed = fx.manager.query_status(running.id).expect("job should exist");
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(
        failed.error.as_deref(),
        Some("management server 9 stopped before the job finished")
    );
    assert_eq!(failed.pending_compensation, 0);

    let cancelled = fx.manager.query_status(queued.id).expect("job should exist");
    assert_eq!(cancelled.state, JobState::Cancelled);

    let untouched = store
        .get(guarded.id)
        .expect("lookup should pass")
        .expect("job should exist");
    assert_eq!(untouched.state, JobState::InProgress);
    assert_eq!(untouched.management_server_id, LIVE_PEER);
}

#[test]
fn recovery_restarts_resumable_operations() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let mut job = orphan(
        DEAD_PEER,
        "host.drain",
        JobState::InProgress,
        ResourceRef::new(ResourceType::Host, "h-1"),
    );
    job.compensation = vec![CompensationFrame {
        index: 0,
        delegate_key: STOP_VM_DELEGATE.to_owned(),
        context: json!({ "agent_id": AGENT_ID, "vm_name": "vm-d" }),
    }];
    store.create(&job).expect("seed job should persist");

    let fx = fixture(Arc::clone(&store));
    fx.operations
        .register("host.drain", Resume::Restart, |context| {
            let ping = Request::new(Routing::default(), vec![Command::Ping(PingCommand { host_id: 1 })]);
            let response = context.send_to_agent(AGENT_ID, ping, None)?;
            Ok(Some(json!({ "drained": response.all_succeeded() })))
        })
        .expect("operation should register");

    let report = fx
        .manager
        .recover(&StaticPeerDirectory::new(Vec::new()))
        .expect("recovery should pass");
    assert_eq!(report.resumed, 1);

    let snapshot = fx
        .manager
        .wait_until_settled(job.id, SETTLE)
        .expect("job should exist");
    assert_eq!(snapshot.state, JobState::Completed);
    assert_eq!(snapshot.result, Some(json!({ "drained": true })));
    assert_eq!(snapshot.pending_compensation, 0);
    assert!(fx.pair.fake.log().is_empty());

    let adopted = store
        .get(job.id)
        .expect("lookup should pass")
        .expect("job should exist");
    assert_eq!(adopted.management_server_id, MANAGEMENT_SERVER_ID);
}

#[test]
fn restarted_work_replays_journaled_frames_once() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let stop = json!({ "agent_id": AGENT_ID, "vm_name": "vm-2" });
    let mut job = orphan(DEAD_PEER, "vm.rebuild", JobState::InProgress, vm("vm-2"));
    job.compensation = vec![CompensationFrame {
        index: 0,
        delegate_key: STOP_VM_DELEGATE.to_owned(),
        context: stop.clone(),
    }];
    store.create(&job).expect("seed job should persist");

    let fx = fixture(Arc::clone(&store));
    fx.operations
        .register("vm.rebuild", Resume::Restart, move |context| {
            context.push_compensation(STOP_VM_DELEGATE, stop.clone())?;
            Err(WorkError::failed("rebuild image missing"))
        })
        .expect("operation should register");

    let report = fx
        .manager
        .recover(&StaticPeerDirectory::new(Vec::new()))
        .expect("recovery should pass");
    assert_eq!(report.resumed, 1);

    let snapshot = fx
        .manager
        .wait_until_settled(job.id, SETTLE)
        .expect("job should exist");
    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.pending_compensation, 0);
    assert_eq!(fx.pair.fake.log(), vec!["stop-vm:vm-2".to_owned()]);
}

#[test]
fn running_builtin_orphans_fail_while_queued_ones_run() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let mut running = orphan(DEAD_PEER, START_VM_OPERATION, JobState::InProgress, vm("vm-2"));
    running.params = Some(start_vm_params("vm-2"));
    let mut queued = orphan(DEAD_PEER, START_VM_OPERATION, JobState::Queued, vm("vm-5"));
    queued.params = Some(start_vm_params("vm-5"));
    for job in [&running, &queued] {
        store.create(job).expect("seed job should persist");
    }

    let fx = fixture(Arc::clone(&store));
    fx.vms.set_state("vm-2", "starting", true);
    let report = fx
        .manager
        .recover(&StaticPeerDirectory::new(Vec::new()))
        .expect("recovery should pass");
    assert_eq!(report.resumed, 1);
    assert_eq!(report.failed, 1);

    let failed = fx.manager.query_status(running.id).expect("job should exist");
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(
        failed.error.as_deref(),
        Some("management server 9 stopped before the job finished")
    );
    assert_eq!(fx.vms.state("vm-2").expect("vm should be tracked").name, "error");

    let started = fx
        .manager
        .wait_until_settled(queued.id, SETTLE)
        .expect("job should exist");
    assert_eq!(started.state, JobState::Completed);
    assert_eq!(fx.pair.fake.log(), vec!["start-vm:vm-5".to_owned()]);
}

#[test]
fn purge_removes_only_expired_terminal_jobs() {
    let fx = fixture(Arc::new(MemoryJobStore::new()));
    let done = fx
        .manager
        .submit("admin", vm("vm-3"), |_context| Ok(None))
        .expect("submit should pass");
    fx.manager
        .wait_until_settled(done, SETTLE)
        .expect("job should exist");

    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let busy = fx
        .manager
        .submit("admin", vm("vm-4"), move |_context| {
            let _ = release_rx.recv_timeout(SETTLE);
            Ok(None)
        })
        .expect("submit should pass");

    assert_eq!(
        fx.manager
            .purge_finished(chrono::Duration::hours(1))
            .expect("purge should pass"),
        0
    );
    thread::sleep(Duration::from_millis(10));
    assert_eq!(
        fx.manager
            .purge_finished(chrono::Duration::zero())
            .expect("purge should pass"),
        1
    );
    assert!(matches!(
        fx.manager.query_status(done),
        Err(JobError::NotFound { .. })
    ));
    assert!(fx.manager.query_status(busy).is_ok());

    let _ = release_tx.send(());
    let settled = fx
        .manager
        .wait_until_settled(busy, SETTLE)
        .expect("job should exist");
    assert_eq!(settled.state, JobState::Completed);
}
