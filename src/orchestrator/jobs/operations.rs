use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::compensation::DelegateRegistry;
use crate::transport::Dispatcher;
use crate::wire::command::{
    AnswerBody, Command, CreateVolumeCommand, DestroyVolumeCommand, StartVmCommand, StopVmCommand,
};
use crate::wire::envelope::{Request, Response, Routing};

use super::{JobContext, JobError, WorkError, WorkResult};

pub type OperationFn = Arc<dyn Fn(&mut JobContext) -> WorkResult + Send + Sync>;

pub const START_VM_OPERATION: &str = "vm.start";
pub const CREATE_VOLUME_OPERATION: &str = "volume.create";
pub const STOP_VM_DELEGATE: &str = "vm.stop";
pub const DESTROY_VOLUME_DELEGATE: &str = "volume.destroy";

/// What recovery may do with an operation that was already running when
/// its management server died.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    /// Run it again from the top with its journaled compensation frames.
    Restart,
    /// Unwind its journaled frames and fail it.
    Never,
}

#[derive(Clone)]
struct RegisteredOperation {
    work: OperationFn,
    resume: Resume,
}

/// Named job bodies. Jobs submitted by operation key can be picked up again
/// by recovery because their work is looked up, not captured.
#[derive(Default)]
pub struct OperationRegistry {
    operations: RwLock<BTreeMap<String, RegisteredOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, key: impl Into<String>, resume: Resume, operation: F) -> Result<(), JobError>
    where
        F: Fn(&mut JobContext) -> WorkResult + Send + Sync + 'static,
    {
        let key = key.into();
        let mut operations = match self.operations.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if operations.contains_key(&key) {
            return Err(JobError::DuplicateRegistration { key });
        }
        operations.insert(
            key,
            RegisteredOperation {
                work: Arc::new(operation),
                resume,
            },
        );
        Ok(())
    }

    fn lookup(&self, key: &str) -> Option<RegisteredOperation> {
        let operations = match self.operations.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        operations.get(key).cloned()
    }

    pub fn get(&self, key: &str) -> Option<OperationFn> {
        self.lookup(key).map(|operation| operation.work)
    }

    /// The operation's work, if it may be restarted after it was cut off
    /// mid-flight.
    pub fn resumable(&self, key: &str) -> Option<OperationFn> {
        self.lookup(key)
            .filter(|operation| operation.resume == Resume::Restart)
            .map(|operation| operation.work)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let operations = match self.operations.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        operations.keys().cloned().collect()
    }
}

#[derive(Clone, Debug, Deserialize)]
struct StartVmParams {
    agent_id: u64,
    vm_name: String,
    cpus: u32,
    memory_mb: u64,
    boot_volume: String,
}

#[derive(Clone, Debug, Deserialize)]
struct CreateVolumeParams {
    agent_id: u64,
    pool: String,
    name: String,
    size_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StopVmContext {
    agent_id: u64,
    vm_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DestroyVolumeContext {
    agent_id: u64,
    pool: String,
    path: String,
}

fn single_command(command: Command) -> Request {
    Request::new(Routing::default(), vec![command])
}

fn accepted(response: &Response) -> Result<(), WorkError> {
    match response.first_failure() {
        Some(answer) => Err(WorkError::AgentRejected(answer.details.clone())),
        None => Ok(()),
    }
}

fn start_vm(context: &mut JobContext) -> WorkResult {
    let params: StartVmParams = context.params_as()?;
    context.check_cancelled()?;
    context.mark_resource("starting", true)?;

    let response = context.send_to_agent(
        params.agent_id,
        single_command(Command::StartVm(StartVmCommand {
            vm_name: params.vm_name.clone(),
            cpus: params.cpus,
            memory_mb: params.memory_mb,
            boot_volume: params.boot_volume,
        })),
        None,
    )?;
    accepted(&response)?;
    context.push_compensation(
        STOP_VM_DELEGATE,
        StopVmContext {
            agent_id: params.agent_id,
            vm_name: params.vm_name.clone(),
        },
    )?;
    context.check_cancelled()?;
    context.mark_resource("running", false)?;

    let console_port = response.answers.iter().find_map(|answer| match answer.body {
        AnswerBody::VmStarted { console_port } => Some(console_port),
        _ => None,
    });
    Ok(Some(json!({ "vm_name": params.vm_name, "console_port": console_port })))
}

fn create_volume(context: &mut JobContext) -> WorkResult {
    let params: CreateVolumeParams = context.params_as()?;
    context.check_cancelled()?;
    context.mark_resource("creating", true)?;

    let response = context.send_to_agent(
        params.agent_id,
        single_command(Command::CreateVolume(CreateVolumeCommand {
            pool: params.pool.clone(),
            name: params.name.clone(),
            size_bytes: params.size_bytes,
        })),
        None,
    )?;
    accepted(&response)?;

    let (path, size_bytes) = response
        .answers
        .iter()
        .find_map(|answer| match &answer.body {
            AnswerBody::VolumeCreated { path, size_bytes } => Some((path.clone(), *size_bytes)),
            _ => None,
        })
        .ok_or_else(|| WorkError::failed("agent did not report the created volume"))?;
    context.push_compensation(
        DESTROY_VOLUME_DELEGATE,
        DestroyVolumeContext {
            agent_id: params.agent_id,
            pool: params.pool,
            path: path.clone(),
        },
    )?;
    context.check_cancelled()?;
    context.mark_resource("ready", false)?;

    Ok(Some(json!({ "path": path, "size_bytes": size_bytes })))
}

fn undo_with(dispatcher: &Dispatcher, agent_id: u64, command: Command) -> Result<(), String> {
    let response = dispatcher
        .send_to_agent(agent_id, single_command(command), None)
        .map_err(|error| error.to_string())?;
    match response.first_failure() {
        Some(answer) => Err(answer.details.clone()),
        None => Ok(()),
    }
}

fn decode_context<T: DeserializeOwned>(context: &Value) -> Result<T, String> {
    serde_json::from_value(context.clone()).map_err(|error| format!("bad compensation context: {error}"))
}

/// Registers the VM and volume operations together with the compensation
/// delegates that undo them on the agent. Neither operation is idempotent on
/// the agent, so recovery never restarts them.
pub fn register_builtin_operations(
    operations: &OperationRegistry,
    delegates: &DelegateRegistry,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), JobError> {
    operations.register(START_VM_OPERATION, Resume::Never, start_vm)?;
    operations.register(CREATE_VOLUME_OPERATION, Resume::Never, create_volume)?;

    let stop_dispatcher = Arc::clone(&dispatcher);
    delegates
        .register(STOP_VM_DELEGATE, move |context: &Value| {
            let context: StopVmContext = decode_context(context)?;
            undo_with(
                &stop_dispatcher,
                context.agent_id,
                Command::StopVm(StopVmCommand {
                    vm_name: context.vm_name,
                    force: true,
                }),
            )
        })?;

    delegates
        .register(DESTROY_VOLUME_DELEGATE, move |context: &Value| {
            let context: DestroyVolumeContext = decode_context(context)?;
            undo_with(
                &dispatcher,
                context.agent_id,
                Command::DestroyVolume(DestroyVolumeCommand {
                    pool: context.pool,
                    path: context.path,
                }),
            )
        })?;

    Ok(())
}
