use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::compensation::{
    CompensationError, CompensationFrame, CompensationJournal, CompensationStack, SavePoint,
};
use crate::transport::Dispatcher;
use crate::wire::envelope::{Request, Response};

use super::{Job, JobStore, ResourceRef, ResourceRegistry, WorkError};

pub type WorkResult = Result<Option<Value>, WorkError>;

/// Body of an ad-hoc job. The returned value becomes the job result.
pub type JobWork = Box<dyn FnOnce(&mut JobContext) -> WorkResult + Send>;

/// Cooperative cancellation flag shared by the manager and a running job.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Mirrors a job's pending compensation frames into its stored record.
pub(crate) struct JobJournal {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) job_id: Uuid,
}

impl CompensationJournal for JobJournal {
    fn record(&self, frames: &[CompensationFrame]) -> Result<(), CompensationError> {
        self.store
            .update(self.job_id, &mut |job: &mut Job| {
                job.compensation = frames.to_vec();
                Ok(())
            })
            .map(|_| ())
            .map_err(|error| CompensationError::Journal {
                message: error.to_string(),
            })
    }
}

/// Everything a running job may touch: its parameters, its compensation
/// stack, its cancellation signal, its resource's lifecycle and the agent
/// transport.
pub struct JobContext {
    job_id: Uuid,
    resource: ResourceRef,
    params: Option<Value>,
    cancellation: CancellationToken,
    compensation: CompensationStack,
    resources: Arc<ResourceRegistry>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: Uuid,
        resource: ResourceRef,
        params: Option<Value>,
        cancellation: CancellationToken,
        compensation: CompensationStack,
        resources: Arc<ResourceRegistry>,
        dispatcher: Option<Arc<Dispatcher>>,
    ) -> Self {
        Self {
            job_id,
            resource,
            params,
            cancellation,
            compensation,
            resources,
            dispatcher,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, WorkError> {
        let params = self.params.clone().unwrap_or(Value::Null);
        serde_json::from_value(params).map_err(|error| WorkError::InvalidParams(error.to_string()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Suspension point: bails out with `WorkError::Cancelled` once the job
    /// has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), WorkError> {
        if self.is_cancelled() {
            return Err(WorkError::Cancelled);
        }
        Ok(())
    }

    /// Records the state the job moved its resource into. A resource left
    /// in a transient state is force-failed if the job does not complete.
    pub fn mark_resource(&self, state: &str, transient: bool) -> Result<(), WorkError> {
        self.resources
            .enter_state(&self.resource, state, transient)
            .map_err(|message| {
                WorkError::failed(format!("cannot record {} as {state}: {message}", self.resource))
            })
    }

    pub fn push_compensation(
        &mut self,
        delegate_key: &str,
        context: impl Serialize,
    ) -> Result<SavePoint, WorkError> {
        Ok(self.compensation.push(delegate_key, context)?)
    }

    pub fn compensation(&mut self) -> &mut CompensationStack {
        &mut self.compensation
    }

    pub(crate) fn into_compensation(self) -> CompensationStack {
        self.compensation
    }

    /// Sends a request to an agent, checking for cancellation first.
    pub fn send_to_agent(
        &self,
        agent_id: u64,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, WorkError> {
        self.check_cancelled()?;
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| WorkError::failed("no agent transport is configured"))?;
        Ok(dispatcher.send_to_agent(agent_id, request, timeout)?)
    }
}
