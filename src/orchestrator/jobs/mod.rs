//! Durable records for long-running operations and the manager that drives
//! them through `Queued -> InProgress -> {Completed, Failed, Cancelled}`.

mod context;
mod manager;
mod operations;
mod peers;
mod resources;
mod store;

use std::fmt;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::compensation::{CompensationError, CompensationFrame};
use crate::storage::StorageError;
use crate::transport::DispatchError;

pub use context::{CancellationToken, JobContext, JobWork, WorkResult};
pub use manager::{JobManager, JobManagerConfig, JobServices, RecoveryReport};
pub use operations::{
    register_builtin_operations, OperationFn, OperationRegistry, Resume, CREATE_VOLUME_OPERATION,
    DESTROY_VOLUME_DELEGATE, START_VM_OPERATION, STOP_VM_DELEGATE,
};
pub use peers::{PeerDirectory, StaticPeerDirectory, StoragePeerDirectory};
pub use resources::{Reconciliation, ResourceLifecycle, ResourceRegistry, TrackedResourceLifecycle};
pub use store::{JobStore, MemoryJobStore, SledJobStore};

/// Operation key recorded for jobs submitted with an ad-hoc closure. Such
/// jobs cannot be resumed after a restart.
pub const INLINE_OPERATION: &str = "inline";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::InProgress)
                | (Self::Queued, Self::Cancelled)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    VirtualMachine,
    Volume,
    Host,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VirtualMachine => "virtual_machine",
            Self::Volume => "volume",
            Self::Host => "host",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: ResourceType,
    pub resource_id: String,
}

impl ResourceRef {
    pub fn new(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type.as_str(), self.resource_id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner: String,
    pub resource: ResourceRef,
    pub operation: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub state: JobState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Compensation frames not yet executed, oldest first.
    #[serde(default)]
    pub compensation: Vec<CompensationFrame>,
    pub management_server_id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        owner: impl Into<String>,
        resource: ResourceRef,
        operation: impl Into<String>,
        params: Option<Value>,
        management_server_id: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            resource,
            operation: operation.into(),
            params,
            state: JobState::Queued,
            result: None,
            error: None,
            warnings: Vec::new(),
            compensation: Vec::new(),
            management_server_id,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Moves the job to `next`, leaving it untouched when the move is illegal.
    pub fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidStateTransition {
                job_id: self.id,
                from: self.state,
                to: next,
            });
        }

        let now = Utc::now();
        self.state = next;
        if next == JobState::InProgress {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            owner: self.owner.clone(),
            resource: self.resource.clone(),
            operation: self.operation.clone(),
            state: self.state,
            result: self.result.clone(),
            error: self.error.clone(),
            warnings: self.warnings.clone(),
            pending_compensation: self.compensation.len(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Caller-facing view of a job.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub owner: String,
    pub resource: ResourceRef,
    pub operation: String,
    pub state: JobState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub pending_compensation: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {job_id} not found")]
    NotFound { job_id: Uuid },
    #[error("job {job_id} already exists")]
    AlreadyExists { job_id: Uuid },
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Compensation(#[from] CompensationError),
    #[error("job record could not be (de)serialized: {0}")]
    Record(#[from] serde_json::Error),
    #[error("operation '{operation}' is not registered")]
    UnknownOperation { operation: String },
    #[error("'{key}' is already registered")]
    DuplicateRegistration { key: String },
    #[error("job worker pool is stopped")]
    WorkerPoolStopped,
    #[error("failed to spawn job worker: {source}")]
    WorkerSpawn { source: io::Error },
}

/// Why a job's work did not complete.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid job parameters: {0}")]
    InvalidParams(String),
    #[error("agent rejected the command: {0}")]
    AgentRejected(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Compensation(#[from] CompensationError),
    #[error("job was cancelled")]
    Cancelled,
    #[error("job work panicked")]
    Panicked,
}

impl WorkError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
