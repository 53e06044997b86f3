use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::compensation::{CompensationFrame, CompensationJournal, CompensationStack, DelegateRegistry};
use crate::config::AppConfig;
use crate::events::{EventEmitter, JOB_STATE_CHANGED_EVENT};
use crate::transport::Dispatcher;

use super::context::JobJournal;
use super::{
    CancellationToken, Job, JobContext, JobError, JobSnapshot, JobState, JobStore, JobWork,
    OperationFn, OperationRegistry, PeerDirectory, ResourceRef, ResourceRegistry, WorkError,
    WorkResult, INLINE_OPERATION,
};

type Task = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobManagerConfig {
    pub management_server_id: u64,
    pub worker_threads: usize,
}

impl JobManagerConfig {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self {
            management_server_id: app_config.server.management_server_id,
            worker_threads: app_config.jobs.worker_threads,
        }
    }
}

/// Collaborators the manager drives jobs through.
pub struct JobServices {
    pub store: Arc<dyn JobStore>,
    pub delegates: Arc<DelegateRegistry>,
    pub operations: Arc<OperationRegistry>,
    pub resources: Arc<ResourceRegistry>,
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub emitter: Option<Arc<EventEmitter>>,
}

impl JobServices {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            delegates: Arc::new(DelegateRegistry::new()),
            operations: Arc::new(OperationRegistry::new()),
            resources: Arc::new(ResourceRegistry::new()),
            dispatcher: None,
            emitter: None,
        }
    }

    pub fn with_delegates(mut self, delegates: Arc<DelegateRegistry>) -> Self {
        self.delegates = delegates;
        self
    }

    pub fn with_operations(mut self, operations: Arc<OperationRegistry>) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_resources(mut self, resources: Arc<ResourceRegistry>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped_live_peer: usize,
}

enum Work {
    Inline(JobWork),
    Operation(OperationFn),
}

impl Work {
    fn run(self, context: &mut JobContext) -> WorkResult {
        match self {
            Self::Inline(work) => work(context),
            Self::Operation(operation) => operation(context),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Core {
    config: JobManagerConfig,
    services: JobServices,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    stopping: AtomicBool,
}

impl Core {
    fn publish(&self, job: &Job, previous: Option<JobState>) {
        let Some(emitter) = &self.services.emitter else {
            return;
        };
        emitter.emit_logged(
            JOB_STATE_CHANGED_EVENT,
            Some(json!({
                "job_id": job.id.to_string(),
                "owner": job.owner,
                "resource": job.resource,
                "operation": job.operation,
                "from": previous.map(JobState::as_str),
                "to": job.state.as_str(),
            })),
        );
    }

    fn forget(&self, job_id: Uuid) {
        lock(&self.running).remove(&job_id);
    }

    fn journal(&self, job_id: Uuid) -> Arc<dyn CompensationJournal> {
        Arc::new(JobJournal {
            store: Arc::clone(&self.services.store),
            job_id,
        })
    }

    fn run(&self, job_id: Uuid, work: Work, frames: Vec<CompensationFrame>, token: CancellationToken) {
        if self.stopping.load(Ordering::SeqCst) {
            tracing::info!(target: "jobs::manager", %job_id, "manager stopping; job left for recovery");
            self.forget(job_id);
            return;
        }

        let mut previous = None;
        let started = self.services.store.update(job_id, &mut |job: &mut Job| {
            previous = Some(job.state);
            if job.state == JobState::InProgress {
                return Ok(());
            }
            job.transition(JobState::InProgress)
        });
        let job = match started {
            Ok(job) => job,
            Err(error) => {
                tracing::info!(target: "jobs::manager", %job_id, %error, "job did not start");
                self.forget(job_id);
                return;
            }
        };
        if previous != Some(JobState::InProgress) {
            self.publish(&job, previous);
        }
        tracing::debug!(target: "jobs::manager", %job_id, operation = %job.operation, "job started");

        let stack = CompensationStack::restore(Arc::clone(&self.services.delegates), frames, self.journal(job_id));
        let mut context = JobContext::new(
            job_id,
            job.resource.clone(),
            job.params.clone(),
            token,
            stack,
            Arc::clone(&self.services.resources),
            self.services.dispatcher.clone(),
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| work.run(&mut context))).unwrap_or_else(|_| {
            tracing::error!(target: "jobs::manager", %job_id, "job work panicked");
            Err(WorkError::Panicked)
        });

        self.finish(&job, context.into_compensation(), outcome);
        self.forget(job_id);
    }

    fn finish(&self, job: &Job, mut stack: CompensationStack, outcome: WorkResult) {
        let job_id = job.id;
        let mut before = None;
        let settled = match outcome {
            Ok(result) => {
                let mut cancelled = false;
                let completed = self.services.store.update(job_id, &mut |job: &mut Job| {
                    before = Some(job.state);
                    if job.state == JobState::Cancelled {
                        cancelled = true;
                        return Ok(());
                    }
                    job.result = result.clone();
                    job.transition(JobState::Completed)
                });
                let warnings = match &completed {
                    Ok(_) if cancelled => {
                        tracing::info!(target: "jobs::manager", %job_id, "work finished after cancel; unwinding");
                        self.unwind_and_reconcile(job_id, &job.resource, stack)
                    }
                    Ok(_) => {
                        stack.clear();
                        stack
                            .take_journal_errors()
                            .iter()
                            .map(ToString::to_string)
                            .collect()
                    }
                    Err(_) => Vec::new(),
                };
                match completed {
                    Ok(_) if !warnings.is_empty() => {
                        self.services.store.update(job_id, &mut |job: &mut Job| {
                            job.warnings.extend(warnings.iter().cloned());
                            Ok(())
                        })
                    }
                    completed => completed,
                }
            }
            Err(error) => {
                let warnings = self.unwind_and_reconcile(job_id, &job.resource, stack);
                let signalled = matches!(error, WorkError::Cancelled);
                let message = error.to_string();
                self.services.store.update(job_id, &mut |job: &mut Job| {
                    before = Some(job.state);
                    job.warnings.extend(warnings.iter().cloned());
                    match job.state {
                        JobState::Cancelled => {
                            if !signalled && job.error.is_none() {
                                job.error = Some(message.clone());
                            }
                            Ok(())
                        }
                        _ if signalled => job.transition(JobState::Cancelled),
                        _ => {
                            job.error = Some(message.clone());
                            job.transition(JobState::Failed)
                        }
                    }
                })
            }
        };

        match settled {
            Ok(updated) => {
                match updated.state {
                    JobState::Completed => {
                        tracing::info!(target: "jobs::manager", %job_id, "job completed");
                    }
                    JobState::Failed => tracing::warn!(
                        target: "jobs::manager",
                        %job_id,
                        error = updated.error.as_deref().unwrap_or_default(),
                        warnings = updated.warnings.len(),
                        "job failed"
                    ),
                    state => tracing::info!(target: "jobs::manager", %job_id, %state, "job settled"),
                }
                if Some(updated.state) != before {
                    self.publish(&updated, before);
                }
            }
            Err(error) => {
                tracing::error!(target: "jobs::manager", %job_id, %error, "failed to record job outcome");
            }
        }
    }

    /// Unwinds the stack and forces the resource out of any transient state.
    /// Every problem comes back as a warning for the job record.
    fn unwind_and_reconcile(&self, job_id: Uuid, resource: &ResourceRef, mut stack: CompensationStack) -> Vec<String> {
        let report = stack.unwind();
        let mut warnings = report
            .failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        if let Err(message) = self.services.resources.reconcile(resource, job_id) {
            tracing::error!(target: "jobs::manager", %job_id, %resource, %message, "resource reconciliation failed");
            warnings.push(format!("failed to reconcile {resource}: {message}"));
        }
        warnings
    }
}

/// Runs jobs on a fixed pool of worker threads and keeps their records
/// moving through the state machine.
pub struct JobManager {
    core: Arc<Core>,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn worker_loop(receiver: &Mutex<Receiver<Task>>) {
    loop {
        let task = lock(receiver).recv();
        let Ok(task) = task else {
            break;
        };
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!(target: "jobs::manager", "job task panicked outside of job work");
        }
    }
}

impl JobManager {
    pub fn new(config: JobManagerConfig, services: JobServices) -> Result<Self, JobError> {
        let (sender, receiver) = channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::new();
        for index in 0..config.worker_threads.max(1) {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("fleetd-job-{index}"))
                .spawn(move || worker_loop(&receiver))
                .map_err(|source| JobError::WorkerSpawn { source })?;
            workers.push(handle);
        }
        tracing::debug!(target: "jobs::manager", workers = workers.len(), "job worker pool started");

        Ok(Self {
            core: Arc::new(Core {
                config,
                services,
                running: Mutex::new(HashMap::new()),
                stopping: AtomicBool::new(false),
            }),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> JobManagerConfig {
        self.core.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.core.services.store
    }

    /// Persists a queued job and hands `work` to the worker pool. The job id
    /// is returned before the work starts.
    pub fn submit<F>(&self, owner: &str, resource: ResourceRef, work: F) -> Result<Uuid, JobError>
    where
        F: FnOnce(&mut JobContext) -> WorkResult + Send + 'static,
    {
        let job = Job::new(
            owner,
            resource,
            INLINE_OPERATION,
            None,
            self.core.config.management_server_id,
        );
        self.enqueue(job, Work::Inline(Box::new(work)))
    }

    /// Like `submit`, with the work looked up by operation key so recovery
    /// can resume it after a restart.
    pub fn submit_operation(
        &self,
        owner: &str,
        resource: ResourceRef,
        operation: &str,
        params: Option<Value>,
    ) -> Result<Uuid, JobError> {
        let work = self
            .core
            .services
            .operations
            .get(operation)
            .ok_or_else(|| JobError::UnknownOperation {
                operation: operation.to_owned(),
            })?;
        let job = Job::new(
            owner,
            resource,
            operation,
            params,
            self.core.config.management_server_id,
        );
        self.enqueue(job, Work::Operation(work))
    }

    fn enqueue(&self, job: Job, work: Work) -> Result<Uuid, JobError> {
        if lock(&self.sender).is_none() {
            return Err(JobError::WorkerPoolStopped);
        }

        let job_id = job.id;
        self.core.services.store.create(&job)?;
        tracing::info!(
            target: "jobs::manager",
            %job_id,
            owner = %job.owner,
            resource = %job.resource,
            operation = %job.operation,
            "job queued"
        );
        self.core.publish(&job, None);

        if let Err(error) = self.schedule(job_id, work, Vec::new()) {
            let recorded = self.core.services.store.update(job_id, &mut |job: &mut Job| {
                job.error = Some(error.to_string());
                job.transition(JobState::Cancelled)
            });
            if let Err(record_error) = recorded {
                tracing::error!(
                    target: "jobs::manager",
                    %job_id,
                    error = %record_error,
                    "failed to cancel unscheduled job"
                );
            }
            return Err(error);
        }
        Ok(job_id)
    }

    fn schedule(&self, job_id: Uuid, work: Work, frames: Vec<CompensationFrame>) -> Result<(), JobError> {
        let token = CancellationToken::new();
        lock(&self.core.running).insert(job_id, token.clone());

        let core = Arc::clone(&self.core);
        let task: Task = Box::new(move || core.run(job_id, work, frames, token));
        let sent = match lock(&self.sender).as_ref() {
            Some(sender) => sender.send(task).is_ok(),
            None => false,
        };
        if !sent {
            self.core.forget(job_id);
            return Err(JobError::WorkerPoolStopped);
        }
        Ok(())
    }

    /// Marks a queued or running job cancelled and signals its work. Running
    /// work stops at its next cancellation check.
    pub fn cancel(&self, job_id: Uuid) -> Result<JobSnapshot, JobError> {
        let mut previous = None;
        let cancelled = self.core.services.store.update(job_id, &mut |job: &mut Job| {
            previous = Some(job.state);
            job.transition(JobState::Cancelled)
        });

        match cancelled {
            Ok(job) => {
                if let Some(token) = lock(&self.core.running).get(&job_id) {
                    token.cancel();
                }
                tracing::info!(target: "jobs::manager", %job_id, "job cancelled");
                self.core.publish(&job, previous);
                Ok(job.snapshot())
            }
            Err(error) => {
                if matches!(error, JobError::InvalidStateTransition { .. }) {
                    tracing::error!(target: "jobs::manager", %job_id, %error, "cancel rejected");
                }
                Err(error)
            }
        }
    }

    pub fn query_status(&self, job_id: Uuid) -> Result<JobSnapshot, JobError> {
        self.core
            .services
            .store
            .get(job_id)?
            .map(|job| job.snapshot())
            .ok_or(JobError::NotFound { job_id })
    }

    pub fn list_by_owner(&self, owner: &str) -> Result<Vec<JobSnapshot>, JobError> {
        Ok(self
            .core
            .services
            .store
            .list_by_owner(owner)?
            .iter()
            .map(Job::snapshot)
            .collect())
    }

    pub fn list_by_resource(&self, resource: &ResourceRef) -> Result<Vec<JobSnapshot>, JobError> {
        Ok(self
            .core
            .services
            .store
            .list_by_resource(resource)?
            .iter()
            .map(Job::snapshot)
            .collect())
    }

    /// True while the job's work (including its unwinding) is scheduled or
    /// running on this manager.
    pub fn is_running(&self, job_id: Uuid) -> bool {
        lock(&self.core.running).contains_key(&job_id)
    }

    /// Polls until the job is terminal and its work has returned, or the
    /// timeout passes. Returns the last observed snapshot either way.
    pub fn wait_until_settled(&self, job_id: Uuid, timeout: Duration) -> Result<JobSnapshot, JobError> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.query_status(job_id)?;
            if (snapshot.state.is_terminal() && !self.is_running(job_id)) || Instant::now() >= deadline {
                return Ok(snapshot);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Removes terminal jobs that finished more than `retention` ago.
    pub fn purge_finished(&self, retention: chrono::Duration) -> Result<usize, JobError> {
        let cutoff = Utc::now() - retention;
        let store = &self.core.services.store;

        let mut purged = 0;
        for job in store.list()? {
            let expired = job.is_terminal() && job.finished_at.is_some_and(|finished| finished < cutoff);
            if expired && !self.is_running(job.id) && store.remove(job.id)? {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(target: "jobs::manager", purged, "purged finished jobs");
        }
        Ok(purged)
    }

    /// Adopts unfinished jobs left behind by a management server that is no
    /// longer alive (including an earlier run of this one). Queued jobs with
    /// a registered operation are scheduled; running ones are restarted with
    /// their journaled compensation only if the operation is registered as
    /// restartable. The rest are failed after unwinding, or cancelled if they
    /// never started.
    pub fn recover(&self, peers: &dyn PeerDirectory) -> Result<RecoveryReport, JobError> {
        let own_id = self.core.config.management_server_id;
        let store = &self.core.services.store;
        let mut report = RecoveryReport::default();

        let mut orphans = store.list_by_state(JobState::InProgress)?;
        orphans.extend(store.list_by_state(JobState::Queued)?);

        for job in orphans {
            if self.is_running(job.id) {
                continue;
            }
            let previous_owner = job.management_server_id;
            if previous_owner != own_id && peers.is_alive(previous_owner) {
                report.skipped_live_peer += 1;
                continue;
            }

            let job_id = job.id;
            let operations = &self.core.services.operations;
            let resumable = match job.state {
                JobState::InProgress => operations.resumable(&job.operation),
                _ => operations.get(&job.operation),
            };
            match resumable {
                Some(operation) => {
                    let adopted = store.update(job_id, &mut |job: &mut Job| {
                        job.management_server_id = own_id;
                        Ok(())
                    })?;
                    tracing::info!(target: "jobs::manager", %job_id, previous_owner, state = %adopted.state, "resuming orphaned job");
                    self.schedule(job_id, Work::Operation(operation), adopted.compensation)?;
                    report.resumed += 1;
                }
                None if job.state == JobState::InProgress => {
                    let stack = CompensationStack::restore(
                        Arc::clone(&self.core.services.delegates),
                        job.compensation.clone(),
                        self.core.journal(job_id),
                    );
                    let warnings = self.core.unwind_and_reconcile(job_id, &job.resource, stack);
                    let failed = store.update(job_id, &mut |job: &mut Job| {
                        job.management_server_id = own_id;
                        job.warnings.extend(warnings.iter().cloned());
                        job.error = Some(format!(
                            "management server {previous_owner} stopped before the job finished"
                        ));
                        job.transition(JobState::Failed)
                    })?;
                    tracing::warn!(target: "jobs::manager", %job_id, previous_owner, "failed orphaned job");
                    self.core.publish(&failed, Some(JobState::InProgress));
                    report.failed += 1;
                }
                None => {
                    let cancelled = store.update(job_id, &mut |job: &mut Job| {
                        job.management_server_id = own_id;
                        job.error = Some(format!(
                            "management server {previous_owner} stopped before the job started"
                        ));
                        job.transition(JobState::Cancelled)
                    })?;
                    tracing::warn!(target: "jobs::manager", %job_id, previous_owner, "cancelled orphaned job");
                    self.core.publish(&cancelled, Some(JobState::Queued));
                    report.cancelled += 1;
                }
            }
        }

        tracing::info!(
            target: "jobs::manager",
            resumed = report.resumed,
            failed = report.failed,
            cancelled = report.cancelled,
            skipped_live_peer = report.skipped_live_peer,
            "job recovery finished"
        );
        Ok(report)
    }

    /// Stops accepting work and waits up to `timeout` for running jobs.
    /// Jobs still queued stay `Queued` in the store for the next recovery.
    pub fn shutdown(&self, timeout: Duration) {
        self.core.stopping.store(true, Ordering::SeqCst);
        if lock(&self.sender).take().is_none() {
            return;
        }

        let deadline = Instant::now() + timeout;
        let workers = std::mem::take(&mut *lock(&self.workers));
        while workers.iter().any(|worker| !worker.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let mut detached = 0;
        for worker in workers {
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            tracing::warn!(target: "jobs::manager", detached, "job workers still busy at shutdown");
        } else {
            tracing::info!(target: "jobs::manager", "job worker pool stopped");
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(5));
    }
}
