use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::storage::StorageFacade;

use super::{Job, JobError, JobState, ResourceRef};

pub type JobMutation<'a> = &'a mut dyn FnMut(&mut Job) -> Result<(), JobError>;

/// Durable home of job records.
///
/// `update` is the only way to change a stored job: the lookup and the write
/// happen under one lock, and a mutation that returns an error leaves the
/// stored record exactly as it was.
pub trait JobStore: Send + Sync {
    fn create(&self, job: &Job) -> Result<(), JobError>;
    fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobError>;
    fn update(&self, job_id: Uuid, mutate: JobMutation<'_>) -> Result<Job, JobError>;
    fn list(&self) -> Result<Vec<Job>, JobError>;
    fn remove(&self, job_id: Uuid) -> Result<bool, JobError>;

    fn list_by_owner(&self, owner: &str) -> Result<Vec<Job>, JobError> {
        Ok(filtered(self.list()?, |job| job.owner == owner))
    }

    fn list_by_resource(&self, resource: &ResourceRef) -> Result<Vec<Job>, JobError> {
        Ok(filtered(self.list()?, |job| &job.resource == resource))
    }

    fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, JobError> {
        Ok(filtered(self.list()?, |job| job.state == state))
    }
}

fn filtered(jobs: Vec<Job>, keep: impl Fn(&Job) -> bool) -> Vec<Job> {
    jobs.into_iter().filter(|job| keep(job)).collect()
}

fn sort_jobs(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

fn apply(mut job: Job, mutate: JobMutation<'_>) -> Result<Job, JobError> {
    mutate(&mut job)?;
    job.updated_at = Utc::now();
    Ok(job)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, job: &Job) -> Result<(), JobError> {
        let mut jobs = lock(&self.jobs);
        if jobs.contains_key(&job.id) {
            return Err(JobError::AlreadyExists { job_id: job.id });
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobError> {
        Ok(lock(&self.jobs).get(&job_id).cloned())
    }

    fn update(&self, job_id: Uuid, mutate: JobMutation<'_>) -> Result<Job, JobError> {
        let mut jobs = lock(&self.jobs);
        let current = jobs.get(&job_id).cloned().ok_or(JobError::NotFound { job_id })?;
        let updated = apply(current, mutate)?;
        jobs.insert(job_id, updated.clone());
        Ok(updated)
    }

    fn list(&self) -> Result<Vec<Job>, JobError> {
        let mut jobs = lock(&self.jobs).values().cloned().collect::<Vec<_>>();
        sort_jobs(&mut jobs);
        Ok(jobs)
    }

    fn remove(&self, job_id: Uuid) -> Result<bool, JobError> {
        Ok(lock(&self.jobs).remove(&job_id).is_some())
    }
}

/// Job records kept as JSON in the sled `jobs` tree.
pub struct SledJobStore {
    storage: Arc<StorageFacade>,
    write_lock: Mutex<()>,
}

impl SledJobStore {
    pub fn new(storage: Arc<StorageFacade>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    fn read(&self, job_id: Uuid) -> Result<Option<Job>, JobError> {
        match self.storage.get_job_record(job_id)? {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    fn write(&self, job: &Job) -> Result<(), JobError> {
        let record = serde_json::to_value(job)?;
        self.storage.upsert_job_record(job.id, &record)?;
        Ok(())
    }
}

impl JobStore for SledJobStore {
    fn create(&self, job: &Job) -> Result<(), JobError> {
        let _guard = lock(&self.write_lock);
        if self.storage.get_job_record(job.id)?.is_some() {
            return Err(JobError::AlreadyExists { job_id: job.id });
        }
        self.write(job)
    }

    fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobError> {
        self.read(job_id)
    }

    fn update(&self, job_id: Uuid, mutate: JobMutation<'_>) -> Result<Job, JobError> {
        let _guard = lock(&self.write_lock);
        let current = self.read(job_id)?.ok_or(JobError::NotFound { job_id })?;
        let updated = apply(current, mutate)?;
        self.write(&updated)?;
        Ok(updated)
    }

    fn list(&self) -> Result<Vec<Job>, JobError> {
        let mut jobs = Vec::new();
        for record in self.storage.list_job_records()? {
            match serde_json::from_value::<Job>(record) {
                Ok(job) => jobs.push(job),
                Err(error) => {
                    tracing::warn!(target: "jobs::store", %error, "skipping unreadable job record");
                }
            }
        }
        sort_jobs(&mut jobs);
        Ok(jobs)
    }

    fn remove(&self, job_id: Uuid) -> Result<bool, JobError> {
        let _guard = lock(&self.write_lock);
        Ok(self.storage.remove_job_record(job_id)?)
    }
}
