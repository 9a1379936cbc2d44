use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::scheduler::job::Job;

type LockTable = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Jobs currently believed to have live workers.
///
/// Cloning the registry yields another handle onto the same jobs. Besides the
/// job map it hands out one exclusion lock per job id, held for the whole of a
/// start or stop so the two never interleave for the same job.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
    locks: LockTable,
}

/// Exclusion for one job id. Dropping it releases the lock and forgets the
/// id's lock entry once nobody else holds or waits on it.
#[derive(Debug)]
pub struct JobGuard {
    job_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.job_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.job_id);
        }
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Fails if a job with the same id is already registered.
    pub async fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(FleetError::JobAlreadyRunning(job.id));
        }
        tracing::info!(job_id = %job.id, workers = job.workers.len(), "Job registered");
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    /// Unregister `job_id` only if the registered entry is the same start as
    /// `generation`.
    pub async fn remove_if(&self, job_id: &str, generation: Uuid) -> Option<Job> {
        let mut jobs = self.jobs.write().await;
        match jobs.get(job_id) {
            Some(job) if job.generation == generation => {
                tracing::info!(job_id, "Job unregistered");
                jobs.remove(job_id)
            }
            Some(_) => {
                tracing::debug!(job_id, "Registered job belongs to a later start, left in place");
                None
            }
            None => None,
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.jobs.read().await.contains_key(job_id)
    }

    /// All registered jobs sorted chronologically by creation time
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Acquire the exclusion lock for one job id.
    pub async fn lock_job(&self, job_id: &str) -> JobGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        JobGuard {
            job_id: job_id.to_string(),
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }
}
