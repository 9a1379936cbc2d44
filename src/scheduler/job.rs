use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shell_escape::unix::escape;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::provision::InstanceId;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Failed,
    Stopped,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Job parameters passed through untouched to the commands run on workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    pub hash: String,
    pub hash_type: String,
}

/// Persisted job record as the record store hands it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub capacity: usize,
    /// Maximum run time in seconds
    #[serde(default)]
    pub timelimit: u64,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub hash_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub email: String,
    pub capacity: usize,
    /// Advisory; carried through but not enforced.
    pub timelimit: Duration,
    pub payload: PayloadDescriptor,
    pub workers: BTreeMap<InstanceId, Worker>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Identifies one start attempt. Reassigned by every start, so a stale
    /// copy of a job never matches a later registration of the same id.
    pub generation: Uuid,
}

impl Job {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            email: String::new(),
            capacity,
            timelimit: Duration::ZERO,
            payload: PayloadDescriptor::default(),
            workers: BTreeMap::new(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            generation: Uuid::new_v4(),
        }
    }

    /// Build a fresh job, with no workers, from its persisted record.
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            email: record.email.clone(),
            capacity: record.capacity,
            timelimit: Duration::from_secs(record.timelimit),
            payload: PayloadDescriptor {
                hash: record.hash.clone(),
                hash_type: record.hash_type.clone(),
            },
            workers: BTreeMap::new(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            generation: Uuid::new_v4(),
        }
    }

    pub fn with_payload(mut self, hash: impl Into<String>, hash_type: impl Into<String>) -> Self {
        self.payload = PayloadDescriptor {
            hash: hash.into(),
            hash_type: hash_type.into(),
        };
        self
    }

    /// Add a worker. Refuses to grow the worker set past `capacity`.
    pub fn add_worker(&mut self, worker: Worker) -> Result<()> {
        if self.workers.len() >= self.capacity && !self.workers.contains_key(&worker.id) {
            return Err(FleetError::CapacityExceeded {
                job_id: self.id.clone(),
                capacity: self.capacity,
            });
        }
        self.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    pub fn is_fully_provisioned(&self) -> bool {
        self.workers.len() == self.capacity
    }

    pub fn worker_ids(&self) -> Vec<InstanceId> {
        self.workers.keys().cloned().collect()
    }

    /// Substitute job and worker fields into a command template.
    ///
    /// Recognized placeholders: `{job_id}`, `{job_name}`, `{hash}`,
    /// `{hash_type}`, `{worker_id}`. Values are shell-quoted and never
    /// rescanned. Unknown placeholders are left as written.
    pub fn render_command(&self, template: &str, worker: &Worker) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let tail = &rest[open..];

            let field = tail
                .find('}')
                .and_then(|close| Some((close, self.placeholder(&tail[1..close], worker)?)));

            match field {
                Some((close, value)) => {
                    rendered.push_str(&escape(Cow::Borrowed(value)));
                    rest = &tail[close + 1..];
                }
                None => {
                    rendered.push('{');
                    rest = &tail[1..];
                }
            }
        }

        rendered.push_str(rest);
        rendered
    }

    fn placeholder<'a>(&'a self, name: &str, worker: &'a Worker) -> Option<&'a str> {
        match name {
            "job_id" => Some(&self.id),
            "job_name" => Some(&self.name),
            "hash" => Some(&self.payload.hash),
            "hash_type" => Some(&self.payload.hash_type),
            "worker_id" => Some(worker.id.as_str()),
            _ => None,
        }
    }
}
