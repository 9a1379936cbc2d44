use std::fmt;

use thiserror::Error;

use crate::provision::InstanceId;
use crate::scheduler::Job;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Provisioning failed: {0}")]
    ProvisioningFailure(String),

    #[error("Instance {instance_id} not running after {waited_secs}s")]
    ProvisioningTimeout {
        instance_id: InstanceId,
        waited_secs: u64,
    },

    #[error("Could not connect to {host} after {attempts} attempts: {last_error}")]
    ConnectionExhausted {
        host: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Command `{command}` failed with exit code {exit_code:?}: {stderr}")]
    CommandFailure {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to terminate instance {instance_id}: {reason}")]
    TeardownFailure {
        instance_id: InstanceId,
        reason: String,
    },

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Instance {0} has no network address")]
    NoAddress(InstanceId),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Job already running: {0}")]
    JobAlreadyRunning(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} already has workers; a start needs an empty worker set")]
    JobNotEmpty(String),

    #[error("Job {job_id} is at capacity ({capacity} workers)")]
    CapacityExceeded { job_id: String, capacity: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Aggregate(ErrorList),
}

impl FleetError {
    /// Number of underlying failures this error stands for.
    pub fn failure_count(&self) -> usize {
        match self {
            FleetError::Aggregate(list) => list.len(),
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

/// Every failure collected during a fan-out, rendered joined by `"; "`.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<FleetError>);

impl ErrorList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: FleetError) {
        self.0.push(err);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FleetError> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<FleetError> {
        self.0
    }

    /// `Ok(())` when nothing failed, otherwise the whole list as one error.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Aggregate(self))
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl From<Vec<FleetError>> for ErrorList {
    fn from(errors: Vec<FleetError>) -> Self {
        Self(errors)
    }
}

/// A job start that did not fully succeed.
///
/// The job is returned unregistered and still holds every worker that did come
/// up. Those workers keep running until the caller passes the job to
/// [`Orchestrator::stop_job`](crate::scheduler::Orchestrator::stop_job).
#[derive(Error, Debug)]
#[error(
    "Job {} started {} of {} workers: {}",
    .job.id,
    .job.workers.len(),
    .job.capacity,
    .errors
)]
pub struct PartialStart {
    pub job: Job,
    pub errors: ErrorList,
}

impl PartialStart {
    /// A start refused before anything was provisioned.
    pub fn rejected(job: Job, err: FleetError) -> Self {
        let mut errors = ErrorList::new();
        errors.push(err);
        Self { job, errors }
    }

    /// The start was refused because the job id was already registered.
    pub fn already_running(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, FleetError::JobAlreadyRunning(_)))
    }
}

impl From<PartialStart> for FleetError {
    fn from(partial: PartialStart) -> Self {
        FleetError::Aggregate(partial.errors)
    }
}
