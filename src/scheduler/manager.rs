use std::sync::Arc;

use tokio::sync::{oneshot, Semaphore};
use uuid::Uuid;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{OrchestratorConfig, ProvisionerConfig, RemoteExecConfig};
use crate::error::{ErrorList, FleetError, PartialStart, Result};
use crate::provision::{AwaitPolicy, InstanceId, Provisioner};
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::registry::JobRegistry;
use crate::worker::{RemoteExecutor, RemoteTransport, Worker};

/// Outcome of one fleet member's launch: the worker if its instance came up,
/// and the failure if any step did not succeed.
type MemberOutcome = (Option<Worker>, Option<FleetError>);

/// Turns jobs into fleets of workers and back.
///
/// Cloning an orchestrator yields another handle onto the same registry,
/// provisioner and transport.
#[derive(Clone)]
pub struct Orchestrator {
    provisioner: Arc<dyn Provisioner>,
    executor: RemoteExecutor,
    registry: JobRegistry,
    config: OrchestratorConfig,
    await_policy: AwaitPolicy,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        transport: Arc<dyn RemoteTransport>,
        remote: RemoteExecConfig,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            executor: RemoteExecutor::new(provisioner.clone(), transport, remote),
            provisioner,
            registry: JobRegistry::new(),
            config,
            await_policy: AwaitPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_await_policy(mut self, policy: AwaitPolicy) -> Self {
        self.await_policy = policy;
        self
    }

    /// Take the readiness timeout and poll interval from provisioner settings.
    pub fn with_provisioner_timing(self, config: &ProvisionerConfig) -> Self {
        self.with_await_policy(AwaitPolicy {
            timeout: config.ready_timeout,
            poll_interval: config.poll_interval,
        })
    }

    /// Abort provisioning waits and connection retries when `token` is cancelled.
    /// Teardown is never cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &RemoteExecutor {
        &self.executor
    }

    /// Provision `job.capacity` workers and register the job.
    ///
    /// Every member is attempted even when others fail. On full success the job
    /// is registered as running and returned. Otherwise it is returned
    /// unregistered inside [`PartialStart`], still holding the workers that did
    /// come up; those keep running until the caller hands the job to
    /// [`stop_job`](Self::stop_job).
    ///
    /// The fan-out runs on its own task and finishes even if this future is
    /// dropped. A partial fleet nobody is left to receive is torn down there.
    pub async fn start_job(&self, mut job: Job) -> std::result::Result<Job, PartialStart> {
        let guard = self.registry.lock_job(&job.id).await;

        if self.registry.contains(&job.id).await {
            let err = FleetError::JobAlreadyRunning(job.id.clone());
            return Err(PartialStart::rejected(job, err));
        }
        // Workers handed in here would be outside this start's teardown.
        if !job.workers.is_empty() {
            let err = FleetError::JobNotEmpty(job.id.clone());
            return Err(PartialStart::rejected(job, err));
        }

        job.generation = Uuid::new_v4();
        let fallback = job.clone();
        let (tx, rx) = oneshot::channel();
        let this = self.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let outcome = this.launch_fleet(job).await;

            if let Err(Err(partial)) = tx.send(outcome) {
                tracing::warn!(
                    job_id = %partial.job.id,
                    workers = partial.job.workers.len(),
                    "Start abandoned by caller, tearing down partial fleet"
                );
                if let Err(e) = this.teardown(&partial.job).await {
                    tracing::error!(job_id = %partial.job.id, error = %e, "Abandoned fleet teardown failed");
                }
            }
        });

        rx.await.unwrap_or_else(|_| {
            let mut job = fallback;
            job.status = JobStatus::Failed;
            Err(PartialStart::rejected(
                job,
                FleetError::ProvisioningFailure("job start task aborted".to_string()),
            ))
        })
    }

    async fn launch_fleet(&self, mut job: Job) -> std::result::Result<Job, PartialStart> {
        tracing::info!(job_id = %job.id, capacity = job.capacity, "Starting job");

        let template = Arc::new(job.clone());
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for ordinal in 0..job.capacity {
            let this = self.clone();
            let template = template.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                this.launch_member(&template, ordinal).await
            });
        }

        let mut errors = ErrorList::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((worker, failure)) => {
                    if let Some(worker) = worker {
                        if let Err(e) = job.add_worker(worker) {
                            errors.push(e);
                        }
                    }
                    if let Some(e) = failure {
                        errors.push(e);
                    }
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Worker launch task aborted");
                    errors.push(FleetError::ProvisioningFailure(format!(
                        "worker launch task aborted: {}",
                        e
                    )));
                }
            }
        }

        if errors.is_empty() {
            job.status = JobStatus::Running;
            if let Err(e) = self.registry.insert(job.clone()).await {
                errors.push(e);
            } else {
                tracing::info!(job_id = %job.id, workers = job.workers.len(), "Job started");
                return Ok(job);
            }
        }

        job.status = JobStatus::Failed;
        tracing::warn!(
            job_id = %job.id,
            started = job.workers.len(),
            capacity = job.capacity,
            failures = errors.len(),
            "Job start incomplete, job not registered"
        );
        Err(PartialStart { job, errors })
    }

    /// Terminate every worker of `job` and unregister it.
    ///
    /// All workers are attempted. The registry entry is removed even when some
    /// terminations fail; those failures are returned together. Only the entry
    /// created by this same start is removed, so a stale copy of a job (such as
    /// a [`PartialStart`] fleet) never unregisters a later start of its id.
    pub async fn stop_job(&self, job: &Job) -> Result<()> {
        let _guard = self.registry.lock_job(&job.id).await;
        tracing::info!(job_id = %job.id, workers = job.workers.len(), "Stopping job");

        let result = self.teardown(job).await;
        self.registry.remove_if(&job.id, job.generation).await;

        match &result {
            Ok(()) => tracing::info!(job_id = %job.id, "Job stopped"),
            Err(e) => tracing::warn!(
                job_id = %job.id,
                failures = e.failure_count(),
                "Job stopped with teardown failures"
            ),
        }
        result
    }

    /// Tear down the fleet of a [`PartialStart`].
    ///
    /// Runs on its own task, so the teardown completes even if the caller goes
    /// away; the job is not registered and nothing else would reclaim it.
    pub async fn rollback(&self, job: Job) -> Result<()> {
        let this = self.clone();
        tokio::spawn(async move { this.stop_job(&job).await })
            .await
            .unwrap_or_else(|e| {
                Err(FleetError::ProvisioningFailure(format!(
                    "rollback task aborted: {}",
                    e
                )))
            })
    }

    /// Terminate every worker of `job` in bounded parallel. Takes no lock and
    /// leaves the registry alone.
    async fn teardown(&self, job: &Job) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for worker in job.workers.values().cloned() {
            let this = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                this.stop_worker(&worker).await
            });
        }

        let mut errors = ErrorList::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(FleetError::ProvisioningFailure(format!(
                    "worker teardown task aborted: {}",
                    e
                ))),
            }
        }
        errors.into_result()
    }

    /// Stop a registered job by id and return it as it was when stopped.
    pub async fn stop_job_by_id(&self, job_id: &str) -> Result<Job> {
        let mut job = self
            .registry
            .get(job_id)
            .await
            .ok_or_else(|| FleetError::JobNotFound(job_id.to_string()))?;

        self.stop_job(&job).await?;
        job.status = JobStatus::Stopped;
        Ok(job)
    }

    /// Stop every registered job. Used on process shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        let jobs = self.registry.list().await;
        tracing::info!(jobs = jobs.len(), "Tearing down registered jobs");

        let mut errors = ErrorList::new();
        for job in jobs {
            if let Err(e) = self.stop_job(&job).await {
                tracing::error!(job_id = %job.id, error = %e, "Failed to tear down job");
                errors.push(e);
            }
        }
        errors.into_result()
    }

    async fn launch_member(&self, job: &Job, ordinal: usize) -> MemberOutcome {
        let worker = match self.create_worker(&job.id).await {
            Ok(worker) => worker,
            Err(e) => {
                tracing::warn!(job_id = %job.id, ordinal, error = %e, "Worker provisioning failed");
                return (None, Some(e));
            }
        };

        match self.start_worker(job, &worker).await {
            Ok(()) => (Some(worker), None),
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    instance_id = %worker.id,
                    error = %e,
                    "Worker startup failed"
                );
                (Some(worker), Some(e))
            }
        }
    }

    /// Create one instance and wait until it is running.
    async fn create_worker(&self, job_id: &str) -> Result<Worker> {
        if self.cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }

        let id = self
            .provisioner
            .create(job_id)
            .await
            .map_err(provisioning_failure)?;

        tracing::info!(job_id, instance_id = %id, "Waiting for instance to be ready");

        match self
            .provisioner
            .await_running(&id, &self.await_policy, &self.cancel)
            .await
        {
            Ok(_) => {
                tracing::info!(job_id, instance_id = %id, "Instance ready");
                Ok(Worker::new(id))
            }
            Err(e) => {
                if self.config.terminate_failed_launches {
                    self.discard_instance(&id).await;
                }
                Err(provisioning_failure(e))
            }
        }
    }

    /// Run the configured startup commands on a new worker.
    async fn start_worker(&self, job: &Job, worker: &Worker) -> Result<()> {
        if self.config.startup_commands.is_empty() {
            return Ok(());
        }

        let commands: Vec<String> = self
            .config
            .startup_commands
            .iter()
            .map(|template| job.render_command(template, worker))
            .collect();

        self.executor
            .run_commands(worker, &commands, &self.cancel)
            .await
            .map(|_| ())
    }

    /// Terminate a worker's instance. An instance that is already gone counts
    /// as terminated.
    async fn stop_worker(&self, worker: &Worker) -> Result<()> {
        tracing::info!(instance_id = %worker.id, "Stopping worker");
        match self.provisioner.terminate(&worker.id).await {
            Ok(()) | Err(FleetError::InstanceNotFound(_)) => Ok(()),
            Err(e @ FleetError::TeardownFailure { .. }) => Err(e),
            Err(e) => Err(FleetError::TeardownFailure {
                instance_id: worker.id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn discard_instance(&self, id: &InstanceId) {
        match self.provisioner.terminate(id).await {
            Ok(()) | Err(FleetError::InstanceNotFound(_)) => {
                tracing::info!(instance_id = %id, "Terminated instance that never became ready");
            }
            Err(e) => {
                tracing::error!(instance_id = %id, error = %e, "Failed to terminate unready instance");
            }
        }
    }
}

fn provisioning_failure(err: FleetError) -> FleetError {
    match err {
        e @ (FleetError::ProvisioningFailure(_)
        | FleetError::ProvisioningTimeout { .. }
        | FleetError::Cancelled) => e,
        e => FleetError::ProvisioningFailure(e.to_string()),
    }
}
