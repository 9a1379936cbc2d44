//! Provisioning substrate abstraction.
//!
//! The orchestrator only ever talks to a [`Provisioner`]: create one instance,
//! wait for it to run, describe it, terminate it. The production backend is
//! [`DockerProvisioner`], which treats containers as instances.
//!
//! # Contract
//!
//! - [`Provisioner::describe`] returns [`FleetError::InstanceNotFound`] for an
//!   unknown id rather than a default description.
//! - [`Provisioner::terminate`] must succeed when called again for an id that is
//!   already gone.
//! - [`Provisioner::await_running`] never blocks forever: it honors the timeout in
//!   [`AwaitPolicy`] and the cancellation token it is given.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, Result};

pub mod docker;

pub use docker::DockerProvisioner;

/// Opaque identifier assigned by the provisioning substrate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    /// States an instance never comes back from on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::ShuttingDown | InstanceState::Terminated
        )
    }

    /// States that rule out reaching `Running` during startup. A stopped
    /// instance has to be started again by someone, which a launch never does.
    pub fn halts_startup(&self) -> bool {
        self.is_terminal() || matches!(self, InstanceState::Stopping | InstanceState::Stopped)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "pending"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::ShuttingDown => write!(f, "shutting-down"),
            InstanceState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub id: InstanceId,
    pub state: InstanceState,
    /// Reachable address, if the instance currently has one
    pub address: Option<String>,
}

/// How long and how often to poll while waiting for an instance to run.
#[derive(Debug, Clone, Copy)]
pub struct AwaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for AwaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Request one new instance for `job_id` and return its id.
    async fn create(&self, job_id: &str) -> Result<InstanceId>;

    /// Current state and address of an instance.
    async fn describe(&self, id: &InstanceId) -> Result<InstanceDescription>;

    /// Request destruction of an instance. Idempotent.
    async fn terminate(&self, id: &InstanceId) -> Result<()>;

    /// Block until the instance is running.
    ///
    /// The default implementation polls [`describe`](Provisioner::describe).
    async fn await_running(
        &self,
        id: &InstanceId,
        policy: &AwaitPolicy,
        cancel: &CancellationToken,
    ) -> Result<InstanceDescription> {
        let deadline = Instant::now() + policy.timeout;
        let timed_out = || FleetError::ProvisioningTimeout {
            instance_id: id.clone(),
            waited_secs: policy.timeout.as_secs(),
        };

        loop {
            // A hung describe is bounded by the same deadline and cancellation.
            let description = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FleetError::Cancelled),
                polled = tokio::time::timeout_at(deadline, self.describe(id)) => {
                    polled.map_err(|_| timed_out())??
                }
            };
            tracing::debug!(instance_id = %id, state = %description.state, "Polled instance state");

            match description.state {
                InstanceState::Running => return Ok(description),
                state if state.halts_startup() => {
                    return Err(FleetError::ProvisioningFailure(format!(
                        "instance {} entered state {} while starting",
                        id, state
                    )));
                }
                _ => {}
            }

            if Instant::now() + policy.poll_interval > deadline {
                return Err(timed_out());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(FleetError::Cancelled),
                _ = tokio::time::sleep(policy.poll_interval) => {}
            }
        }
    }
}
