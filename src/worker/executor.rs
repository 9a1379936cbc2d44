use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::RemoteExecConfig;
use crate::error::{FleetError, Result};
use crate::provision::Provisioner;
use crate::worker::transport::{Credential, RemoteSession, RemoteTarget, RemoteTransport};
use crate::worker::Worker;

/// Runs commands on workers over a [`RemoteTransport`].
///
/// The worker's address is looked up through the provisioner on every call.
/// Instances may be re-addressed between calls, so nothing is cached.
#[derive(Clone)]
pub struct RemoteExecutor {
    provisioner: Arc<dyn Provisioner>,
    transport: Arc<dyn RemoteTransport>,
    config: RemoteExecConfig,
}

impl RemoteExecutor {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        transport: Arc<dyn RemoteTransport>,
        config: RemoteExecConfig,
    ) -> Self {
        Self {
            provisioner,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &RemoteExecConfig {
        &self.config
    }

    /// Run one command on a worker and return its stdout.
    ///
    /// # Errors
    ///
    /// - [`FleetError::InstanceNotFound`] / [`FleetError::NoAddress`] if the
    ///   worker cannot be resolved
    /// - [`FleetError::Credential`] if the private key cannot be loaded
    /// - [`FleetError::ConnectionExhausted`] once every connection attempt failed
    /// - [`FleetError::CommandFailure`] if the command exits non-zero
    pub async fn run_command(
        &self,
        worker: &Worker,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut outputs = self
            .run_commands(worker, &[command.to_string()], cancel)
            .await?;
        Ok(outputs.pop().unwrap_or_default())
    }

    /// Run commands on a worker in order, stopping at the first failure.
    ///
    /// Each command gets its own connection, so a worker that reboots between
    /// steps is picked up again at its new address.
    pub async fn run_commands(
        &self,
        worker: &Worker,
        commands: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            let stdout = self.execute(worker, command, cancel).await?;
            outputs.push(stdout);
        }
        Ok(outputs)
    }

    async fn execute(
        &self,
        worker: &Worker,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let target = self.resolve(worker).await?;
        tracing::info!(instance_id = %worker.id, host = %target, command, "Executing command");

        let mut session = self.connect(&target, cancel).await?;
        let result = session.run(command).await;
        session.close().await;

        let output = result?;
        if !output.success() {
            tracing::warn!(
                instance_id = %worker.id,
                command,
                exit_code = ?output.exit_code,
                "Command failed"
            );
            return Err(FleetError::CommandFailure {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    async fn resolve(&self, worker: &Worker) -> Result<RemoteTarget> {
        let description = self.provisioner.describe(&worker.id).await?;
        let host = description
            .address
            .ok_or_else(|| FleetError::NoAddress(worker.id.clone()))?;
        let credential = Credential::load(&self.config.key_path).await?;

        Ok(RemoteTarget {
            host,
            port: self.config.port,
            user: self.config.user.clone(),
            credential,
        })
    }

    /// Connect with bounded retry. Sleeps only between attempts.
    async fn connect(
        &self,
        target: &RemoteTarget,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>> {
        let policy = self.config.retry;
        let mut last_error = String::from("no connection attempted");

        for attempt in 1..=policy.max_attempts {
            if cancel.is_cancelled() {
                return Err(FleetError::Cancelled);
            }

            match self.transport.connect(target).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    tracing::warn!(
                        host = %target,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Connection attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < policy.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FleetError::Cancelled),
                    _ = tokio::time::sleep(policy.interval) => {}
                }
            }
        }

        Err(FleetError::ConnectionExhausted {
            host: target.to_string(),
            attempts: policy.max_attempts,
            last_error,
        })
    }
}
