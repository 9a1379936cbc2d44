use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::ProvisionerConfig;
use crate::error::{FleetError, Result};
use crate::provision::{InstanceDescription, InstanceId, InstanceState, Provisioner};

const JOB_LABEL: &str = "hashfleet.job";
const KEY_LABEL: &str = "hashfleet.key";

/// Provisions workers as detached Docker containers.
///
/// Each container is one instance:
/// - The container id is the instance id
/// - The instance class maps to `--cpus`/`--memory`
/// - The network group maps to `--network`
/// - The container IP is the worker address
#[derive(Debug, Clone)]
pub struct DockerProvisioner {
    config: ProvisionerConfig,
}

impl DockerProvisioner {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self { config }
    }

    fn run_args(&self, job_id: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            format!("--name=hashfleet-{}", Uuid::new_v4()),
            format!("--label={}={}", JOB_LABEL, job_id),
        ];

        if let Some(ref key_name) = self.config.key_name {
            args.push(format!("--label={}={}", KEY_LABEL, key_name));
        }

        if let Some(ref network) = self.config.network {
            args.push(format!("--network={}", network));
        }

        if let Some((cpus, memory)) = self.config.resource_limits() {
            args.push(format!("--cpus={}", cpus));
            if let Some(memory) = memory {
                args.push(format!("--memory={}", memory));
            }
        }

        for (key, value) in &self.config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.config.image.clone());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output> {
        let output = Command::new(&self.config.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn create(&self, job_id: &str) -> Result<InstanceId> {
        let output = self.docker(&self.run_args(job_id)).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(FleetError::ProvisioningFailure(format!(
                "docker run exited with {:?}: {}",
                output.status.code(),
                stderr
            )));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(FleetError::ProvisioningFailure(
                "docker run returned no container id".to_string(),
            ));
        }

        tracing::info!(job_id, instance_id = %id, image = %self.config.image, "Created new instance");
        Ok(InstanceId::from(id))
    }

    async fn describe(&self, id: &InstanceId) -> Result<InstanceDescription> {
        let args = vec!["inspect".to_string(), id.to_string()];
        let output = self.docker(&args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Err(FleetError::InstanceNotFound(id.clone()));
            }
            return Err(FleetError::ProvisioningFailure(format!(
                "docker inspect {} failed: {}",
                id,
                stderr.trim()
            )));
        }

        parse_inspect(id, &output.stdout)
    }

    async fn terminate(&self, id: &InstanceId) -> Result<()> {
        tracing::info!(instance_id = %id, "Terminating instance");
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];
        let output = self.docker(&args).await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) {
            tracing::debug!(instance_id = %id, "Instance already gone");
            return Ok(());
        }

        Err(FleetError::TeardownFailure {
            instance_id: id.clone(),
            reason: stderr.trim().to_string(),
        })
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such object") || stderr.contains("No such container")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    state: InspectState,
    #[serde(default)]
    network_settings: Option<InspectNetworkSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default, rename = "IPAddress")]
    ip_address: Option<String>,
    #[serde(default)]
    networks: Option<HashMap<String, InspectNetwork>>,
}

#[derive(Debug, Deserialize)]
struct InspectNetwork {
    #[serde(default, rename = "IPAddress")]
    ip_address: Option<String>,
}

/// Parse `docker inspect` output for a single container.
fn parse_inspect(id: &InstanceId, stdout: &[u8]) -> Result<InstanceDescription> {
    let entries: Vec<InspectEntry> = serde_json::from_slice(stdout)?;
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| FleetError::InstanceNotFound(id.clone()))?;

    Ok(InstanceDescription {
        id: id.clone(),
        state: container_state(&entry.state.status),
        address: entry.network_settings.and_then(container_address),
    })
}

fn container_state(status: &str) -> InstanceState {
    match status {
        "running" => InstanceState::Running,
        "paused" | "exited" => InstanceState::Stopped,
        "removing" => InstanceState::ShuttingDown,
        "dead" => InstanceState::Terminated,
        // created, restarting
        _ => InstanceState::Pending,
    }
}

fn container_address(settings: InspectNetworkSettings) -> Option<String> {
    let non_empty = |ip: Option<String>| ip.filter(|ip| !ip.is_empty());

    non_empty(settings.ip_address).or_else(|| {
        let mut networks: Vec<(String, InspectNetwork)> =
            settings.networks?.into_iter().collect();
        networks.sort_by(|a, b| a.0.cmp(&b.0));
        networks
            .into_iter()
            .find_map(|(_, network)| non_empty(network.ip_address))
    })
}
