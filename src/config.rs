use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for launching worker instances.
///
/// The provisioning substrate sees the same settings for every instance of every
/// job; nothing here is per-job.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Image the instance boots from
    pub image: String,
    /// Instance class, `<cpus>x<memory>` (e.g. "2x4g")
    pub instance_type: Option<String>,
    /// Credential reference installed on the instance
    pub key_name: Option<String>,
    /// Network group the instance joins
    pub network: Option<String>,
    /// Extra environment passed to every instance
    pub env: Vec<(String, String)>,
    /// Path or name of the docker binary
    pub docker_bin: String,
    /// How long to wait for a new instance to report running
    pub ready_timeout: Duration,
    /// Delay between state polls while waiting
    pub poll_interval: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            image: "linuxserver/openssh-server:latest".to_string(),
            instance_type: None,
            key_name: None,
            network: None,
            env: Vec::new(),
            docker_bin: "docker".to_string(),
            ready_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl ProvisionerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Split the instance class into CPU and memory limits.
    ///
    /// Returns `None` when no class is set. A class without `x` is treated as a
    /// CPU count only.
    pub fn resource_limits(&self) -> Option<(String, Option<String>)> {
        let class = self.instance_type.as_deref()?.trim();
        if class.is_empty() {
            return None;
        }
        match class.split_once('x') {
            Some((cpus, memory)) => Some((cpus.to_string(), Some(memory.to_string()))),
            None => Some((class.to_string(), None)),
        }
    }
}

/// Bounded retry applied when opening a remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(10),
        }
    }
}

/// Remote execution settings shared by every worker.
#[derive(Debug, Clone)]
pub struct RemoteExecConfig {
    /// Login identity on the workers
    pub user: String,
    /// Remote shell port
    pub port: u16,
    /// Private key used to authenticate (PEM format)
    pub key_path: PathBuf,
    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,
    /// Verify host keys against known_hosts. Fresh instances have unknown keys,
    /// so this is off unless the image ships a pinned key.
    pub strict_host_key_checking: bool,
    pub retry: RetryPolicy,
}

impl Default for RemoteExecConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            port: 22,
            key_path: PathBuf::from("worker.pem"),
            connect_timeout: Duration::from_secs(5),
            strict_host_key_checking: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl RemoteExecConfig {
    pub fn with_retry(mut self, max_attempts: u32, interval: Duration) -> Self {
        self.retry = RetryPolicy {
            max_attempts,
            interval,
        };
        self
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrent per-worker operations within one job
    pub max_concurrency: usize,
    /// Commands run on every new worker, in order. Supports `{job_id}`,
    /// `{job_name}`, `{hash}`, `{hash_type}` and `{worker_id}` placeholders.
    pub startup_commands: Vec<String>,
    /// Terminate instances that were created but never became ready
    pub terminate_failed_launches: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            startup_commands: Vec::new(),
            terminate_failed_launches: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_startup_command(mut self, command: impl Into<String>) -> Self {
        self.startup_commands.push(command.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// JSON file holding the job records
    pub records_path: Option<PathBuf>,
    pub provisioner: ProvisionerConfig,
    pub remote: RemoteExecConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            records_path: None,
            provisioner: ProvisionerConfig::default(),
            remote: RemoteExecConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}
