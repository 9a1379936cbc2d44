//! Remote shell transport.
//!
//! [`RemoteTransport::connect`] makes one connection attempt; retry policy lives
//! in [`RemoteExecutor`](crate::worker::RemoteExecutor). A connected
//! [`RemoteSession`] runs commands until it is closed or dropped.
//!
//! [`SshTransport`] uses the system OpenSSH client in master mode: connecting
//! starts a control master process, commands are multiplexed over its control
//! socket, and closing (or dropping) the session kills the master and removes
//! the socket directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::config::RemoteExecConfig;
use crate::error::{FleetError, Result};

const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit status OpenSSH reserves for its own errors.
const SSH_ERROR_STATUS: i32 = 255;

/// Private key used to authenticate against workers.
#[derive(Clone)]
pub struct Credential {
    key_path: PathBuf,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("key_path", &self.key_path)
            .finish()
    }
}

impl Credential {
    /// Load and sanity-check a PEM private key.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Credential`] if the file is missing, unreadable or
    /// does not contain a private key.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FleetError::Credential(format!(
                "private key not found: {}",
                path.display()
            )));
        }

        let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
            FleetError::Credential(format!("failed to read {}: {}", path.display(), e))
        })?;

        if !pem.contains("PRIVATE KEY") {
            return Err(FleetError::Credential(format!(
                "{} does not contain a private key",
                path.display()
            )));
        }

        Ok(Self {
            key_path: path.to_path_buf(),
        })
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }
}

/// Where and as whom to open a session.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
}

impl RemoteTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Buffered result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Make a single connection attempt.
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteSession>>;
}

#[async_trait]
pub trait RemoteSession: Send {
    /// Run one command and wait for it to finish.
    async fn run(&mut self, command: &str) -> Result<CommandOutput>;

    /// Release the session. Dropping a session must release it too.
    async fn close(self: Box<Self>);
}

/// OpenSSH client transport.
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_bin: String,
    connect_timeout: Duration,
    strict_host_key_checking: bool,
}

impl SshTransport {
    pub fn new(config: &RemoteExecConfig) -> Self {
        Self {
            ssh_bin: "ssh".to_string(),
            connect_timeout: config.connect_timeout,
            strict_host_key_checking: config.strict_host_key_checking,
        }
    }

    pub fn with_ssh_bin(mut self, ssh_bin: impl Into<String>) -> Self {
        self.ssh_bin = ssh_bin.into();
        self
    }

    fn master_args(&self, target: &RemoteTarget, control_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-N".to_string(),
            "-S".to_string(),
            control_path.display().to_string(),
            "-o".to_string(),
            "ControlPersist=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];

        if self.strict_host_key_checking {
            args.push("-o".to_string());
            args.push("StrictHostKeyChecking=yes".to_string());
        } else {
            args.push("-o".to_string());
            args.push("StrictHostKeyChecking=no".to_string());
            args.push("-o".to_string());
            args.push("UserKnownHostsFile=/dev/null".to_string());
        }

        args.push("-i".to_string());
        args.push(target.credential.key_path().display().to_string());
        args.push("-p".to_string());
        args.push(target.port.to_string());
        args.push(target.destination());
        args
    }

    async fn control_check(&self, control_path: &Path, destination: &str) -> bool {
        Command::new(&self.ssh_bin)
            .arg("-S")
            .arg(control_path)
            .args(["-O", "check", destination])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteSession>> {
        let control_dir = tempfile::Builder::new().prefix("hashfleet-ssh").tempdir()?;
        let control_path = control_dir.path().join("ctl");
        let destination = target.destination();

        let mut master = Command::new(&self.ssh_bin)
            .args(self.master_args(target, &control_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // One extra second over ssh's own ConnectTimeout covers the handshake.
        let deadline = Instant::now() + self.connect_timeout + Duration::from_secs(1);

        loop {
            if let Some(status) = master.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(FleetError::Connect(format!(
                    "ssh to {} exited with {:?}: {}",
                    target,
                    status.code(),
                    stderr.trim()
                )));
            }

            if self.control_check(&control_path, &destination).await {
                break;
            }

            if Instant::now() >= deadline {
                let _ = master.kill().await;
                return Err(FleetError::Connect(format!(
                    "timed out connecting to {}",
                    target
                )));
            }

            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }

        tracing::debug!(host = %target, "SSH master connected");

        Ok(Box::new(SshSession {
            ssh_bin: self.ssh_bin.clone(),
            master,
            control_path,
            destination,
            _control_dir: control_dir,
        }))
    }
}

/// Live OpenSSH control master. The master is killed on drop.
struct SshSession {
    ssh_bin: String,
    master: Child,
    control_path: PathBuf,
    destination: String,
    _control_dir: TempDir,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let output = Command::new(&self.ssh_bin)
            .arg("-S")
            .arg(&self.control_path)
            .arg(&self.destination)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.code() == Some(SSH_ERROR_STATUS) {
            return Err(FleetError::Connect(format!(
                "session to {} failed: {}",
                self.destination,
                stderr.trim()
            )));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code: output.status.code(),
        })
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        let _ = Command::new(&this.ssh_bin)
            .arg("-S")
            .arg(&this.control_path)
            .args(["-O", "exit", this.destination.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        if let Err(e) = this.master.kill().await {
            tracing::debug!(destination = %this.destination, error = %e, "SSH master already exited");
        }
    }
}
