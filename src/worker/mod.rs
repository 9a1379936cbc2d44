//! Workers and remote command execution.
//!
//! - [`Worker`]: one provisioned instance owned by a job
//! - [`RemoteExecutor`]: resolves a worker's address, opens a session with
//!   bounded retry and runs commands on it
//! - [`transport`]: the session abstraction and its OpenSSH implementation
//!
//! # Execution Flow
//!
//! 1. [`RemoteExecutor::run_command`] asks the provisioner for the worker's
//!    current address (never cached)
//! 2. Loads the private key
//! 3. Connects, retrying on a fixed interval up to the configured attempt count
//! 4. Runs the command on one session and buffers stdout
//! 5. Closes the session whatever the outcome

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provision::InstanceId;

pub mod executor;
pub mod transport;

pub use executor::RemoteExecutor;
pub use transport::{
    CommandOutput, Credential, RemoteSession, RemoteTarget, RemoteTransport, SshTransport,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: InstanceId,
    pub launched_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            launched_at: Utc::now(),
        }
    }
}
