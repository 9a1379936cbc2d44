use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::provision::DockerProvisioner;
use crate::scheduler::Orchestrator;
use crate::store::{MemoryRecordStore, RecordStore};
use crate::worker::SshTransport;

/// A running hashfleet server: record store, orchestrator and HTTP front end.
pub struct Node {
    pub config: ServerConfig,
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn RecordStore>,
    shutdown: CancellationToken,
}

impl Node {
    /// Wire the Docker provisioner and the SSH transport into an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the records file is configured but cannot be loaded.
    pub async fn new(config: ServerConfig, shutdown: CancellationToken) -> Result<Self> {
        let provisioner = Arc::new(DockerProvisioner::new(config.provisioner.clone()));
        let transport = Arc::new(SshTransport::new(&config.remote));

        let orchestrator = Orchestrator::new(
            provisioner,
            transport,
            config.remote.clone(),
            config.orchestrator.clone(),
        )
        .with_provisioner_timing(&config.provisioner)
        .with_cancellation(shutdown.clone());

        let store: Arc<dyn RecordStore> = match config.records_path {
            Some(ref path) => Arc::new(MemoryRecordStore::from_json_file(path).await?),
            None => {
                tracing::warn!("No records file configured, starting with an empty record store");
                Arc::new(MemoryRecordStore::new())
            }
        };

        Ok(Self {
            config,
            orchestrator,
            store,
            shutdown,
        })
    }

    /// Serve requests until shutdown, then tear down every registered job.
    ///
    /// # Errors
    ///
    /// Returns an error if the API server fails to bind or crashes, or if the
    /// final teardown leaves failures behind.
    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let state = ApiState {
            orchestrator: self.orchestrator.clone(),
            store: self.store.clone(),
        };

        let served = run_api(self.config.listen_addr, state, self.shutdown.clone()).await;

        // Reclaim the fleet whether the server exited cleanly or not.
        let teardown = self.orchestrator.shutdown().await;

        served?;
        teardown?;
        Ok(())
    }
}
