//! Job record store.
//!
//! The orchestrator never reads records itself; the front end looks a record
//! up here and converts it with [`Job::from_record`](crate::scheduler::Job::from_record).

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{FleetError, Result};
use crate::scheduler::JobRecord;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>>;

    async fn list(&self) -> Result<Vec<JobRecord>>;
}

/// Records held in memory, optionally seeded from a JSON file.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = JobRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    /// Load records from a JSON array.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if two records
    /// share an id.
    pub async fn from_json_file(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        let records: Vec<JobRecord> = serde_json::from_slice(&data)?;

        let mut by_id = HashMap::with_capacity(records.len());
        for record in records {
            if by_id.contains_key(&record.id) {
                return Err(FleetError::Store(format!(
                    "duplicate job record {} in {}",
                    record.id,
                    path.display()
                )));
            }
            by_id.insert(record.id.clone(), record);
        }

        tracing::info!(path = %path.display(), records = by_id.len(), "Loaded job records");
        Ok(Self {
            records: RwLock::new(by_id),
        })
    }

    pub async fn insert(&self, record: JobRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.records.read().await.get(job_id).cloned())
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        let mut records: Vec<JobRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}
