pub mod job;
pub mod manager;
pub mod registry;

pub use job::{Job, JobRecord, JobStatus, PayloadDescriptor};
pub use manager::Orchestrator;
pub use registry::JobRegistry;
