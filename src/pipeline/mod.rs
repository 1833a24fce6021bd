// Reconciliation pipeline: ingestion, processing, storage and orchestration

pub mod ingestion;
pub mod orchestrator;
pub mod pipeline_config;
pub mod processing;
pub mod storage;

pub use orchestrator::Orchestrator;
pub use pipeline_config::{JoinPlan, JoinStep};
