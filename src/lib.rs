pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod registry;

// Domain data shapes shared across layers
pub mod domain;

pub use config::Config;
pub use error::{ReconcileError, Result};
pub use pipeline::orchestrator::{Orchestrator, RunOutput, RunReport};
