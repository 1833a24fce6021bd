// Observability: metrics recorded per pipeline phase

pub mod metrics;

pub use metrics::init_metrics;
