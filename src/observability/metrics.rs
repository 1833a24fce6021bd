//! Phase-organized metrics for the reconciliation pipeline.
//!
//! Every phase records through its own submodule so metric names stay
//! consistent and each name has one owner. Names follow
//! `epi_{phase}_{name}_{type}`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

/// Build a metric name with the crate prefix.
macro_rules! reconcile_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("epi_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("epi_", $phase, "_", $name)
    };
}

/// Install a Prometheus recorder without an HTTP listener.
///
/// Returns the handle for in-process rendering, or `None` when a recorder was
/// already installed (e.g. a second call in the same process).
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            register_all();
            info!("Prometheus recorder installed");
            Some(handle)
        }
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// Pre-register every metric so a snapshot lists them even when they stay at zero.
fn register_all() {
    use ::metrics::{counter, histogram};

    let _ = counter!(reconcile_metric!(counter, "normalize", "schema_errors"));
    let _ = counter!(reconcile_metric!(counter, "normalize", "unknown_values"));
    let _ = counter!(reconcile_metric!(counter, "normalize", "observations"));
    let _ = counter!(reconcile_metric!(counter, "merge", "merges"));
    let _ = counter!(reconcile_metric!(counter, "merge", "cardinality_rejections"));
    let _ = histogram!(reconcile_metric!(histogram, "merge", "output_rows"));
    let _ = counter!(reconcile_metric!(counter, "monotonic", "rows_removed"));
    let _ = counter!(reconcile_metric!(counter, "monotonic", "budget_exceeded"));
    let _ = counter!(reconcile_metric!(counter, "reconcile", "rows_carried_over"));
    let _ = counter!(reconcile_metric!(counter, "reconcile", "rows_dropped"));
    let _ = counter!(reconcile_metric!(counter, "reconcile", "values_preserved"));
    let _ = counter!(reconcile_metric!(counter, "quality", "rows_filtered"));
    let _ = counter!(reconcile_metric!(counter, "quality", "missing_source_url"));
    let _ = counter!(reconcile_metric!(counter, "run", "success"));
    let _ = counter!(reconcile_metric!(counter, "run", "failures"));
    let _ = histogram!(reconcile_metric!(histogram, "run", "duration_seconds"));
}

pub mod normalize {
    pub fn schema_error() {
        ::metrics::counter!(reconcile_metric!(counter, "normalize", "schema_errors")).increment(1);
    }

    pub fn unknown_value() {
        ::metrics::counter!(reconcile_metric!(counter, "normalize", "unknown_values")).increment(1);
    }

    pub fn observations(count: usize) {
        ::metrics::counter!(reconcile_metric!(counter, "normalize", "observations"))
            .increment(count as u64);
    }
}

pub mod merge {
    pub fn merged(tables: usize, rows: usize) {
        ::metrics::counter!(reconcile_metric!(counter, "merge", "merges"))
            .increment(tables.saturating_sub(1) as u64);
        ::metrics::histogram!(reconcile_metric!(histogram, "merge", "output_rows")).record(rows as f64);
    }

    pub fn cardinality_rejected() {
        ::metrics::counter!(reconcile_metric!(counter, "merge", "cardinality_rejections")).increment(1);
    }
}

pub mod monotonic {
    pub fn rows_removed(count: usize) {
        ::metrics::counter!(reconcile_metric!(counter, "monotonic", "rows_removed"))
            .increment(count as u64);
    }

    pub fn budget_exceeded() {
        ::metrics::counter!(reconcile_metric!(counter, "monotonic", "budget_exceeded")).increment(1);
    }
}

pub mod reconcile {
    use crate::pipeline::processing::reconcile::ReconcileStats;

    pub fn reconciled(stats: &ReconcileStats) {
        ::metrics::counter!(reconcile_metric!(counter, "reconcile", "rows_carried_over"))
            .increment(stats.carried_over_rows as u64);
        ::metrics::counter!(reconcile_metric!(counter, "reconcile", "rows_dropped"))
            .increment(stats.dropped_rows as u64);
        ::metrics::counter!(reconcile_metric!(counter, "reconcile", "values_preserved"))
            .increment(stats.preserved_values as u64);
    }
}

pub mod quality {
    pub fn rows_filtered(count: usize) {
        ::metrics::counter!(reconcile_metric!(counter, "quality", "rows_filtered"))
            .increment(count as u64);
    }

    pub fn missing_source_url() {
        ::metrics::counter!(reconcile_metric!(counter, "quality", "missing_source_url")).increment(1);
    }
}

pub mod run {
    pub fn success(duration_secs: f64) {
        ::metrics::counter!(reconcile_metric!(counter, "run", "success")).increment(1);
        ::metrics::histogram!(reconcile_metric!(histogram, "run", "duration_seconds"))
            .record(duration_secs);
    }

    pub fn failure(rule: &'static str) {
        ::metrics::counter!(reconcile_metric!(counter, "run", "failures"), "rule" => rule).increment(1);
    }
}
