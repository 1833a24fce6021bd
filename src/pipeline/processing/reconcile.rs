use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::domain::{RecordKey, WideRecord, WideTable};
use crate::error::Result;
use crate::observability::metrics::reconcile as metrics;

/// What happens to rows that only exist in the previous snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPolicy {
    /// Keep them; the fresh extract only covers recent dates
    #[default]
    RetainPrevious,
    /// Drop those outside the fresh extract's date range for the entity; the
    /// source republishes its full history every run
    TruncateToFresh,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReconcileOptions {
    /// Fields that fall back to the previous value when the fresh one is null
    #[serde(default)]
    pub preserved_fields: BTreeSet<String>,
    #[serde(default)]
    pub history: HistoryPolicy,
}

/// Counts reported by one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub carried_over_rows: usize,
    pub dropped_rows: usize,
    pub preserved_values: usize,
}

/// Merge a freshly computed table against the last persisted snapshot.
///
/// Neither input is modified; the result supersedes `previous`.
pub fn reconcile(
    fresh: &WideTable,
    previous: &WideTable,
    options: &ReconcileOptions,
) -> Result<(WideTable, ReconcileStats)> {
    let fresh_rows = fresh.index()?;
    let previous_rows = previous.index()?;
    let mut stats = ReconcileStats::default();

    let mut merged: BTreeMap<RecordKey, WideRecord> = BTreeMap::new();
    for (key, row) in &fresh_rows {
        let mut record = (*row).clone();
        if let Some(old) = previous_rows.get(key) {
            for field in &options.preserved_fields {
                if record.get(field).is_none() {
                    if let Some(value) = old.get(field) {
                        record.set(field, Some(value.clone()));
                        stats.preserved_values += 1;
                    }
                }
            }
        }
        merged.insert(key.clone(), record);
    }

    for (key, row) in &previous_rows {
        if merged.contains_key(key) {
            continue;
        }
        let keep = match options.history {
            HistoryPolicy::RetainPrevious => true,
            HistoryPolicy::TruncateToFresh => fresh
                .date_range(&key.0)
                .map_or(false, |(first, last)| first <= key.1 && key.1 <= last),
        };
        if keep {
            merged.insert(key.clone(), (*row).clone());
            stats.carried_over_rows += 1;
        } else {
            stats.dropped_rows += 1;
        }
    }

    debug!(
        "Reconciled '{}' against snapshot: {} rows ({} carried over, {} dropped, {} preserved values)",
        fresh.label(),
        merged.len(),
        stats.carried_over_rows,
        stats.dropped_rows,
        stats.preserved_values
    );
    metrics::reconciled(&stats);

    let mut out = WideTable::new(fresh.label())
        .with_columns(fresh.columns().iter().cloned())
        .with_columns(previous.columns().iter().cloned());
    for record in merged.into_values() {
        out.push(record);
    }
    Ok((out, stats))
}
