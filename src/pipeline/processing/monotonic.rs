//! Non-decreasing enforcement for cumulative counters.
//!
//! The corrector never rewrites an accepted value. When a later point drops
//! below what was already accepted, that later point is removed. Removal is
//! bounded: a feed that needs more deletions than the budget allows is
//! treated as broken and the run stops.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::domain::{WideRecord, WideTable};
use crate::error::{ReconcileError, Result};
use crate::observability::metrics::monotonic as metrics;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Corrected {
    pub points: Vec<SeriesPoint>,
    pub removed: Vec<NaiveDate>,
}

/// Restore non-decreasing order on one entity's series of `metric`.
///
/// Nulls pass through and do not move the reference value.
pub fn enforce_monotonic(
    entity: &str,
    metric: &str,
    series: &[SeriesPoint],
    max_removed: usize,
) -> Result<Corrected> {
    let mut ordered = series.to_vec();
    ordered.sort_by_key(|p| p.date);

    let mut last_accepted: Option<f64> = None;
    let mut points = Vec::with_capacity(ordered.len());
    let mut removed = Vec::new();

    for point in ordered {
        match point.value {
            None => points.push(point),
            Some(value) if last_accepted.map_or(true, |last| value >= last) => {
                last_accepted = Some(value);
                points.push(point);
            }
            Some(_) => {
                if removed.len() >= max_removed {
                    metrics::budget_exceeded();
                    return Err(ReconcileError::MonotonicityBudgetExceeded {
                        entity: entity.to_string(),
                        date: point.date,
                        metric: metric.to_string(),
                        max_removed,
                    });
                }
                removed.push(point.date);
            }
        }
    }

    Ok(Corrected { points, removed })
}

/// Dates removed per entity by a table-level correction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrectionReport {
    pub removed: BTreeMap<String, Vec<NaiveDate>>,
}

impl CorrectionReport {
    pub fn total_removed(&self) -> usize {
        self.removed.values().map(Vec::len).sum()
    }
}

/// Row-level corrector over a set of cumulative metrics of a wide table.
///
/// A row is removed when any of its non-null cumulative metrics is below that
/// metric's last accepted value for the entity. The budget counts removed rows
/// per entity. In strict mode a value equal to the last accepted one is a
/// violation too.
#[derive(Debug, Clone)]
pub struct MonotonicCorrector {
    metrics: Vec<String>,
    max_removed: usize,
    strict: bool,
}

impl MonotonicCorrector {
    pub fn new(metrics: Vec<String>, max_removed: usize) -> Self {
        Self {
            metrics,
            max_removed,
            strict: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn correct_table(&self, table: &WideTable) -> Result<(WideTable, CorrectionReport)> {
        let mut by_entity: BTreeMap<&str, Vec<&WideRecord>> = BTreeMap::new();
        for row in table.rows() {
            by_entity.entry(row.entity.as_str()).or_default().push(row);
        }

        let mut out = WideTable::new(table.label()).with_columns(table.columns().iter().cloned());
        let mut report = CorrectionReport::default();

        for (entity, mut rows) in by_entity {
            rows.sort_by_key(|row| row.date);
            let mut last: BTreeMap<&str, f64> = BTreeMap::new();
            let mut removed = Vec::new();

            for row in rows {
                match self.first_violation(row, &last) {
                    None => {
                        for metric in &self.metrics {
                            if let Some(value) = row.number(metric) {
                                last.insert(metric.as_str(), value);
                            }
                        }
                        out.push(row.clone());
                    }
                    Some(metric) => {
                        if removed.len() >= self.max_removed {
                            metrics::budget_exceeded();
                            return Err(ReconcileError::MonotonicityBudgetExceeded {
                                entity: entity.to_string(),
                                date: row.date,
                                metric: metric.to_string(),
                                max_removed: self.max_removed,
                            });
                        }
                        debug!("Removing {} {} ({} decreased)", entity, row.date, metric);
                        removed.push(row.date);
                    }
                }
            }

            if !removed.is_empty() {
                warn!(
                    "Removed {} out-of-order rows for {} in '{}'",
                    removed.len(),
                    entity,
                    table.label()
                );
                metrics::rows_removed(removed.len());
                report.removed.insert(entity.to_string(), removed);
            }
        }

        Ok((out, report))
    }

    fn first_violation<'a>(&'a self, row: &WideRecord, last: &BTreeMap<&str, f64>) -> Option<&'a str> {
        self.metrics
            .iter()
            .find(|metric| match (row.number(metric), last.get(metric.as_str())) {
                (Some(value), Some(previous)) if self.strict => value <= *previous,
                (Some(value), Some(previous)) => value < *previous,
                _ => false,
            })
            .map(String::as_str)
    }
}
