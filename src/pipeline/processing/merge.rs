//! Key-aligned merging of wide tables.
//!
//! Every merge validates one-to-one cardinality on `(entity, date)` for both
//! sides before joining, and the output is always sorted by key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::domain::{RecordKey, WideRecord, WideTable};
use crate::error::{ReconcileError, Result};
use crate::observability::metrics::merge as metrics;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Keys present on both sides
    Inner,
    /// Keys of the accumulated left side only; the right side never adds rows
    Left,
    /// Union of keys
    Outer,
}

/// Merge `tables` left to right; `joins[i]` joins `tables[i + 1]` onto the
/// accumulated result.
///
/// When two tables define the same column, the later table wins for every key
/// it contains (including an explicit null). Keys it does not contain keep
/// the earlier value.
pub fn merge(tables: &[WideTable], joins: &[JoinKind]) -> Result<WideTable> {
    let (first, rest) = tables
        .split_first()
        .ok_or_else(|| ReconcileError::Config("merge needs at least one table".to_string()))?;
    if joins.len() != rest.len() {
        return Err(ReconcileError::Config(format!(
            "merge of {} tables needs {} join kinds, got {}",
            tables.len(),
            rest.len(),
            joins.len()
        )));
    }

    let mut acc = keyed(first)?;
    let mut columns = first.columns().clone();
    let mut labels = vec![first.label().to_string()];

    for (right, kind) in rest.iter().zip(joins) {
        let right_rows = keyed(right)?;
        acc = join_pair(acc, right_rows, right, *kind);
        columns.extend(right.columns().iter().cloned());
        labels.push(right.label().to_string());
        debug!("Joined '{}' ({:?}): {} rows", right.label(), kind, acc.len());
    }

    metrics::merged(tables.len(), acc.len());
    let mut out = WideTable::new(labels.join("+")).with_columns(columns);
    for record in acc.into_values() {
        out.push(record);
    }
    Ok(out)
}

fn keyed(table: &WideTable) -> Result<BTreeMap<RecordKey, WideRecord>> {
    table.index().map_err(|err| {
        metrics::cardinality_rejected();
        err
    })?;
    Ok(table
        .rows()
        .iter()
        .map(|row| (row.key(), row.clone()))
        .collect())
}

fn join_pair(
    mut left: BTreeMap<RecordKey, WideRecord>,
    mut right: BTreeMap<RecordKey, WideRecord>,
    right_table: &WideTable,
    kind: JoinKind,
) -> BTreeMap<RecordKey, WideRecord> {
    if kind == JoinKind::Inner {
        left.retain(|key, _| right.contains_key(key));
    }

    for (key, record) in left.iter_mut() {
        if let Some(incoming) = right.remove(key) {
            overlay(record, incoming, right_table);
        }
    }

    if kind == JoinKind::Outer {
        left.extend(right);
    }
    left
}

/// Apply the right-side record over the left one for every column the right
/// table defines.
fn overlay(target: &mut WideRecord, mut incoming: WideRecord, right_table: &WideTable) {
    for column in right_table.columns() {
        let value = incoming.fields.remove(column);
        target.set(column, value);
    }
}
