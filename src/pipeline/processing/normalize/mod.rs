use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::constants::{BREAKDOWN_SEPARATOR, DEFAULT_DATE_FORMAT, SOURCE_URL};
use crate::domain::{ExtractMeta, FieldValue, Observation, RecordKey, SourceExtract, WideRecord, WideTable};
use crate::error::{ReconcileError, Result};
use crate::observability::metrics::normalize as metrics;

pub mod cadence;

pub use cadence::{apply_cadence, CadenceTransform};

/// Allowed values per categorical column.
pub type KnownValues = BTreeMap<String, BTreeSet<String>>;

/// Where the entity name of each row comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EntityColumn {
    /// Read the entity from a column of the extract
    Column(String),
    /// Single-entity feed; every row belongs to this entity
    Fixed(String),
}

/// A raw metric column and the canonical indicator it feeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricColumn {
    pub column: String,
    pub indicator: String,
    /// Multiplicative unit conversion (e.g. thousands -> units)
    #[serde(default)]
    pub scale: Option<f64>,
}

/// Declarative description of how one source maps onto the canonical schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMapping {
    pub entity: EntityColumn,
    pub date_column: String,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    pub metrics: Vec<MetricColumn>,
    /// Column carrying a categorical breakdown (e.g. vaccine manufacturer)
    #[serde(default)]
    pub category_column: Option<String>,
    /// Raw category code -> canonical name
    #[serde(default)]
    pub category_aliases: BTreeMap<String, String>,
    /// Columns the feed must carry even though they are not mapped
    #[serde(default)]
    pub required_columns: BTreeSet<String>,
    /// Indicators that also keep one column per category next to their sum
    #[serde(default)]
    pub category_breakdown: BTreeSet<String>,
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.to_string()
}

impl ColumnMapping {
    /// Every column the mapping reads or declares as required.
    pub fn referenced_columns(&self) -> BTreeSet<String> {
        let mut columns = self.required_columns.clone();
        if let EntityColumn::Column(column) = &self.entity {
            columns.insert(column.clone());
        }
        columns.insert(self.date_column.clone());
        columns.extend(self.metrics.iter().map(|m| m.column.clone()));
        if let Some(category) = &self.category_column {
            columns.insert(category.clone());
        }
        columns
    }
}

/// Map a raw extract onto canonical observations.
///
/// Pure function of its inputs. Nulls pass through as `value: None`; anything
/// that does not fit the declared contract is an error, never dropped.
pub fn normalize(
    extract: &SourceExtract,
    mapping: &ColumnMapping,
    known_values: Option<&KnownValues>,
) -> Result<Vec<Observation>> {
    let source_id = extract.source_id();

    let mut expected = mapping.referenced_columns();
    if let Some(known) = known_values {
        expected.extend(known.keys().cloned());
    }
    let missing = expected
        .into_iter()
        .filter(|column| !extract.has_column(column))
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        metrics::schema_error();
        return Err(ReconcileError::Schema {
            source_id: source_id.to_string(),
            missing,
        });
    }

    if let Some(known) = known_values {
        check_known_values(extract, known)?;
    }

    let mut observations = Vec::with_capacity(extract.rows().len() * mapping.metrics.len());
    for row in extract.rows() {
        let entity = match &mapping.entity {
            EntityColumn::Fixed(name) => name.clone(),
            EntityColumn::Column(column) => {
                let cell = row.get(column).unwrap_or(&Value::Null);
                cell_text(cell).ok_or_else(|| invalid(source_id, column, cell, "entity is empty"))?
            }
        };

        let date_cell = row.get(&mapping.date_column).unwrap_or(&Value::Null);
        let date = parse_date(date_cell, &mapping.date_format)
            .ok_or_else(|| invalid(source_id, &mapping.date_column, date_cell, "not a date"))?;

        let category = mapping.category_column.as_ref().and_then(|column| {
            row.get(column).and_then(cell_text).map(|raw| {
                mapping
                    .category_aliases
                    .get(&raw)
                    .cloned()
                    .unwrap_or(raw)
            })
        });

        for metric in &mapping.metrics {
            let cell = row.get(&metric.column).unwrap_or(&Value::Null);
            let value = parse_number(cell)
                .map_err(|reason| invalid(source_id, &metric.column, cell, reason))?
                .map(|v| v * metric.scale.unwrap_or(1.0));

            observations.push(Observation {
                entity: entity.clone(),
                date,
                indicator: metric.indicator.clone(),
                category: category.clone(),
                value,
            });
        }
    }

    debug!(
        "Normalized {} rows of '{}' into {} observations",
        extract.rows().len(),
        source_id,
        observations.len()
    );
    metrics::observations(observations.len());
    Ok(observations)
}

fn check_known_values(extract: &SourceExtract, known: &KnownValues) -> Result<()> {
    for (column, allowed) in known {
        let unknown = extract
            .rows()
            .iter()
            .filter_map(|row| row.get(column).and_then(cell_text))
            .filter(|value| !allowed.contains(value))
            .collect::<BTreeSet<_>>();
        if !unknown.is_empty() {
            metrics::unknown_value();
            return Err(ReconcileError::UnknownValue {
                source_id: extract.source_id().to_string(),
                column: column.clone(),
                values: unknown.into_iter().collect(),
            });
        }
    }
    Ok(())
}

/// Column holding one category's share of `indicator`.
pub fn breakdown_column(indicator: &str, category: &str) -> String {
    format!("{indicator}{BREAKDOWN_SEPARATOR}{category}")
}

/// Fold observations into a wide table keyed by `(entity, date)`.
///
/// Categorized values of the same indicator are summed. Indicators listed in
/// `breakdown` additionally get a [`breakdown_column`] per category. Two
/// uncategorized values for the same indicator and key are an upstream
/// duplicate.
pub fn pivot(
    observations: &[Observation],
    meta: &ExtractMeta,
    label: &str,
    breakdown: &BTreeSet<String>,
) -> Result<WideTable> {
    #[derive(Default)]
    struct Cell {
        sum: Option<f64>,
        plain: bool,
        categories: BTreeSet<String>,
        parts: BTreeMap<String, Option<f64>>,
    }

    let mut grid: BTreeMap<RecordKey, BTreeMap<&str, Cell>> = BTreeMap::new();
    let mut columns = BTreeSet::new();

    for obs in observations {
        columns.insert(obs.indicator.clone());
        let cell = grid
            .entry((obs.entity.clone(), obs.date))
            .or_default()
            .entry(obs.indicator.as_str())
            .or_default();

        let duplicate = match &obs.category {
            None => cell.plain || !cell.categories.is_empty(),
            Some(category) => cell.plain || !cell.categories.insert(category.clone()),
        };
        if duplicate {
            return Err(ReconcileError::Cardinality {
                table: label.to_string(),
                entity: obs.entity.clone(),
                date: obs.date,
            });
        }
        cell.plain = obs.category.is_none();

        if let Some(category) = obs.category.as_ref().filter(|_| breakdown.contains(&obs.indicator)) {
            columns.insert(breakdown_column(&obs.indicator, category));
            cell.parts.insert(category.clone(), obs.value);
        }
        if let Some(value) = obs.value {
            cell.sum = Some(cell.sum.unwrap_or(0.0) + value);
        }
    }

    let mut table = WideTable::new(label).with_columns(columns).with_columns([SOURCE_URL]);
    for ((entity, date), cells) in grid {
        let mut record = WideRecord::new(entity, date).with_text(SOURCE_URL, meta.source_url.clone());
        for (indicator, cell) in cells {
            record.set(indicator, cell.sum.map(FieldValue::Number));
            for (category, value) in cell.parts {
                record.set(&breakdown_column(indicator, &category), value.map(FieldValue::Number));
            }
        }
        table.push(record);
    }
    Ok(table)
}

fn invalid(source_id: &str, column: &str, cell: &Value, reason: &str) -> ReconcileError {
    ReconcileError::InvalidValue {
        source_id: source_id.to_string(),
        column: column.to_string(),
        value: cell.to_string(),
        reason: reason.to_string(),
    }
}

/// Render a cell as trimmed text; null and blank cells are `None`.
fn cell_text(cell: &Value) -> Option<String> {
    match cell {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        other => Some(other.to_string()),
    }
}

fn parse_date(cell: &Value, format: &str) -> Option<NaiveDate> {
    cell.as_str()
        .and_then(|s| NaiveDate::parse_from_str(s.trim(), format).ok())
}

fn parse_number(cell: &Value) -> std::result::Result<Option<f64>, &'static str> {
    let value = match cell {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64().ok_or("number out of range")?,
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| "not a number")?,
        _ => return Err("not a number"),
    };
    if value.is_finite() {
        Ok(Some(value))
    } else {
        Err("not a finite number")
    }
}
