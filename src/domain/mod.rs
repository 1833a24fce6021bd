//! Canonical data shapes shared across the reconciliation pipeline.
//!
//! Source adapters hand over [`SourceExtract`]s, the normalizer turns them into
//! long-form [`Observation`]s, and everything downstream works on
//! [`WideTable`]s keyed by `(entity, date)`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ReconcileError, Result};

/// A raw row as handed over by a source adapter: named fields, untyped values.
pub type RawRow = serde_json::Map<String, serde_json::Value>;

/// The `(entity, date)` join key.
pub type RecordKey = (String, NaiveDate);

/// Extract-level metadata supplied by the adapter that fetched the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractMeta {
    pub source_id: String,
    pub source_name: String,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
}

/// One immutable fetch of an upstream feed.
///
/// The column set is fixed at construction. Transformations never mutate an
/// extract; they produce observations or tables from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceExtract {
    meta: ExtractMeta,
    columns: BTreeSet<String>,
    rows: Vec<RawRow>,
}

impl SourceExtract {
    /// Build an extract whose column set is the union of the row keys.
    pub fn new(meta: ExtractMeta, rows: Vec<RawRow>) -> Self {
        let columns = rows
            .iter()
            .flat_map(|row| row.keys().cloned())
            .collect::<BTreeSet<_>>();
        Self { meta, columns, rows }
    }

    /// Build an extract with an explicit header, as delivered by tabular feeds
    /// where a column can exist even when every cell in it is empty.
    pub fn with_columns<I, S>(meta: ExtractMeta, columns: I, rows: Vec<RawRow>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut columns = columns.into_iter().map(Into::into).collect::<BTreeSet<_>>();
        columns.extend(rows.iter().flat_map(|row| row.keys().cloned()));
        Self { meta, columns, rows }
    }

    pub fn meta(&self) -> &ExtractMeta {
        &self.meta
    }

    pub fn source_id(&self) -> &str {
        &self.meta.source_id
    }

    pub fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    pub fn rows(&self) -> &[RawRow] {
        &self.rows
    }
}

/// Long-form atomic fact produced by the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub entity: String,
    pub date: NaiveDate,
    pub indicator: String,
    /// Categorical breakdown of the value (e.g. the vaccine manufacturer).
    pub category: Option<String>,
    pub value: Option<f64>,
}

/// A single cell of a wide record. Absent keys stand for null.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(value) => Some(*value),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(value) => Some(value),
            FieldValue::Number(_) => None,
        }
    }
}

/// One row per `(entity, date)` with named metric fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WideRecord {
    pub entity: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl WideRecord {
    pub fn new(entity: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            entity: entity.into(),
            date,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_number(mut self, field: impl Into<String>, value: f64) -> Self {
        self.fields.insert(field.into(), FieldValue::Number(value));
        self
    }

    pub fn with_text(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), FieldValue::Text(value.into()));
        self
    }

    pub fn key(&self) -> RecordKey {
        (self.entity.clone(), self.date)
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(FieldValue::as_number)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(FieldValue::as_text)
    }

    /// Set a field; `None` clears it back to null.
    pub fn set(&mut self, field: &str, value: Option<FieldValue>) {
        match value {
            Some(value) => {
                self.fields.insert(field.to_string(), value);
            }
            None => {
                self.fields.remove(field);
            }
        }
    }
}

/// A table of wide records plus the set of columns it defines.
///
/// A column can be defined even when every cell in it is null; the merger and
/// the reconciler rely on that distinction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WideTable {
    label: String,
    columns: BTreeSet<String>,
    rows: Vec<WideRecord>,
}

impl WideTable {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            columns: BTreeSet::new(),
            rows: Vec::new(),
        }
    }

    pub fn from_records(label: impl Into<String>, records: Vec<WideRecord>) -> Self {
        let mut table = Self::new(label);
        for record in records {
            table.push(record);
        }
        table
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn relabel(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }

    pub fn defines(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    pub fn add_column(&mut self, column: impl Into<String>) {
        self.columns.insert(column.into());
    }

    pub fn rows(&self) -> &[WideRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, record: WideRecord) {
        self.columns.extend(record.fields.keys().cloned());
        self.rows.push(record);
    }

    /// Sort rows by `(entity, date)` ascending. Stable for equal keys.
    pub fn sort(&mut self) {
        self.rows
            .sort_by(|a, b| a.entity.cmp(&b.entity).then(a.date.cmp(&b.date)));
    }

    pub fn sorted(mut self) -> Self {
        self.sort();
        self
    }

    pub fn is_sorted(&self) -> bool {
        self.rows
            .windows(2)
            .all(|pair| (&pair[0].entity, pair[0].date) <= (&pair[1].entity, pair[1].date))
    }

    /// Index rows by key, failing on the first duplicate.
    pub fn index(&self) -> Result<BTreeMap<RecordKey, &WideRecord>> {
        let mut index = BTreeMap::new();
        for row in &self.rows {
            if index.insert(row.key(), row).is_some() {
                return Err(ReconcileError::Cardinality {
                    table: self.label.clone(),
                    entity: row.entity.clone(),
                    date: row.date,
                });
            }
        }
        Ok(index)
    }

    pub fn ensure_unique_keys(&self) -> Result<()> {
        self.index().map(|_| ())
    }

    pub fn entities(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|row| row.entity.as_str()).collect()
    }

    /// Earliest and latest date present for `entity`.
    pub fn date_range(&self, entity: &str) -> Option<(NaiveDate, NaiveDate)> {
        let mut dates = self
            .rows
            .iter()
            .filter(|row| row.entity == entity)
            .map(|row| row.date);
        let first = dates.next()?;
        Some(dates.fold((first, first), |(lo, hi), date| (lo.min(date), hi.max(date))))
    }

    /// Keep only the rows matching `predicate`; the column set is unchanged.
    pub fn retain<F>(&mut self, predicate: F)
    where
        F: FnMut(&WideRecord) -> bool,
    {
        self.rows.retain(predicate);
    }

    pub fn rows_mut(&mut self) -> &mut [WideRecord] {
        &mut self.rows
    }

    /// Stack tables with disjoint keys into one sorted table.
    pub fn concat(label: impl Into<String>, tables: Vec<WideTable>) -> Result<WideTable> {
        let mut out = WideTable::new(label);
        for table in tables {
            out.columns.extend(table.columns);
            out.rows.extend(table.rows);
        }
        out.sort();
        out.ensure_unique_keys()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, d).unwrap()
    }

    #[test]
    fn test_index_rejects_duplicate_keys() {
        let table = WideTable::from_records(
            "cases",
            vec![
                WideRecord::new("Chile", day(1)).with_number("total_cases", 1.0),
                WideRecord::new("Chile", day(1)).with_number("total_cases", 2.0),
            ],
        );

        let err = table.index().unwrap_err();
        assert!(matches!(err, ReconcileError::Cardinality { ref entity, .. } if entity == "Chile"));
    }

    #[test]
    fn test_concat_sorts_and_unions_columns() {
        let a = WideTable::from_records(
            "a",
            vec![WideRecord::new("Peru", day(2)).with_number("x", 1.0)],
        );
        let b = WideTable::from_records(
            "b",
            vec![WideRecord::new("Chile", day(5)).with_number("y", 2.0)],
        )
        .with_columns(["z"]);

        let out = WideTable::concat("all", vec![a, b]).unwrap();
        assert!(out.is_sorted());
        assert_eq!(out.rows()[0].entity, "Chile");
        assert_eq!(
            out.columns().iter().cloned().collect::<Vec<_>>(),
            vec!["x", "y", "z"]
        );
    }

    #[test]
    fn test_date_range_per_entity() {
        let table = WideTable::from_records(
            "t",
            vec![
                WideRecord::new("Peru", day(9)),
                WideRecord::new("Peru", day(3)),
                WideRecord::new("Chile", day(1)),
            ],
        );
        assert_eq!(table.date_range("Peru"), Some((day(3), day(9))));
        assert_eq!(table.date_range("Bolivia"), None);
    }

    #[test]
    fn test_set_none_clears_field() {
        let mut record = WideRecord::new("Peru", day(1)).with_number("total_boosters", 5.0);
        record.set("total_boosters", None);
        assert_eq!(record.number("total_boosters"), None);
    }

    #[test]
    fn test_extract_columns_include_header_and_row_keys() {
        let meta = ExtractMeta {
            source_id: "s".to_string(),
            source_name: "S".to_string(),
            source_url: "https://example.org".to_string(),
            fetched_at: Utc::now(),
        };
        let mut row = RawRow::new();
        row.insert("date".to_string(), serde_json::json!("2021-01-01"));
        let extract = SourceExtract::with_columns(meta, ["empty_col"], vec![row]);
        assert!(extract.has_column("empty_col"));
        assert!(extract.has_column("date"));
    }
}
