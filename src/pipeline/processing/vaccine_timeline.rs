use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::constants::VACCINE_SEPARATOR;
use crate::domain::{FieldValue, Observation, WideTable};

/// Per-source declaration of how an entity's vaccine timeline is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimelineSpec {
    /// Source whose categorized observations give each vaccine's first use
    #[serde(default)]
    pub derive_from: Option<String>,
    /// Explicit start dates; these replace derived ones
    #[serde(default)]
    pub schedule: BTreeMap<String, NaiveDate>,
}

/// `(vaccine, first_date)` pairs, kept sorted by date then name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaccineTimeline {
    entries: Vec<(String, NaiveDate)>,
}

impl VaccineTimeline {
    /// Build from pairs in any order. A vaccine listed twice keeps its earliest date.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, NaiveDate)>,
        S: Into<String>,
    {
        let mut first: BTreeMap<String, NaiveDate> = BTreeMap::new();
        for (vaccine, date) in entries {
            first
                .entry(vaccine.into())
                .and_modify(|d| *d = (*d).min(date))
                .or_insert(date);
        }
        Self::from_map(first)
    }

    fn from_map(first: BTreeMap<String, NaiveDate>) -> Self {
        let mut entries = first.into_iter().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Self { entries }
    }

    /// First use of each vaccine: the earliest date it has a non-null value.
    pub fn build_from_approvals(observations: &[Observation]) -> Self {
        Self::new(
            observations
                .iter()
                .filter(|o| o.value.is_some())
                .filter_map(|o| o.category.clone().map(|vaccine| (vaccine, o.date))),
        )
    }

    /// Pin `vaccine` to `date`, replacing whatever was derived for it.
    pub fn with_override(self, vaccine: impl Into<String>, date: NaiveDate) -> Self {
        let mut first = self.entries.into_iter().collect::<BTreeMap<_, _>>();
        first.insert(vaccine.into(), date);
        Self::from_map(first)
    }

    pub fn entries(&self) -> &[(String, NaiveDate)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timeline_for(&self, date: NaiveDate) -> BTreeSet<String> {
        self.entries
            .iter()
            .take_while(|(_, first)| *first <= date)
            .map(|(vaccine, _)| vaccine.clone())
            .collect()
    }

    /// Fill `column` with the vaccines in use on each row's date, for rows
    /// that do not already name them. Dates before the first entry stay null.
    pub fn annotate(&self, table: &mut WideTable, column: &str) -> usize {
        let mut filled = 0;
        for row in table.rows_mut() {
            if row.text(column).is_some() {
                continue;
            }
            let vaccines = self.timeline_for(row.date);
            if vaccines.is_empty() {
                continue;
            }
            let joined = vaccines.into_iter().collect::<Vec<_>>().join(VACCINE_SEPARATOR);
            row.set(column, Some(FieldValue::Text(joined)));
            filled += 1;
        }
        table.add_column(column);
        filled
    }
}

/// Vaccines in use on `date` according to `timeline`.
pub fn timeline_for(date: NaiveDate, timeline: &VaccineTimeline) -> BTreeSet<String> {
    timeline.timeline_for(date)
}
