//! Versioned data patches for known upstream anomalies.
//!
//! A rule either drops an entity's rows on the listed dates or, when it names
//! metrics, nulls only those fields. Rules carry an optional expiry date and
//! stop applying once the run date is past it.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::domain::WideTable;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExclusionRule {
    pub entity: String,
    /// Restrict the rule to tables built from this source
    #[serde(default)]
    pub source_id: Option<String>,
    pub dates: BTreeSet<NaiveDate>,
    /// Fields to null; absent means the whole row is dropped
    #[serde(default)]
    pub metrics: Option<Vec<String>>,
    pub reason: String,
    #[serde(default)]
    pub expires_on: Option<NaiveDate>,
}

impl ExclusionRule {
    pub fn is_active(&self, run_date: NaiveDate) -> bool {
        self.expires_on.map_or(true, |expiry| run_date <= expiry)
    }

    fn matches_source(&self, sources: &BTreeSet<String>) -> bool {
        self.source_id
            .as_ref()
            .map_or(true, |source| sources.contains(source))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExclusionList {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<ExclusionRule>,
}

/// What one application of the list changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExclusionOutcome {
    pub rows_dropped: usize,
    pub fields_nulled: usize,
}

impl ExclusionList {
    /// Apply the active rules to a table built from `sources`.
    pub fn apply(
        &self,
        table: &WideTable,
        sources: &BTreeSet<String>,
        run_date: NaiveDate,
    ) -> (WideTable, ExclusionOutcome) {
        let mut out = table.clone();
        let mut outcome = ExclusionOutcome::default();

        for rule in &self.rules {
            if !rule.matches_source(sources) || !out.entities().contains(rule.entity.as_str()) {
                continue;
            }
            if !rule.is_active(run_date) {
                warn!(
                    "Skipping expired exclusion for {} (v{}, expired {:?}): {}",
                    rule.entity, self.version, rule.expires_on, rule.reason
                );
                continue;
            }

            match &rule.metrics {
                None => {
                    let before = out.len();
                    out.retain(|row| !(row.entity == rule.entity && rule.dates.contains(&row.date)));
                    outcome.rows_dropped += before - out.len();
                }
                Some(metrics) => {
                    for row in out.rows_mut() {
                        if row.entity != rule.entity || !rule.dates.contains(&row.date) {
                            continue;
                        }
                        for metric in metrics {
                            if row.get(metric).is_some() {
                                row.set(metric, None);
                                outcome.fields_nulled += 1;
                            }
                        }
                    }
                }
            }
            info!("Applied exclusion for {}: {}", rule.entity, rule.reason);
        }

        (out, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WideRecord;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 5, d).unwrap()
    }

    fn table() -> WideTable {
        WideTable::from_records(
            "cases",
            vec![
                WideRecord::new("Ecuador", day(1))
                    .with_number("total_cases", 10.0)
                    .with_number("total_deaths", 1.0),
                WideRecord::new("Ecuador", day(2))
                    .with_number("total_cases", 90.0)
                    .with_number("total_deaths", 2.0),
                WideRecord::new("Peru", day(2)).with_number("total_cases", 5.0),
            ],
        )
    }

    fn rule(metrics: Option<Vec<&str>>, expires_on: Option<NaiveDate>) -> ExclusionRule {
        ExclusionRule {
            entity: "Ecuador".to_string(),
            source_id: None,
            dates: BTreeSet::from([day(2)]),
            metrics: metrics.map(|m| m.into_iter().map(str::to_string).collect()),
            reason: "batch of backlogged reports".to_string(),
            expires_on,
        }
    }

    fn sources() -> BTreeSet<String> {
        BTreeSet::from(["ec_cases".to_string()])
    }

    #[test]
    fn test_rule_without_metrics_drops_rows() {
        let list = ExclusionList { version: 1, rules: vec![rule(None, None)] };
        let (out, outcome) = list.apply(&table(), &sources(), day(20));
        assert_eq!(out.len(), 2);
        assert_eq!(outcome.rows_dropped, 1);
        assert!(out.rows().iter().all(|r| !(r.entity == "Ecuador" && r.date == day(2))));
    }

    #[test]
    fn test_rule_with_metrics_nulls_fields() {
        let list = ExclusionList { version: 1, rules: vec![rule(Some(vec!["total_cases"]), None)] };
        let (out, outcome) = list.apply(&table(), &sources(), day(20));
        assert_eq!(out.len(), 3);
        assert_eq!(outcome.fields_nulled, 1);
        assert_eq!(out.rows()[1].number("total_cases"), None);
        assert_eq!(out.rows()[1].number("total_deaths"), Some(2.0));
    }

    #[test]
    fn test_expired_rule_is_skipped() {
        let list = ExclusionList { version: 2, rules: vec![rule(None, Some(day(10)))] };
        let (still_active, _) = list.apply(&table(), &sources(), day(10));
        assert_eq!(still_active.len(), 2);

        let (expired, outcome) = list.apply(&table(), &sources(), day(11));
        assert_eq!(expired.len(), 3);
        assert_eq!(outcome, ExclusionOutcome::default());
    }

    #[test]
    fn test_source_scoped_rule_ignores_other_sources() {
        let mut scoped = rule(None, None);
        scoped.source_id = Some("other_feed".to_string());
        let list = ExclusionList { version: 1, rules: vec![scoped] };
        let (out, _) = list.apply(&table(), &sources(), day(20));
        assert_eq!(out.len(), 3);
    }
}
