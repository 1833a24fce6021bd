use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{PEOPLE_FULLY_VACCINATED, PEOPLE_VACCINATED, SOURCE_URL};
use crate::domain::{WideRecord, WideTable};
use crate::error::{ReconcileError, Result};
use crate::observability::metrics::quality as metrics;

/// Individual quality issue found during assessment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityIssue {
    /// The type of quality issue
    pub issue_type: QualityIssueType,
    /// Severity level of the issue
    pub severity: QualitySeverity,
    pub entity: String,
    pub date: chrono::NaiveDate,
    /// Human-readable description of the issue
    pub description: String,
}

/// Types of quality issues that can be detected
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssueType {
    /// More people fully vaccinated than vaccinated at all
    DoseOrdering,
    /// Cumulative metrics repeated unchanged from the previous report
    RepeatedReport,
}

/// Severity levels for quality issues
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum QualitySeverity {
    /// Row was collapsed into an equivalent one
    Info,
    /// Row was filtered out
    Warning,
}

/// Configuration for Quality Gate assessment rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityGateConfig {
    /// Remove rows where fully vaccinated exceeds vaccinated
    #[serde(default = "default_true")]
    pub enforce_dose_ordering: bool,
    /// Keep only the first of consecutive rows with identical cumulative metrics
    #[serde(default)]
    pub collapse_repeated: bool,
}

fn default_true() -> bool {
    true
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            enforce_dose_ordering: true,
            collapse_repeated: false,
        }
    }
}

/// Final checkpoint before a table is exported.
pub struct QualityGate {
    pub config: QualityGateConfig,
}

impl QualityGate {
    pub fn with_config(config: QualityGateConfig) -> Self {
        Self { config }
    }

    /// Filter rows that break soft invariants and reject tables that break hard ones.
    ///
    /// A row without `source_url` is a hard failure: it cannot be exported.
    pub fn assess(
        &self,
        table: &WideTable,
        cumulative_metrics: &[String],
    ) -> Result<(WideTable, Vec<QualityIssue>)> {
        if let Some(row) = table
            .rows()
            .iter()
            .find(|row| row.text(SOURCE_URL).map_or(true, |url| url.trim().is_empty()))
        {
            metrics::missing_source_url();
            return Err(ReconcileError::MissingSourceUrl {
                table: table.label().to_string(),
                entity: row.entity.clone(),
                date: row.date,
            });
        }

        let mut issues = Vec::new();
        let mut out = WideTable::new(table.label()).with_columns(table.columns().iter().cloned());
        let mut previous: Option<&WideRecord> = None;

        for row in table.rows() {
            if self.config.enforce_dose_ordering {
                if let Some(description) = dose_ordering_violation(row) {
                    issues.push(QualityIssue {
                        issue_type: QualityIssueType::DoseOrdering,
                        severity: QualitySeverity::Warning,
                        entity: row.entity.clone(),
                        date: row.date,
                        description,
                    });
                    continue;
                }
            }

            if self.config.collapse_repeated {
                if let Some(prev) = previous {
                    if prev.entity == row.entity && same_cumulative(prev, row, cumulative_metrics) {
                        issues.push(QualityIssue {
                            issue_type: QualityIssueType::RepeatedReport,
                            severity: QualitySeverity::Info,
                            entity: row.entity.clone(),
                            date: row.date,
                            description: format!("same cumulative values as {}", prev.date),
                        });
                        continue;
                    }
                }
            }

            previous = Some(row);
            out.push(row.clone());
        }

        if !issues.is_empty() {
            warn!(
                "Quality gate removed {} rows from '{}'",
                issues.len(),
                table.label()
            );
        }
        metrics::rows_filtered(issues.len());
        Ok((out, issues))
    }
}

fn dose_ordering_violation(row: &WideRecord) -> Option<String> {
    let vaccinated = row.number(PEOPLE_VACCINATED)?;
    let fully = row.number(PEOPLE_FULLY_VACCINATED)?;
    (fully > vaccinated).then(|| {
        format!(
            "{} ({}) exceeds {} ({})",
            PEOPLE_FULLY_VACCINATED, fully, PEOPLE_VACCINATED, vaccinated
        )
    })
}

fn same_cumulative(a: &WideRecord, b: &WideRecord, metrics: &[String]) -> bool {
    let any_value = metrics.iter().any(|m| b.number(m).is_some());
    any_value && metrics.iter().all(|m| a.number(m) == b.number(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 8, d).unwrap()
    }

    fn row(d: u32, vaccinated: f64, fully: f64) -> WideRecord {
        WideRecord::new("Portugal", day(d))
            .with_text(SOURCE_URL, "https://example.org/pt")
            .with_number(PEOPLE_VACCINATED, vaccinated)
            .with_number(PEOPLE_FULLY_VACCINATED, fully)
    }

    fn cumulative() -> Vec<String> {
        vec![PEOPLE_VACCINATED.to_string(), PEOPLE_FULLY_VACCINATED.to_string()]
    }

    #[test]
    fn test_dose_ordering_violations_are_filtered() {
        let table = WideTable::from_records("vaccinations", vec![row(1, 10.0, 4.0), row(2, 11.0, 12.0)]);
        let gate = QualityGate::with_config(QualityGateConfig::default());

        let (out, issues) = gate.assess(&table, &cumulative()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, QualityIssueType::DoseOrdering);
        assert_eq!(issues[0].date, day(2));
    }

    #[test]
    fn test_repeated_reports_collapse_to_first() {
        let table = WideTable::from_records(
            "vaccinations",
            vec![row(1, 10.0, 4.0), row(2, 10.0, 4.0), row(3, 12.0, 4.0)],
        );
        let gate = QualityGate::with_config(QualityGateConfig {
            enforce_dose_ordering: true,
            collapse_repeated: true,
        });

        let (out, issues) = gate.assess(&table, &cumulative()).unwrap();
        let dates = out.rows().iter().map(|r| r.date).collect::<Vec<_>>();
        assert_eq!(dates, vec![day(1), day(3)]);
        assert_eq!(issues[0].severity, QualitySeverity::Info);
    }

    #[test]
    fn test_missing_source_url_is_rejected() {
        let table = WideTable::from_records(
            "vaccinations",
            vec![WideRecord::new("Portugal", day(1)).with_number(PEOPLE_VACCINATED, 1.0)],
        );
        let gate = QualityGate::with_config(QualityGateConfig::default());
        let err = gate.assess(&table, &cumulative()).unwrap_err();
        assert_eq!(err.rule(), "missing_source_url");
    }
}
