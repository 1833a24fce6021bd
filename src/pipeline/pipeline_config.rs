use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::WideTable;
use crate::error::{ReconcileError, Result};
use crate::pipeline::processing::merge::{merge, JoinKind};

/// One join applied onto the accumulated table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinStep {
    pub name: String,
    #[serde(default = "default_join")]
    pub join: JoinKind,
}

fn default_join() -> JoinKind {
    JoinKind::Outer
}

/// Ordered merge plan: start from `base`, then apply `joins` left to right.
/// Later members win column collisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinPlan {
    pub base: String,
    #[serde(default)]
    pub joins: Vec<JoinStep>,
}

impl JoinPlan {
    /// Member names in merge order.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.base.as_str()).chain(self.joins.iter().map(|s| s.name.as_str()))
    }

    /// Validate the plan: names are non-empty and appear once.
    pub fn validate(&self, context: &str) -> Result<()> {
        let mut seen = BTreeSet::new();
        for name in self.members() {
            if name.trim().is_empty() {
                return Err(ReconcileError::Config(format!("{}: join plan has an empty member", context)));
            }
            if !seen.insert(name) {
                return Err(ReconcileError::Config(format!(
                    "{}: '{}' appears more than once in the join plan",
                    context, name
                )));
            }
        }
        Ok(())
    }

    /// Merge the tables `lookup` yields for each member, skipping absent ones.
    ///
    /// The first present member becomes the base; each later member keeps its
    /// own join kind. Returns `None` when no member is present.
    pub fn execute<'a, F>(&self, label: &str, mut lookup: F) -> Result<Option<WideTable>>
    where
        F: FnMut(&str) -> Option<&'a WideTable>,
    {
        let mut tables = Vec::new();
        let mut joins = Vec::new();

        let steps = std::iter::once((self.base.as_str(), None))
            .chain(self.joins.iter().map(|s| (s.name.as_str(), Some(s.join))));
        for (name, join) in steps {
            let Some(table) = lookup(name) else { continue };
            if !tables.is_empty() {
                joins.push(join.unwrap_or(JoinKind::Outer));
            }
            tables.push(table.clone());
        }

        if tables.is_empty() {
            return Ok(None);
        }
        Ok(Some(merge(&tables, &joins)?.relabel(label)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WideRecord;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn plan() -> JoinPlan {
        JoinPlan {
            base: "cases".to_string(),
            joins: vec![
                JoinStep { name: "testing".to_string(), join: JoinKind::Outer },
                JoinStep { name: "policy".to_string(), join: JoinKind::Left },
            ],
        }
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut plan = plan();
        plan.joins.push(JoinStep { name: "cases".to_string(), join: JoinKind::Outer });
        assert!(plan.validate("dataset").is_err());
        assert!(self::plan().validate("dataset").is_ok());
    }

    #[test]
    fn test_execute_skips_absent_members() {
        let date = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let mut tables = BTreeMap::new();
        tables.insert(
            "testing",
            WideTable::from_records("testing", vec![WideRecord::new("Chile", date).with_number("total_tests", 5.0)]),
        );
        tables.insert(
            "policy",
            WideTable::from_records(
                "policy",
                vec![
                    WideRecord::new("Chile", date).with_number("stringency", 70.0),
                    WideRecord::new("Peru", date).with_number("stringency", 60.0),
                ],
            ),
        );

        let out = plan()
            .execute("dataset", |name| tables.get(name))
            .unwrap()
            .unwrap();
        assert_eq!(out.label(), "dataset");
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows()[0].number("stringency"), Some(70.0));
    }

    #[test]
    fn test_execute_with_nothing_present() {
        let out = plan().execute("dataset", |_| None).unwrap();
        assert!(out.is_none());
    }
}
