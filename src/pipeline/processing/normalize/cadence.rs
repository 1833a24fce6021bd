//! Cadence conversion for feeds whose native reporting interval differs from
//! the canonical daily series.
//!
//! Derived values are computed only from calendar days actually present in
//! the feed. A window with a missing or null day yields null; nothing is
//! interpolated.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::Observation;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CadenceTransform {
    /// Sum of `indicator` over the trailing `window_days` calendar days
    RollingSum {
        indicator: String,
        target: String,
        window_days: u32,
    },
    /// Change of a cumulative `indicator` against the previous calendar day
    DailyChange { indicator: String, target: String },
}

impl CadenceTransform {
    pub fn target(&self) -> &str {
        match self {
            CadenceTransform::RollingSum { target, .. } => target,
            CadenceTransform::DailyChange { target, .. } => target,
        }
    }

    fn indicator(&self) -> &str {
        match self {
            CadenceTransform::RollingSum { indicator, .. } => indicator,
            CadenceTransform::DailyChange { indicator, .. } => indicator,
        }
    }

    /// Derive the target series from `observations`.
    pub fn derive(&self, observations: &[Observation]) -> Vec<Observation> {
        let mut series: BTreeMap<(&str, Option<&str>), BTreeMap<NaiveDate, Option<f64>>> =
            BTreeMap::new();
        for obs in observations.iter().filter(|o| o.indicator == self.indicator()) {
            series
                .entry((obs.entity.as_str(), obs.category.as_deref()))
                .or_default()
                .entry(obs.date)
                .or_insert(obs.value);
        }

        let mut derived = Vec::new();
        for ((entity, category), points) in &series {
            for date in points.keys() {
                let value = match self {
                    CadenceTransform::RollingSum { window_days, .. } => {
                        window_sum(points, *date, (*window_days).max(1))
                    }
                    CadenceTransform::DailyChange { .. } => {
                        let previous = points.get(&(*date - Duration::days(1))).copied().flatten();
                        let current = points.get(date).copied().flatten();
                        previous.zip(current).map(|(prev, cur)| cur - prev)
                    }
                };
                derived.push(Observation {
                    entity: entity.to_string(),
                    date: *date,
                    indicator: self.target().to_string(),
                    category: category.map(str::to_string),
                    value,
                });
            }
        }
        derived
    }
}

fn window_sum(points: &BTreeMap<NaiveDate, Option<f64>>, end: NaiveDate, days: u32) -> Option<f64> {
    (0..i64::from(days))
        .map(|offset| points.get(&(end - Duration::days(offset))).copied().flatten())
        .sum::<Option<f64>>()
}

/// Append the series derived by every transform to `observations`.
pub fn apply_cadence(mut observations: Vec<Observation>, transforms: &[CadenceTransform]) -> Vec<Observation> {
    for transform in transforms {
        let derived = transform.derive(&observations);
        observations.extend(derived);
    }
    observations
}
