use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::error::{ReconcileError, Result};
use crate::pipeline::pipeline_config::JoinPlan;
use crate::pipeline::processing::exclusions::ExclusionList;
use crate::pipeline::processing::quality_gate::QualityGateConfig;
use crate::pipeline::processing::reconcile::{HistoryPolicy, ReconcileOptions};
use crate::registry::{SourceRegistry, SourceRole};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub run: RunConfig,
    pub domains: Vec<DomainConfig>,
    pub dataset: JoinPlan,
    #[serde(default)]
    pub exclusions: ExclusionList,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Out-of-order rows the corrector may remove per entity before failing
    pub max_removed_rows: usize,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    /// Merge plan over this domain's source ids
    pub sources: JoinPlan,
    #[serde(default)]
    pub cumulative_metrics: Vec<String>,
    #[serde(default)]
    pub preserved_fields: BTreeSet<String>,
    #[serde(default)]
    pub history: HistoryPolicy,
    /// Overrides `run.max_removed_rows` for this domain
    #[serde(default)]
    pub max_removed_rows: Option<usize>,
    /// Cumulative metrics must strictly increase; a repeated value is removed
    #[serde(default)]
    pub strict_monotonic: bool,
    #[serde(default)]
    pub quality: QualityGateConfig,
}

impl DomainConfig {
    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            preserved_fields: self.preserved_fields.clone(),
            history: self.history,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(path).map_err(|e| {
            ReconcileError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&config_content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.name == name)
    }

    pub fn max_removed_for(&self, domain: &DomainConfig) -> usize {
        domain.max_removed_rows.unwrap_or(self.run.max_removed_rows)
    }

    /// Cross-check the configuration against the registered sources.
    pub fn validate(&self, registry: &SourceRegistry) -> Result<()> {
        if self.run.max_concurrency == 0 {
            return Err(ReconcileError::Config("run.max_concurrency must be > 0".to_string()));
        }

        let mut names = BTreeSet::new();
        for domain in &self.domains {
            if !names.insert(domain.name.as_str()) {
                return Err(ReconcileError::Config(format!(
                    "domain '{}' is configured more than once",
                    domain.name
                )));
            }
            domain.sources.validate(&format!("domain '{}'", domain.name))?;

            for source_id in domain.sources.members() {
                let spec = registry.get(source_id).ok_or_else(|| {
                    ReconcileError::Config(format!(
                        "domain '{}' references unknown source '{}'",
                        domain.name, source_id
                    ))
                })?;
                if spec.domain != domain.name {
                    return Err(ReconcileError::Config(format!(
                        "source '{}' belongs to domain '{}', not '{}'",
                        source_id, spec.domain, domain.name
                    )));
                }
                if spec.role == SourceRole::TimelineOnly {
                    return Err(ReconcileError::Config(format!(
                        "timeline-only source '{}' cannot be joined into domain '{}'",
                        source_id, domain.name
                    )));
                }
            }
        }

        self.dataset.validate("dataset")?;
        for member in self.dataset.members() {
            if !names.contains(member) {
                return Err(ReconcileError::Config(format!("dataset references unknown domain '{}'", member)));
            }
        }

        for spec in registry.enabled_sources() {
            let Some(domain) = self.domain(&spec.domain) else {
                return Err(ReconcileError::Config(format!(
                    "source '{}' declares unconfigured domain '{}'",
                    spec.source_id, spec.domain
                )));
            };
            if spec.role == SourceRole::Primary && !domain.sources.members().any(|m| m == spec.source_id) {
                warn!(
                    "Source '{}' is enabled but not part of domain '{}' join plan; it will be ignored",
                    spec.source_id, domain.name
                );
            }
            if let Some(derive_from) = spec.timeline.as_ref().and_then(|t| t.derive_from.as_deref()) {
                if registry.get(derive_from).is_none() {
                    return Err(ReconcileError::Config(format!(
                        "source '{}' derives its timeline from unknown source '{}'",
                        spec.source_id, derive_from
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::normalize::{ColumnMapping, EntityColumn, MetricColumn};
    use crate::registry::SourceSpec;
    use std::collections::BTreeMap;

    const CONFIG: &str = r#"
        [run]
        max_removed_rows = 10

        [[domains]]
        name = "vaccinations"
        cumulative_metrics = ["total_vaccinations"]
        preserved_fields = ["total_boosters"]
        sources = { base = "de_vax", joins = [{ name = "de_boosters", join = "left" }] }

        [[domains]]
        name = "cases"
        history = "truncate_to_fresh"
        max_removed_rows = 20
        sources = { base = "jhu_cases" }

        [dataset]
        base = "cases"
        joins = [{ name = "vaccinations" }]

        [exclusions]
        version = 3
        [[exclusions.rules]]
        entity = "Germany"
        dates = ["2021-03-01"]
        reason = "duplicate batch"
    "#;

    fn spec(source_id: &str, domain: &str) -> SourceSpec {
        SourceSpec {
            source_id: source_id.to_string(),
            enabled: true,
            domain: domain.to_string(),
            role: SourceRole::Primary,
            mapping: ColumnMapping {
                entity: EntityColumn::Fixed("Germany".to_string()),
                date_column: "date".to_string(),
                date_format: "%Y-%m-%d".to_string(),
                metrics: vec![MetricColumn {
                    column: "value".to_string(),
                    indicator: "total_vaccinations".to_string(),
                    scale: None,
                }],
                category_column: None,
                category_aliases: BTreeMap::new(),
                required_columns: BTreeSet::new(),
                category_breakdown: BTreeSet::new(),
            },
            known_values: None,
            cadence: Vec::new(),
            timeline: None,
        }
    }

    fn registry() -> SourceRegistry {
        SourceRegistry::from_specs([
            spec("de_vax", "vaccinations"),
            spec("de_boosters", "vaccinations"),
            spec("jhu_cases", "cases"),
        ])
    }

    #[test]
    fn test_parse_and_validate() {
        let config = Config::from_toml(CONFIG).unwrap();
        config.validate(&registry()).unwrap();

        let cases = config.domain("cases").unwrap();
        assert_eq!(cases.history, HistoryPolicy::TruncateToFresh);
        assert_eq!(config.max_removed_for(cases), 20);
        assert_eq!(config.max_removed_for(config.domain("vaccinations").unwrap()), 10);
        assert_eq!(config.run.max_concurrency, 4);
        assert_eq!(config.exclusions.version, 3);
        assert!(config.domain("vaccinations").unwrap().quality.enforce_dose_ordering);
    }

    #[test]
    fn test_budget_is_required() {
        let without_budget = CONFIG.replace("max_removed_rows = 10", "");
        assert!(Config::from_toml(&without_budget).is_err());
    }

    #[test]
    fn test_zero_budget_is_allowed() {
        let strict = CONFIG
            .replace("max_removed_rows = 10", "max_removed_rows = 0")
            .replace("max_removed_rows = 20", "max_removed_rows = 0\n        strict_monotonic = true");
        let config = Config::from_toml(&strict).unwrap();
        config.validate(&registry()).unwrap();

        let cases = config.domain("cases").unwrap();
        assert_eq!(config.max_removed_for(cases), 0);
        assert!(cases.strict_monotonic);
        assert!(!config.domain("vaccinations").unwrap().strict_monotonic);
    }

    #[test]
    fn test_unknown_source_in_plan_is_rejected() {
        let registry = SourceRegistry::from_specs([spec("de_vax", "vaccinations"), spec("jhu_cases", "cases")]);
        let err = Config::from_toml(CONFIG).unwrap().validate(&registry).unwrap_err();
        assert!(err.to_string().contains("de_boosters"));
    }

    #[test]
    fn test_source_in_wrong_domain_is_rejected() {
        let registry = SourceRegistry::from_specs([
            spec("de_vax", "vaccinations"),
            spec("de_boosters", "cases"),
            spec("jhu_cases", "cases"),
        ]);
        assert!(Config::from_toml(CONFIG).unwrap().validate(&registry).is_err());
    }
}
