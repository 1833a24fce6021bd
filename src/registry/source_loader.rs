use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{ReconcileError, Result};
use crate::pipeline::processing::normalize::{CadenceTransform, ColumnMapping, KnownValues};
use crate::pipeline::processing::vaccine_timeline::TimelineSpec;

/// How a source's observations are used.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    /// Contributes rows to its domain table
    #[default]
    Primary,
    /// Only feeds vaccine timelines; never joined into a table
    TimelineOnly,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceSpec {
    pub source_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub domain: String,
    #[serde(default)]
    pub role: SourceRole,
    pub mapping: ColumnMapping,
    #[serde(default)]
    pub known_values: Option<KnownValues>,
    #[serde(default)]
    pub cadence: Vec<CadenceTransform>,
    #[serde(default)]
    pub timeline: Option<TimelineSpec>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, SourceSpec>,
}

impl SourceRegistry {
    pub fn from_specs(specs: impl IntoIterator<Item = SourceSpec>) -> Self {
        Self {
            sources: specs
                .into_iter()
                .map(|spec| (spec.source_id.clone(), spec))
                .collect(),
        }
    }

    /// Load all source specs from the registry directory
    pub fn load_from_directory<P: AsRef<Path>>(registry_dir: P) -> Result<Self> {
        let dir_path = registry_dir.as_ref();
        if !dir_path.exists() {
            return Err(ReconcileError::Config(format!(
                "Registry directory does not exist: {}",
                dir_path.display()
            )));
        }

        let mut sources = BTreeMap::new();
        for entry in fs::read_dir(dir_path)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let spec: SourceSpec = serde_json::from_str(&content).map_err(|e| {
                ReconcileError::Config(format!("Failed to parse source spec {}: {}", path.display(), e))
            })?;
            debug!("Registered source '{}' for domain '{}'", spec.source_id, spec.domain);
            if let Some(previous) = sources.insert(spec.source_id.clone(), spec) {
                return Err(ReconcileError::Config(format!(
                    "Source '{}' is defined more than once",
                    previous.source_id
                )));
            }
        }

        info!("Loaded {} source specs from {}", sources.len(), dir_path.display());
        Ok(Self { sources })
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceSpec> {
        self.sources.get(source_id)
    }

    pub fn is_enabled(&self, source_id: &str) -> bool {
        self.sources.get(source_id).map_or(false, |s| s.enabled)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceSpec> {
        self.sources.values().filter(|s| s.enabled)
    }

    /// Enabled sources of `domain`, in source id order.
    pub fn sources_for_domain<'a>(&'a self, domain: &'a str) -> impl Iterator<Item = &'a SourceSpec> + 'a {
        self.enabled_sources().filter(move |s| s.domain == domain)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
