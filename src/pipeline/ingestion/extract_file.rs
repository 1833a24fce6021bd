use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::domain::{ExtractMeta, RawRow, SourceExtract};
use crate::error::{ReconcileError, Result};

/// On-disk form of one fetched extract, as written by a source adapter.
#[derive(Debug, Deserialize)]
struct ExtractFile {
    source_id: String,
    source_name: String,
    source_url: String,
    fetched_at: DateTime<Utc>,
    #[serde(default)]
    columns: Option<Vec<String>>,
    rows: Vec<RawRow>,
}

impl From<ExtractFile> for SourceExtract {
    fn from(file: ExtractFile) -> Self {
        let meta = ExtractMeta {
            source_id: file.source_id,
            source_name: file.source_name,
            source_url: file.source_url,
            fetched_at: file.fetched_at,
        };
        match file.columns {
            Some(columns) => SourceExtract::with_columns(meta, columns, file.rows),
            None => SourceExtract::new(meta, file.rows),
        }
    }
}

pub fn load_extract(path: &Path) -> Result<SourceExtract> {
    let content = fs::read_to_string(path)?;
    let file: ExtractFile = serde_json::from_str(&content).map_err(|e| {
        ReconcileError::Config(format!("Failed to parse extract {}: {}", path.display(), e))
    })?;
    Ok(file.into())
}

/// Load every `*.json` extract in `dir`, ordered by file name.
pub fn load_extracts(dir: &Path) -> Result<Vec<SourceExtract>> {
    let mut paths = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect::<Vec<_>>();
    paths.sort();

    let mut extracts = Vec::with_capacity(paths.len());
    for path in paths {
        let extract = load_extract(&path)?;
        debug!(
            "Loaded extract '{}' with {} rows from {}",
            extract.source_id(),
            extract.rows().len(),
            path.display()
        );
        extracts.push(extract);
    }

    info!("Loaded {} extracts from {}", extracts.len(), dir.display());
    Ok(extracts)
}
