use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use epi_reconcile::constants::{DATE, ENTITY};
use epi_reconcile::domain::WideTable;
use epi_reconcile::logging;
use epi_reconcile::observability;
use epi_reconcile::pipeline::ingestion::load_extracts;
use epi_reconcile::pipeline::storage::{FsSnapshotStore, SnapshotKey, SnapshotStore};
use epi_reconcile::registry::SourceRegistry;
use epi_reconcile::{Config, Orchestrator};

#[derive(Parser)]
#[command(name = "epi_reconcile")]
#[command(about = "Reconcile pandemic indicator feeds into a canonical per-entity dataset")]
#[command(version)]
struct Cli {
    /// Directory for rolling JSON log files
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile a batch of extracts and replace the snapshots
    Run {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long, default_value = "registry/sources")]
        registry: PathBuf,
        /// Directory of JSON extracts written by the source adapters
        #[arg(long)]
        extracts: PathBuf,
        #[arg(long, default_value = "snapshots")]
        snapshots: PathBuf,
        #[arg(long, default_value = "output")]
        output: PathBuf,
        /// Date the run is for (defaults to today, UTC); drives exclusion expiry
        #[arg(long)]
        run_date: Option<NaiveDate>,
        /// Write a Prometheus text snapshot of the run's metrics here
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },
    /// Load and cross-check the configuration and the source registry
    Validate {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long, default_value = "registry/sources")]
        registry: PathBuf,
    },
    /// Summarize the persisted snapshot of one entity
    Snapshot {
        #[arg(long, default_value = "snapshots")]
        snapshots: PathBuf,
        #[arg(long)]
        domain: String,
        #[arg(long)]
        entity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let _guard = logging::init_logging(&cli.log_dir).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Run {
            config,
            registry,
            extracts,
            snapshots,
            output,
            run_date,
            metrics_out,
        } => {
            let metrics_handle = observability::init_metrics();

            let config = Config::load(&config)?;
            let registry = SourceRegistry::load_from_directory(&registry)?;
            let extracts = load_extracts(&extracts)
                .with_context(|| format!("Failed to load extracts from {}", extracts.display()))?;
            let store: Arc<dyn SnapshotStore> = Arc::new(FsSnapshotStore::new(&snapshots));

            let orchestrator = Orchestrator::new(config, registry, store)?;
            let run_date = run_date.unwrap_or_else(|| Utc::now().date_naive());
            let result = orchestrator.run(extracts, run_date).await?;

            write_table(&output.join("dataset.json"), &result.dataset)?;
            for (entity, table) in &result.entity_tables {
                write_table(&output.join("entities").join(format!("{}.json", file_stem(entity))), table)?;
            }
            write_atomic(
                &output.join("report.json"),
                &serde_json::to_vec_pretty(&result.report)?,
            )?;
            info!("📁 Wrote {} entity tables to {}", result.entity_tables.len(), output.display());

            if let (Some(path), Some(handle)) = (metrics_out, metrics_handle) {
                write_atomic(&path, handle.render().as_bytes())?;
                info!("📊 Metrics snapshot written to {}", path.display());
            }
        }
        Commands::Validate { config, registry } => {
            let config = Config::load(&config)?;
            let registry = SourceRegistry::load_from_directory(&registry)?;
            config.validate(&registry)?;
            println!(
                "✅ Configuration valid: {} domains, {} sources, {} exclusion rules (v{})",
                config.domains.len(),
                registry.len(),
                config.exclusions.rules.len(),
                config.exclusions.version
            );
        }
        Commands::Snapshot {
            snapshots,
            domain,
            entity,
        } => {
            let store = FsSnapshotStore::new(&snapshots);
            let key = SnapshotKey::new(domain, entity);
            match store.load(&key).await? {
                Some(table) => {
                    println!("📸 Snapshot {}", key);
                    println!("   rows: {}", table.len());
                    if let Some((first, last)) = table.date_range(&key.entity) {
                        println!("   dates: {} .. {}", first, last);
                    }
                    let columns = table.columns().iter().cloned().collect::<Vec<_>>();
                    println!("   columns: {}", columns.join(", "));
                }
                None => println!("No snapshot for {}", key),
            }
        }
    }

    Ok(())
}

/// Flatten a table into JSON objects with the entity and date as leading fields.
fn table_rows(table: &WideTable) -> Vec<Value> {
    table
        .rows()
        .iter()
        .map(|row| {
            let mut object = Map::new();
            object.insert(ENTITY.to_string(), Value::String(row.entity.clone()));
            object.insert(DATE.to_string(), Value::String(row.date.to_string()));
            for (field, value) in &row.fields {
                object.insert(field.clone(), serde_json::to_value(value).unwrap_or(Value::Null));
            }
            Value::Object(object)
        })
        .collect()
}

fn write_table(path: &Path, table: &WideTable) -> Result<()> {
    write_atomic(path, &serde_json::to_vec_pretty(&table_rows(table))?)
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

fn file_stem(entity: &str) -> String {
    entity
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
