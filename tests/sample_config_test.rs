use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

use epi_reconcile::constants::{TOTAL_DEATHS, VACCINE};
use epi_reconcile::pipeline::ingestion::load_extracts;
use epi_reconcile::pipeline::storage::FsSnapshotStore;
use epi_reconcile::registry::SourceRegistry;
use epi_reconcile::{Config, Orchestrator};

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 1, d).unwrap()
}

#[test]
fn test_shipped_config_is_valid() {
    let config = Config::load(Path::new("config.toml")).unwrap();
    let registry = SourceRegistry::load_from_directory("registry/sources").unwrap();
    config.validate(&registry).unwrap();

    assert_eq!(config.domains.len(), 3);
    assert!(!registry.is_enabled("legacy_dashboard"));
}

#[tokio::test]
async fn test_fixture_run_end_to_end() {
    let config = Config::load(Path::new("config.toml")).unwrap();
    let registry = SourceRegistry::load_from_directory("registry/sources").unwrap();
    let extracts = load_extracts(Path::new("fixtures/extracts")).unwrap();

    let snapshots = tempdir().unwrap();
    let store = Arc::new(FsSnapshotStore::new(snapshots.path()));
    let orchestrator = Orchestrator::new(config, registry, store).unwrap();

    let output = orchestrator.run(extracts, date(10)).await.unwrap();
    let dataset = &output.dataset;
    assert_eq!(dataset.len(), 7);
    assert!(dataset.is_sorted());

    let row = |entity: &str, day: u32| {
        dataset
            .rows()
            .iter()
            .find(|r| r.entity == entity && r.date == date(day))
            .unwrap()
    };

    // Excluded field is nulled, the rest of the row survives
    assert_eq!(row("Canada", 4).number(TOTAL_DEATHS), None);
    assert!(row("Canada", 4).number("total_cases").is_some());
    assert_eq!(row("Canada", 2).text(VACCINE), Some("Moderna, Pfizer/BioNTech"));
    assert_eq!(row("Canada", 9).number("total_vaccinations"), Some(320000.0));
    assert_eq!(row("Canada", 9).number("total_vaccinations:Moderna"), Some(60000.0));

    // Chile's last report went backwards and is removed
    assert_eq!(
        output.report.entities["Chile"]["cases"].monotonic_removed,
        vec![date(5)]
    );

    // Rerunning the same batch against the stored snapshots is stable
    let extracts = load_extracts(Path::new("fixtures/extracts")).unwrap();
    let again = orchestrator.run(extracts, date(10)).await.unwrap();
    assert_eq!(again.dataset.rows(), output.dataset.rows());
}
