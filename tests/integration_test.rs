use chrono::{NaiveDate, Utc};
use std::collections::BTreeSet;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::tempdir;

use epi_reconcile::constants::{SOURCE_URL, TOTAL_BOOSTERS, TOTAL_CASES, TOTAL_VACCINATIONS, VACCINE};
use epi_reconcile::domain::{ExtractMeta, SourceExtract};
use epi_reconcile::pipeline::storage::{
    FsSnapshotStore, InMemorySnapshotStore, SnapshotKey, SnapshotStore,
};
use epi_reconcile::registry::{SourceRegistry, SourceSpec};
use epi_reconcile::{Config, Orchestrator, ReconcileError};

const CONFIG: &str = r#"
[run]
max_removed_rows = 3
max_concurrency = 2

[[domains]]
name = "cases"
cumulative_metrics = ["total_cases"]
history = "truncate_to_fresh"
sources = { base = "jhu_cases" }

[[domains]]
name = "vaccinations"
cumulative_metrics = ["total_vaccinations", "total_boosters"]
preserved_fields = ["total_boosters", "total_vaccinations:Sinovac"]
sources = { base = "cl_vax", joins = [{ name = "pe_vax" }] }

[dataset]
base = "cases"
joins = [{ name = "vaccinations" }]

[exclusions]
version = 1

[[exclusions.rules]]
entity = "Peru"
source_id = "jhu_cases"
dates = ["2021-03-02"]
reason = "backlog dump reported as one day"
expires_on = "2021-12-31"
"#;

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 3, day).unwrap()
}

fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 6, 1).unwrap()
}

fn registry() -> SourceRegistry {
    let specs: Vec<SourceSpec> = serde_json::from_value(json!([
        {
            "source_id": "jhu_cases",
            "domain": "cases",
            "mapping": {
                "entity": {"column": "country"},
                "date_column": "date",
                "metrics": [{"column": "cases", "indicator": "total_cases"}]
            }
        },
        {
            "source_id": "cl_vax",
            "domain": "vaccinations",
            "mapping": {
                "entity": {"fixed": "Chile"},
                "date_column": "date",
                "metrics": [
                    {"column": "doses", "indicator": "total_vaccinations"},
                    {"column": "boosters", "indicator": "total_boosters"}
                ],
                "category_column": "vaccine",
                "category_breakdown": ["total_vaccinations"]
            },
            "known_values": {"vaccine": ["Pfizer", "Sinovac"]},
            "timeline": {"derive_from": "cl_vax"}
        },
        {
            "source_id": "pe_vax",
            "domain": "vaccinations",
            "mapping": {
                "entity": {"fixed": "Peru"},
                "date_column": "date",
                "metrics": [
                    {"column": "doses", "indicator": "total_vaccinations"},
                    {"column": "boosters", "indicator": "total_boosters"}
                ]
            }
        }
    ]))
    .unwrap();
    SourceRegistry::from_specs(specs)
}

fn extract(source_id: &str, rows: Value) -> SourceExtract {
    let rows = rows
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row.as_object().cloned().unwrap())
        .collect();
    SourceExtract::new(
        ExtractMeta {
            source_id: source_id.to_string(),
            source_name: format!("{source_id} feed"),
            source_url: format!("https://example.org/{source_id}"),
            fetched_at: Utc::now(),
        },
        rows,
    )
}

fn cases() -> SourceExtract {
    extract(
        "jhu_cases",
        json!([
            {"country": "Chile", "date": "2021-03-01", "cases": 10},
            {"country": "Chile", "date": "2021-03-02", "cases": 12},
            {"country": "Chile", "date": "2021-03-03", "cases": 15},
            {"country": "Peru", "date": "2021-03-01", "cases": 5},
            {"country": "Peru", "date": "2021-03-02", "cases": 7}
        ]),
    )
}

fn chile_vax() -> SourceExtract {
    extract(
        "cl_vax",
        json!([
            {"date": "2021-03-02", "vaccine": "Pfizer", "doses": 100, "boosters": null},
            {"date": "2021-03-02", "vaccine": "Sinovac", "doses": 50, "boosters": null},
            {"date": "2021-03-03", "vaccine": "Pfizer", "doses": 150, "boosters": null},
            {"date": "2021-03-03", "vaccine": "Sinovac", "doses": 80, "boosters": null}
        ]),
    )
}

fn peru_vax(boosters: Value) -> SourceExtract {
    extract(
        "pe_vax",
        json!([{"date": "2021-03-01", "doses": 20, "boosters": boosters}]),
    )
}

fn orchestrator(store: Arc<dyn SnapshotStore>) -> Orchestrator {
    let config = Config::from_toml(CONFIG).unwrap();
    Orchestrator::new(config, registry(), store).unwrap()
}

#[tokio::test]
async fn test_full_run_assembles_sorted_dataset() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let output = orchestrator(store.clone())
        .run(vec![cases(), chile_vax(), peru_vax(json!(0))], run_date())
        .await
        .unwrap();

    let dataset = &output.dataset;
    assert!(dataset.is_sorted());
    dataset.ensure_unique_keys().unwrap();
    // Peru 2021-03-02 is excluded, and it has no vaccination row that day
    assert_eq!(dataset.len(), 4);
    assert!(dataset.rows().iter().all(|row| row.text(SOURCE_URL).is_some()));

    let chile_d2 = dataset
        .rows()
        .iter()
        .find(|row| row.entity == "Chile" && row.date == d(2))
        .unwrap();
    assert_eq!(chile_d2.number(TOTAL_CASES), Some(12.0));
    assert_eq!(chile_d2.number(TOTAL_VACCINATIONS), Some(150.0));
    assert_eq!(chile_d2.text(VACCINE), Some("Pfizer, Sinovac"));

    assert_eq!(output.entity_tables.len(), 2);
    assert_eq!(output.domain_tables["cases"].len(), 4);
    assert_eq!(output.report.entities["Peru"]["cases"].excluded_rows, 1);
    assert_eq!(store.len().await, 4);
}

#[tokio::test]
async fn test_second_run_preserves_boosters() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let orchestrator = orchestrator(store.clone());

    orchestrator.run(vec![peru_vax(json!(5))], run_date()).await.unwrap();
    let output = orchestrator.run(vec![peru_vax(json!(""))], run_date()).await.unwrap();

    let peru = &output.entity_tables["Peru"];
    assert_eq!(peru.rows()[0].number(TOTAL_BOOSTERS), Some(5.0));
    assert_eq!(output.report.entities["Peru"]["vaccinations"].preserved_values, 1);
}

#[tokio::test]
async fn test_manufacturer_total_is_preserved_when_omitted() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let orchestrator = orchestrator(store.clone());
    orchestrator.run(vec![chile_vax()], run_date()).await.unwrap();

    let pfizer_only = extract(
        "cl_vax",
        json!([{"date": "2021-03-03", "vaccine": "Pfizer", "doses": 160, "boosters": null}]),
    );
    let output = orchestrator.run(vec![pfizer_only], run_date()).await.unwrap();

    let chile = &output.entity_tables["Chile"];
    let d3 = chile.rows().iter().find(|row| row.date == d(3)).unwrap();
    assert_eq!(d3.number(TOTAL_VACCINATIONS), Some(160.0));
    assert_eq!(d3.number("total_vaccinations:Pfizer"), Some(160.0));
    assert_eq!(d3.number("total_vaccinations:Sinovac"), Some(80.0));
    assert_eq!(output.report.entities["Chile"]["vaccinations"].preserved_values, 1);
}

#[tokio::test]
async fn test_entity_without_fresh_data_keeps_its_history() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let orchestrator = orchestrator(store.clone());
    orchestrator.run(vec![cases()], run_date()).await.unwrap();

    let chile_only = extract(
        "jhu_cases",
        json!([
            {"country": "Chile", "date": "2021-03-01", "cases": 10},
            {"country": "Chile", "date": "2021-03-02", "cases": 12},
            {"country": "Chile", "date": "2021-03-03", "cases": 15},
            {"country": "Chile", "date": "2021-03-04", "cases": 18}
        ]),
    );
    let output = orchestrator.run(vec![chile_only], run_date()).await.unwrap();

    assert_eq!(output.dataset.entities(), BTreeSet::from(["Chile", "Peru"]));
    assert_eq!(output.dataset.len(), 5);
    let peru = &output.entity_tables["Peru"];
    assert_eq!(peru.len(), 1);
    assert_eq!(peru.rows()[0].number(TOTAL_CASES), Some(5.0));
    assert!(!output.report.entities["Peru"]["cases"].fresh);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_failed_run_leaves_snapshots_untouched() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let orchestrator = orchestrator(store.clone());
    orchestrator.run(vec![cases()], run_date()).await.unwrap();

    let key = SnapshotKey::new("cases", "Chile");
    let before = store.load(&key).await.unwrap().unwrap();

    let broken = extract(
        "jhu_cases",
        json!([
            {"country": "Chile", "date": "2021-03-01", "cases": 100},
            {"country": "Chile", "date": "2021-03-02", "cases": 1},
            {"country": "Chile", "date": "2021-03-03", "cases": 2},
            {"country": "Chile", "date": "2021-03-04", "cases": 3},
            {"country": "Chile", "date": "2021-03-05", "cases": 4}
        ]),
    );
    let err = orchestrator.run(vec![broken], run_date()).await.unwrap_err();

    assert_eq!(err.rule(), "monotonicity_budget");
    match &err {
        ReconcileError::Entity { entity, .. } => assert_eq!(entity, "Chile"),
        other => panic!("expected entity error, got {other:?}"),
    }
    assert!(err.to_string().contains("2021-03-05"));
    assert_eq!(store.load(&key).await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_unknown_vaccine_fails_before_anything_is_written() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let surprise = extract(
        "cl_vax",
        json!([{"date": "2021-03-02", "vaccine": "NovelVax", "doses": 1, "boosters": null}]),
    );

    let err = orchestrator(store.clone())
        .run(vec![cases(), surprise], run_date())
        .await
        .unwrap_err();
    assert_eq!(err.rule(), "unknown_value");
    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn test_filesystem_snapshots_round_trip() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FsSnapshotStore::new(dir.path()));

    orchestrator(store.clone())
        .run(vec![cases(), chile_vax()], run_date())
        .await
        .unwrap();

    let chile = store
        .load(&SnapshotKey::new("cases", "Chile"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chile.len(), 3);
    assert_eq!(chile.rows()[2].number(TOTAL_CASES), Some(15.0));

    let vax = store
        .load(&SnapshotKey::new("vaccinations", "Chile"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(vax.rows()[0].text(VACCINE), Some("Pfizer, Sinovac"));
}
