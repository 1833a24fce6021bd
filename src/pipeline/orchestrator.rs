use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{Config, DomainConfig};
use crate::constants::VACCINE;
use crate::domain::{ExtractMeta, Observation, SourceExtract, WideTable};
use crate::error::{ReconcileError, Result};
use crate::observability::metrics::run as metrics;
use crate::pipeline::processing::monotonic::MonotonicCorrector;
use crate::pipeline::processing::normalize::{apply_cadence, normalize, pivot};
use crate::pipeline::processing::quality_gate::QualityGate;
use crate::pipeline::processing::reconcile::reconcile;
use crate::pipeline::processing::vaccine_timeline::VaccineTimeline;
use crate::pipeline::storage::{SnapshotKey, SnapshotStore};
use crate::registry::SourceRegistry;

/// Observations of one source for one entity.
#[derive(Debug, Clone)]
struct SourceSlice {
    meta: ExtractMeta,
    observations: Vec<Observation>,
}

/// Everything one entity worker owns. Nothing in here is shared with other workers.
struct EntityJob {
    entity: String,
    sources: BTreeMap<String, SourceSlice>,
    previous: BTreeMap<String, WideTable>,
    config: Arc<Config>,
    registry: Arc<SourceRegistry>,
    run_date: NaiveDate,
}

/// Per-domain counts for one entity.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DomainReport {
    /// False when no source delivered data and the snapshot was passed through
    pub fresh: bool,
    pub rows: usize,
    pub carried_over_rows: usize,
    pub truncated_rows: usize,
    pub preserved_values: usize,
    pub timeline_filled: usize,
    pub excluded_rows: usize,
    pub excluded_fields: usize,
    pub monotonic_removed: Vec<NaiveDate>,
    pub quality_filtered: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RunReport {
    pub entities: BTreeMap<String, BTreeMap<String, DomainReport>>,
}

impl RunReport {
    pub fn total_removed(&self) -> usize {
        self.entities
            .values()
            .flat_map(|domains| domains.values())
            .map(|d| d.monotonic_removed.len() + d.quality_filtered + d.excluded_rows)
            .sum()
    }
}

/// Result of one successful run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    /// Per-entity table merged along the dataset plan
    pub entity_tables: BTreeMap<String, WideTable>,
    /// Cross-entity table per domain
    pub domain_tables: BTreeMap<String, WideTable>,
    pub dataset: WideTable,
    pub report: RunReport,
}

struct EntityOutput {
    entity: String,
    domains: BTreeMap<String, WideTable>,
    persist: Vec<String>,
    table: WideTable,
    report: BTreeMap<String, DomainReport>,
}

/// Sequences normalization, per-entity reconciliation and final assembly.
pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<SourceRegistry>,
    store: Arc<dyn SnapshotStore>,
}

impl Orchestrator {
    pub fn new(config: Config, registry: SourceRegistry, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        config.validate(&registry)?;
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            store,
        })
    }

    /// Run the whole pipeline over one batch of extracts.
    ///
    /// Snapshots are replaced only if every entity succeeds; on any error
    /// nothing is persisted.
    pub async fn run(&self, extracts: Vec<SourceExtract>, run_date: NaiveDate) -> Result<RunOutput> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        info!("🚀 Starting run {} for {} ({} extracts)", run_id, run_date, extracts.len());

        match self.execute(run_id, extracts, run_date).await {
            Ok(output) => {
                let elapsed = started.elapsed().as_secs_f64();
                metrics::success(elapsed);
                info!(
                    "🎉 Run {} completed: {} entities, {} dataset rows, {} rows removed ({:.2}s)",
                    run_id,
                    output.entity_tables.len(),
                    output.dataset.len(),
                    output.report.total_removed(),
                    elapsed
                );
                Ok(output)
            }
            Err(e) => {
                metrics::failure(e.rule());
                error!("💥 Run {} failed [{}]: {}", run_id, e.rule(), e);
                Err(e)
            }
        }
    }

    async fn execute(&self, run_id: Uuid, extracts: Vec<SourceExtract>, run_date: NaiveDate) -> Result<RunOutput> {
        let mut by_entity = self.normalize_all(extracts)?;

        // Entities without fresh data still carry their history into the output
        let mut carried = 0;
        for key in self.store.keys().await? {
            if self.config.domain(&key.domain).is_none() || by_entity.contains_key(&key.entity) {
                continue;
            }
            by_entity.insert(key.entity, BTreeMap::new());
            carried += 1;
        }
        if carried > 0 {
            info!("📦 {} entities have no fresh data; passing their snapshots through", carried);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.run.max_concurrency));
        let mut workers = JoinSet::new();

        for (entity, sources) in by_entity {
            let mut previous = BTreeMap::new();
            for domain in &self.config.domains {
                let key = SnapshotKey::new(&domain.name, &entity);
                if let Some(table) = self.store.load(&key).await.map_err(|e| e.for_entity(&entity))? {
                    previous.insert(domain.name.clone(), table);
                }
            }

            let job = EntityJob {
                entity,
                sources,
                previous,
                config: Arc::clone(&self.config),
                registry: Arc::clone(&self.registry),
                run_date,
            };
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| ReconcileError::Task(e.to_string()))?;
            workers.spawn_blocking(move || {
                let _permit = permit;
                process_entity(job)
            });
        }

        // Join barrier: every entity finishes before anything is assembled
        let mut outputs = Vec::new();
        while let Some(joined) = workers.join_next().await {
            let output = joined.map_err(|e| ReconcileError::Task(e.to_string()))??;
            outputs.push(output);
        }
        outputs.sort_by(|a, b| a.entity.cmp(&b.entity));

        self.assemble(run_id, run_date, outputs).await
    }

    /// Normalize every extract and split the observations by entity.
    fn normalize_all(&self, extracts: Vec<SourceExtract>) -> Result<BTreeMap<String, BTreeMap<String, SourceSlice>>> {
        let mut seen = BTreeSet::new();
        let mut by_entity: BTreeMap<String, BTreeMap<String, SourceSlice>> = BTreeMap::new();

        for extract in extracts {
            let source_id = extract.source_id().to_string();
            let Some(spec) = self.registry.get(&source_id) else {
                warn!("Skipping extract from unregistered source '{}'", source_id);
                continue;
            };
            if !spec.enabled {
                info!("Skipping extract from disabled source '{}'", source_id);
                continue;
            }
            if !seen.insert(source_id.clone()) {
                return Err(ReconcileError::Config(format!(
                    "more than one extract delivered for source '{}'",
                    source_id
                )));
            }

            let observations = normalize(&extract, &spec.mapping, spec.known_values.as_ref())?;
            let observations = apply_cadence(observations, &spec.cadence);

            let mut split: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
            for obs in observations {
                split.entry(obs.entity.clone()).or_default().push(obs);
            }
            debug!("Source '{}' covers {} entities", source_id, split.len());

            for (entity, observations) in split {
                by_entity.entry(entity).or_default().insert(
                    source_id.clone(),
                    SourceSlice {
                        meta: extract.meta().clone(),
                        observations,
                    },
                );
            }
        }

        Ok(by_entity)
    }

    /// Single-threaded cross-entity assembly followed by one atomic persist.
    async fn assemble(&self, run_id: Uuid, run_date: NaiveDate, outputs: Vec<EntityOutput>) -> Result<RunOutput> {
        let mut per_domain: BTreeMap<String, Vec<WideTable>> = BTreeMap::new();
        let mut entity_tables = BTreeMap::new();
        let mut report = RunReport::default();
        let mut batch = Vec::new();

        for output in outputs {
            for domain in &output.persist {
                if let Some(table) = output.domains.get(domain) {
                    batch.push((SnapshotKey::new(domain, &output.entity), table.clone()));
                }
            }
            for (domain, table) in output.domains {
                per_domain.entry(domain).or_default().push(table);
            }
            report.entities.insert(output.entity.clone(), output.report);
            entity_tables.insert(output.entity, output.table);
        }

        let mut domain_tables = BTreeMap::new();
        for (domain, tables) in per_domain {
            let table = WideTable::concat(domain.as_str(), tables)?;
            domain_tables.insert(domain, table);
        }

        let dataset = self
            .config
            .dataset
            .execute("dataset", |name| domain_tables.get(name))?
            .unwrap_or_else(|| WideTable::new("dataset"));

        let persisted = batch.len();
        self.store.replace_all(batch).await?;
        info!("💾 Persisted {} snapshots for run {}", persisted, run_id);

        Ok(RunOutput {
            run_id,
            run_date,
            entity_tables,
            domain_tables,
            dataset,
            report,
        })
    }
}

fn process_entity(job: EntityJob) -> Result<EntityOutput> {
    let span = info_span!("entity", entity = %job.entity);
    let _enter = span.enter();
    let entity = job.entity.clone();
    run_entity(job).map_err(|e| e.for_entity(&entity))
}

fn run_entity(mut job: EntityJob) -> Result<EntityOutput> {
    let mut domains = BTreeMap::new();
    let mut persist = Vec::new();
    let mut report = BTreeMap::new();

    for domain in &job.config.domains {
        let previous = job.previous.remove(&domain.name);
        match run_domain(&job, domain)? {
            Some(fresh) => {
                let (table, domain_report) = finish_domain(&job, domain, fresh, previous)?;
                domains.insert(domain.name.clone(), table);
                persist.push(domain.name.clone());
                report.insert(domain.name.clone(), domain_report);
            }
            None => {
                if let Some(table) = previous {
                    debug!("No fresh data for '{}'; passing snapshot through", domain.name);
                    report.insert(
                        domain.name.clone(),
                        DomainReport {
                            rows: table.len(),
                            ..DomainReport::default()
                        },
                    );
                    domains.insert(domain.name.clone(), table);
                }
            }
        }
    }

    let table = job
        .config
        .dataset
        .execute(&job.entity, |name| domains.get(name))?
        .unwrap_or_else(|| WideTable::new(job.entity.as_str()));

    info!("✅ {} domains reconciled ({} rows)", domains.len(), table.len());
    Ok(EntityOutput {
        entity: job.entity,
        domains,
        persist,
        table,
        report,
    })
}

/// Pivot, annotate and merge the domain's sources. `None` when no source has data.
fn run_domain(job: &EntityJob, domain: &DomainConfig) -> Result<Option<(WideTable, usize)>> {
    let mut tables = BTreeMap::new();
    let mut timeline_filled = 0;

    for source_id in domain.sources.members() {
        let (Some(slice), Some(spec)) = (job.sources.get(source_id), job.registry.get(source_id)) else {
            continue;
        };
        let mut table = pivot(&slice.observations, &slice.meta, source_id, &spec.mapping.category_breakdown)?;

        if let Some(timeline) = timeline_for_source(job, source_id) {
            timeline_filled += timeline.annotate(&mut table, VACCINE);
        }
        tables.insert(source_id, table);
    }

    let merged = domain
        .sources
        .execute(&domain.name, |name| tables.get(name))?;
    Ok(merged.map(|table| (table, timeline_filled)))
}

fn timeline_for_source(job: &EntityJob, source_id: &str) -> Option<VaccineTimeline> {
    let spec = job.registry.get(source_id)?.timeline.as_ref()?;

    let mut timeline = spec
        .derive_from
        .as_deref()
        .and_then(|from| job.sources.get(from))
        .map(|slice| VaccineTimeline::build_from_approvals(&slice.observations))
        .unwrap_or_default();
    for (vaccine, date) in &spec.schedule {
        timeline = timeline.with_override(vaccine.clone(), *date);
    }

    (!timeline.is_empty()).then_some(timeline)
}

/// Reconcile against the snapshot, then apply exclusions, monotonic
/// correction and the quality gate, in that order.
fn finish_domain(
    job: &EntityJob,
    domain: &DomainConfig,
    (fresh, timeline_filled): (WideTable, usize),
    previous: Option<WideTable>,
) -> Result<(WideTable, DomainReport)> {
    let previous = previous.unwrap_or_else(|| WideTable::new(domain.name.as_str()));
    let (table, stats) = reconcile(&fresh, &previous, &domain.reconcile_options())?;

    let sources = domain
        .sources
        .members()
        .filter(|id| job.sources.contains_key(*id))
        .map(str::to_string)
        .collect::<BTreeSet<_>>();
    let (table, excluded) = job.config.exclusions.apply(&table, &sources, job.run_date);

    let corrector = MonotonicCorrector::new(domain.cumulative_metrics.clone(), job.config.max_removed_for(domain))
        .strict(domain.strict_monotonic);
    let (table, corrections) = corrector.correct_table(&table)?;

    let gate = QualityGate::with_config(domain.quality.clone());
    let (table, issues) = gate.assess(&table, &domain.cumulative_metrics)?;
    for issue in &issues {
        debug!("Quality issue on {}: {}", issue.date, issue.description);
    }

    let report = DomainReport {
        fresh: true,
        rows: table.len(),
        carried_over_rows: stats.carried_over_rows,
        truncated_rows: stats.dropped_rows,
        preserved_values: stats.preserved_values,
        timeline_filled,
        excluded_rows: excluded.rows_dropped,
        excluded_fields: excluded.fields_nulled,
        monotonic_removed: corrections.removed.into_values().flatten().collect(),
        quality_filtered: issues.len(),
    };
    Ok((table, report))
}
