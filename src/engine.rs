use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::assemble;
use crate::catalog::{self, ArtifactRef};
use crate::clinical::ClinicalTable;
use crate::config::ResolvedConfig;
use crate::domain::{CohortId, Orientation, OutputFormat, SampleId};
use crate::error::ExprcatError;
use crate::gdc::{CaseFilter, MetadataService};
use crate::genefilter::{self, AnnotationClient, FeatureFilterSet};
use crate::object_store::ObjectStore;
use crate::pool;
use crate::sink::{self, SinkReceipt};
use crate::transform::{self, SharedMatrix, TransformError, TransformMode, TransformedUnit};

/// Pause between fetches when running without worker parallelism, to stay
/// under remote rate limits. Concurrent runs rely on the pool bound instead.
const SEQUENTIAL_FETCH_PAUSE: Duration = Duration::from_millis(100);

/// Per-run overrides on top of the resolved configuration.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub orientation: Option<Orientation>,
    pub format: Option<OutputFormat>,
    pub concurrency: Option<usize>,
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedUnit {
    pub key: String,
    pub kind: String,
    pub message: String,
}

/// Attempted/succeeded/failed accounting for one batch, including the
/// per-failure reasons.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub cohort: String,
    pub orientation: Orientation,
    pub started_at: String,
    pub attempted: usize,
    pub succeeded: Vec<SampleId>,
    pub failed: Vec<FailedUnit>,
    pub elapsed_ms: u128,
}

impl BatchReport {
    pub fn log_summary(&self) {
        info!(
            "cohort {}: {} attempted, {} succeeded, {} failed in {} ms",
            self.cohort,
            self.attempted,
            self.succeeded.len(),
            self.failed.len(),
            self.elapsed_ms
        );
    }
}

#[derive(Debug, Serialize)]
pub struct BuildOutput {
    pub report: BatchReport,
    pub receipt: SinkReceipt,
}

#[derive(Debug, Serialize)]
pub struct ClinicalExport {
    pub key: String,
    pub cases: usize,
    pub rows: usize,
}

#[derive(Debug, Serialize)]
pub struct FilterCacheStatus {
    pub cache_path: String,
    pub features: usize,
    pub refreshed: bool,
}

/// Runs dataset builds against a store, a metadata service and an annotation
/// source. All collaborator state is scoped to one engine value; nothing is
/// shared globally.
pub struct Engine<S, M, A>
where
    S: ObjectStore,
    M: MetadataService,
    A: AnnotationClient,
{
    store: S,
    metadata: M,
    annotation: A,
    config: ResolvedConfig,
}

impl<S, M, A> Engine<S, M, A>
where
    S: ObjectStore,
    M: MetadataService,
    A: AnnotationClient,
{
    pub fn new(store: S, metadata: M, annotation: A, config: ResolvedConfig) -> Self {
        Self {
            store,
            metadata,
            annotation,
            config,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Discovers, fetches and transforms every artifact of the cohort, then
    /// assembles the survivors into one dataset and writes it with a single
    /// atomic put.
    ///
    /// Per-artifact failures are recorded in the report and never cancel
    /// sibling work. The run aborts only when the cohort lists no artifacts,
    /// when every transform fails, or when assembly or the final write fail.
    pub fn build_dataset(
        &self,
        cohort: &CohortId,
        options: &BuildOptions,
    ) -> Result<BuildOutput, ExprcatError> {
        let started = Instant::now();
        let started_at = Utc::now().to_rfc3339();
        let orientation = options.orientation.unwrap_or(self.config.orientation);
        let format = options.format.unwrap_or(self.config.format);
        let concurrency = options.concurrency.unwrap_or(self.config.concurrency);

        let references = catalog::list_artifacts(&self.store, cohort)?;
        if references.is_empty() {
            return Err(ExprcatError::NoArtifactsFound(cohort.to_string()));
        }
        let attempted = references.len();

        // Side inputs are loaded once before fan-out and only read afterwards.
        let clinical = catalog::fetch_clinical_table(
            &self.metadata,
            &CaseFilter::rna_seq(cohort.clone()),
            self.config.reconcile,
        );
        let filter = if self.config.protein_coding_only {
            genefilter::load_filter_set(&self.annotation, &self.config.cache_path)
        } else {
            FeatureFilterSet::new()
        };
        let mode = self.transform_mode(cohort, orientation)?;

        let outcomes = self.run_transforms(references, concurrency, &mode, &filter, &clinical);

        let mut units = Vec::new();
        let mut failed = Vec::new();
        for (reference, outcome) in outcomes {
            match outcome {
                Ok(unit) => units.push(unit),
                Err(err) => {
                    warn!("skipping {} ({}): {}", reference.key, err.kind(), err);
                    failed.push(FailedUnit {
                        key: reference.key,
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
        if units.is_empty() {
            warn!("cohort {cohort}: all {attempted} transforms failed");
            return Err(ExprcatError::AllTransformsFailed { attempted });
        }

        let dataset = assemble::assemble(&units, orientation)?;
        let destination = options
            .destination
            .clone()
            .or_else(|| self.config.destination.clone())
            .unwrap_or_else(|| catalog::dataset_key(cohort, format.extension()));
        let receipt = sink::write_dataset(&self.store, &destination, &dataset, format)?;

        let report = BatchReport {
            cohort: cohort.to_string(),
            orientation,
            started_at,
            attempted,
            succeeded: units.iter().map(|unit| unit.sample.clone()).collect(),
            failed,
            elapsed_ms: started.elapsed().as_millis(),
        };
        report.log_summary();
        Ok(BuildOutput { report, receipt })
    }

    /// Fetches the cohort's clinical cases, flattens them one row per
    /// treatment and stores the table as the cohort metadata export. Unlike
    /// the best-effort enrichment during a build, service failures here are
    /// errors.
    pub fn export_clinical(&self, cohort: &CohortId) -> Result<ClinicalExport, ExprcatError> {
        let filter = CaseFilter::rna_seq(cohort.clone());
        let ids = self.metadata.search(&filter)?;
        if ids.is_empty() {
            warn!("no clinical cases found for cohort {cohort}");
        }
        let cases = self.metadata.fetch_details(&ids)?;
        let table = ClinicalTable::from_cases(&cases, self.config.reconcile);

        let key = catalog::clinical_export_key(cohort);
        let bytes = table.to_csv()?;
        let mut metadata = BTreeMap::new();
        metadata.insert("cases".to_string(), ids.len().to_string());
        metadata.insert("rows".to_string(), table.len().to_string());
        metadata.insert("generated-at".to_string(), Utc::now().to_rfc3339());
        self.store.put(&key, &bytes, &metadata)?;

        info!("wrote {} ({} cases, {} rows)", key, ids.len(), table.len());
        Ok(ClinicalExport {
            key,
            cases: ids.len(),
            rows: table.len(),
        })
    }

    /// Loads the protein-coding filter set, refetching the reference
    /// annotation first when `refresh` is set.
    pub fn warm_gene_cache(&self, refresh: bool) -> Result<FilterCacheStatus, ExprcatError> {
        if refresh {
            genefilter::clear_cache(&self.config.cache_path)?;
        }
        let set = genefilter::load_filter_set(&self.annotation, &self.config.cache_path);
        Ok(FilterCacheStatus {
            cache_path: self.config.cache_path.to_string(),
            features: set.len(),
            refreshed: refresh,
        })
    }

    fn transform_mode(
        &self,
        cohort: &CohortId,
        orientation: Orientation,
    ) -> Result<TransformMode, ExprcatError> {
        match orientation {
            Orientation::Rows => Ok(TransformMode::RowSource),
            Orientation::Matrix => {
                let key = self
                    .config
                    .matrix_key
                    .clone()
                    .unwrap_or_else(|| catalog::matrix_key(cohort));
                let bytes = self
                    .store
                    .get(&key)
                    .map_err(|err| ExprcatError::MatrixUnavailable(format!("{key}: {err}")))?;
                let matrix = SharedMatrix::decode(&bytes)
                    .map_err(|err| ExprcatError::MatrixUnavailable(format!("{key}: {err}")))?;
                info!("loaded shared matrix from {key}");
                Ok(TransformMode::MatrixSource(matrix))
            }
        }
    }

    fn run_transforms(
        &self,
        references: Vec<ArtifactRef>,
        concurrency: usize,
        mode: &TransformMode,
        filter: &FeatureFilterSet,
        clinical: &ClinicalTable,
    ) -> Vec<(ArtifactRef, Result<TransformedUnit, TransformError>)> {
        let job = |reference: ArtifactRef| {
            let outcome = catalog::fetch_artifact(&self.store, &reference)
                .and_then(|artifact| transform::transform(&artifact, mode, filter, clinical));
            (reference, outcome)
        };

        if concurrency <= 1 {
            info!("processing {} artifacts sequentially", references.len());
            let total = references.len();
            let mut outcomes = Vec::with_capacity(total);
            for (position, reference) in references.into_iter().enumerate() {
                outcomes.push(job(reference));
                if position + 1 < total {
                    thread::sleep(SEQUENTIAL_FETCH_PAUSE);
                }
            }
            outcomes
        } else {
            info!(
                "processing {} artifacts with {} workers",
                references.len(),
                concurrency
            );
            pool::run_bounded(references, concurrency, job)
        }
    }
}
