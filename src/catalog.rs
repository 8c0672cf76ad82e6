use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::clinical::{ClinicalTable, ReconcilePolicy};
use crate::domain::{CohortId, SampleId};
use crate::error::ExprcatError;
use crate::gdc::{CaseFilter, MetadataService};
use crate::object_store::ObjectStore;
use crate::transform::TransformError;

/// Payload suffixes recognized as per-sample expression artifacts.
const ARTIFACT_SUFFIXES: &[&str] = &[".csv", ".tsv", ".csv.gz", ".tsv.gz"];

/// A discovered artifact: its store key and the sample id derived from the
/// file stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub key: String,
    pub sample: SampleId,
}

/// A fetched artifact: raw payload plus the side-channel tags attached to
/// the stored object. Consumed exactly once by the transformer.
#[derive(Debug, Clone)]
pub struct SampleArtifact {
    pub reference: ArtifactRef,
    pub bytes: Vec<u8>,
    pub tags: BTreeMap<String, String>,
}

pub fn samples_prefix(cohort: &CohortId) -> String {
    format!("raw/{}/samples/", cohort.as_str())
}

pub fn matrix_key(cohort: &CohortId) -> String {
    format!("raw/{}/matrix.tsv", cohort.as_str())
}

pub fn clinical_export_key(cohort: &CohortId) -> String {
    format!("raw/{}/metadata.csv", cohort.as_str())
}

pub fn dataset_key(cohort: &CohortId, extension: &str) -> String {
    format!("processed/{}/merged_dataset.{extension}", cohort.as_str())
}

/// Lists candidate artifacts under the cohort's samples prefix. An empty
/// listing is reported but is not an error here; the orchestrator decides
/// whether an empty cohort is fatal.
pub fn list_artifacts(
    store: &dyn ObjectStore,
    cohort: &CohortId,
) -> Result<Vec<ArtifactRef>, ExprcatError> {
    let prefix = samples_prefix(cohort);
    let keys = store.list(&prefix)?;
    let mut artifacts = Vec::new();
    for key in keys {
        let Some(stem) = artifact_stem(&key) else {
            continue;
        };
        match stem.parse::<SampleId>() {
            Ok(sample) => artifacts.push(ArtifactRef { key, sample }),
            Err(_) => warn!("skipping artifact with unusable sample id: {}", key),
        }
    }
    if artifacts.is_empty() {
        warn!("empty cohort: no expression artifacts under {}", prefix);
    } else {
        info!("found {} artifacts under {}", artifacts.len(), prefix);
    }
    Ok(artifacts)
}

/// Fetches one artifact's payload and side-channel tags. Transport failures
/// are per-unit errors so one unreadable object never aborts the batch.
pub fn fetch_artifact(
    store: &dyn ObjectStore,
    reference: &ArtifactRef,
) -> Result<SampleArtifact, TransformError> {
    let tags = store
        .head(&reference.key)
        .map_err(|err| TransformError::Fetch(err.to_string()))?;
    let bytes = store
        .get(&reference.key)
        .map_err(|err| TransformError::Fetch(err.to_string()))?;
    Ok(SampleArtifact {
        reference: reference.clone(),
        bytes,
        tags,
    })
}

/// Fetches and flattens the cohort's clinical table. Enrichment is
/// best-effort: any service failure degrades to an empty table.
pub fn fetch_clinical_table(
    service: &dyn MetadataService,
    filter: &CaseFilter,
    policy: ReconcilePolicy,
) -> ClinicalTable {
    let ids = match service.search(filter) {
        Ok(ids) => ids,
        Err(err) => {
            warn!("clinical search failed, continuing without clinical metadata: {err}");
            return ClinicalTable::default();
        }
    };
    if ids.is_empty() {
        info!("no clinical cases matched cohort {}", filter.cohort);
        return ClinicalTable::default();
    }
    let cases = match service.fetch_details(&ids) {
        Ok(cases) => cases,
        Err(err) => {
            warn!("clinical details fetch failed, continuing without clinical metadata: {err}");
            return ClinicalTable::default();
        }
    };
    let table = ClinicalTable::from_cases(&cases, policy);
    info!(
        "clinical table loaded: {} cases, {} rows after treatment fan-out",
        ids.len(),
        table.len()
    );
    table
}

fn artifact_stem(key: &str) -> Option<&str> {
    let file_name = key.rsplit('/').next()?;
    for suffix in ARTIFACT_SUFFIXES {
        if let Some(stem) = file_name.strip_suffix(suffix) {
            return (!stem.is_empty()).then_some(stem);
        }
    }
    None
}
