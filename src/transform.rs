use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;

use flate2::read::GzDecoder;
use thiserror::Error;

use crate::catalog::SampleArtifact;
use crate::clinical::{ClinicalRecord, ClinicalTable, parse_age_text};
use crate::domain::{FeatureId, SampleId, Sex};
use crate::genefilter::FeatureFilterSet;

/// Failure of a single unit of work. These never abort a batch; the engine
/// records them per sample and carries on.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("artifact fetch failed: {0}")]
    Fetch(String),
    #[error("artifact decode failed: {0}")]
    DecodeFailed(String),
    #[error("no recognizable expression value column")]
    NoValueColumn,
    #[error("no features left after filtering")]
    EmptyAfterFilter,
    #[error("sample {0} not present in the shared matrix")]
    SampleNotFound(SampleId),
}

impl TransformError {
    /// Stable failure label used in batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TransformError::Fetch(_) => "Fetch",
            TransformError::DecodeFailed(_) => "DecodeFailed",
            TransformError::NoValueColumn => "NoValueColumn",
            TransformError::EmptyAfterFilter => "EmptyAfterFilter",
            TransformError::SampleNotFound(_) => "SampleNotFound",
        }
    }
}

/// Expression values keyed by version-stripped feature id. Duplicate feature
/// rows in a source keep the first value seen.
pub type ExpressionProfile = BTreeMap<FeatureId, f64>;

/// One sample after transformation: its expression profile plus the
/// annotation columns reconciled from artifact tags and the clinical table.
#[derive(Debug)]
pub struct TransformedUnit {
    pub sample: SampleId,
    pub profile: ExpressionProfile,
    pub annotations: BTreeMap<String, String>,
}

/// Where expression values come from: each artifact carries its own rows, or
/// every sample is a column of one cohort-wide matrix decoded up front.
#[derive(Debug)]
pub enum TransformMode {
    RowSource,
    MatrixSource(SharedMatrix),
}

/// Cohort-wide expression matrix: features as rows, one column per sample.
/// Decoded once and projected per sample.
#[derive(Debug)]
pub struct SharedMatrix {
    columns: HashMap<String, usize>,
    rows: Vec<(FeatureId, Vec<Option<f64>>)>,
}

impl SharedMatrix {
    pub fn decode(bytes: &[u8]) -> Result<Self, TransformError> {
        let text = decode_text(bytes)?;
        let delimiter = sniff_delimiter(&text)?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .comment(Some(b'#'))
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(|err| TransformError::DecodeFailed(err.to_string()))?
            .iter()
            .map(|header| header.trim().to_string())
            .collect();
        if headers.len() < 2 {
            return Err(TransformError::DecodeFailed(
                "matrix has no sample columns".to_string(),
            ));
        }

        let mut columns = HashMap::new();
        for (position, name) in headers.iter().enumerate().skip(1) {
            columns.entry(name.clone()).or_insert(position - 1);
        }

        let width = headers.len() - 1;
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|err| TransformError::DecodeFailed(err.to_string()))?;
            let Some(feature) = record.get(0).and_then(|cell| cell.parse::<FeatureId>().ok())
            else {
                continue;
            };
            if !seen.insert(feature.clone()) {
                continue;
            }
            let values = (1..=width)
                .map(|index| {
                    record
                        .get(index)
                        .and_then(|cell| cell.trim().parse::<f64>().ok())
                })
                .collect();
            rows.push((feature, values));
        }
        if rows.is_empty() {
            return Err(TransformError::DecodeFailed("no data rows".to_string()));
        }
        Ok(Self { columns, rows })
    }

    /// Projects one sample column out of the matrix as an expression profile.
    pub fn project(
        &self,
        sample: &SampleId,
        filter: &FeatureFilterSet,
    ) -> Result<ExpressionProfile, TransformError> {
        let Some(&column) = self.columns.get(sample.as_str()) else {
            return Err(TransformError::SampleNotFound(sample.clone()));
        };
        let mut profile = ExpressionProfile::new();
        let mut present = 0usize;
        for (feature, values) in &self.rows {
            let Some(value) = values.get(column).copied().flatten() else {
                continue;
            };
            present += 1;
            if !filter.is_empty() && !filter.contains(feature) {
                continue;
            }
            profile.insert(feature.clone(), value);
        }
        if profile.is_empty() {
            if present == 0 {
                return Err(TransformError::DecodeFailed(format!(
                    "matrix column for {sample} has no values"
                )));
            }
            return Err(TransformError::EmptyAfterFilter);
        }
        Ok(profile)
    }
}

/// Turns one fetched artifact into a [`TransformedUnit`]. Pure with respect
/// to its inputs, so workers can run it concurrently without coordination.
pub fn transform(
    artifact: &SampleArtifact,
    mode: &TransformMode,
    filter: &FeatureFilterSet,
    clinical: &ClinicalTable,
) -> Result<TransformedUnit, TransformError> {
    let profile = match mode {
        TransformMode::RowSource => decode_profile(&artifact.bytes, filter)?,
        TransformMode::MatrixSource(matrix) => {
            matrix.project(&artifact.reference.sample, filter)?
        }
    };
    Ok(TransformedUnit {
        sample: artifact.reference.sample.clone(),
        profile,
        annotations: build_annotations(artifact, clinical),
    })
}

/// Decodes a per-sample delimited artifact into an expression profile.
///
/// The feature column is the one named `gene_id`, or the first column when
/// no header matches. The value column is picked by preference: a column
/// named `unstranded`, then `tpm_unstranded`, then `expression_value`, then
/// the first header mentioning `count` or `tpm`. Rows whose feature or value
/// cell does not parse are dropped individually.
pub fn decode_profile(
    bytes: &[u8],
    filter: &FeatureFilterSet,
) -> Result<ExpressionProfile, TransformError> {
    let text = decode_text(bytes)?;
    let delimiter = sniff_delimiter(&text)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .comment(Some(b'#'))
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| TransformError::DecodeFailed(err.to_string()))?
        .iter()
        .map(|header| header.trim().to_ascii_lowercase())
        .collect();
    let feature_column = headers
        .iter()
        .position(|header| header == "gene_id")
        .unwrap_or(0);
    let value_column = pick_value_column(&headers).ok_or(TransformError::NoValueColumn)?;

    let mut profile = ExpressionProfile::new();
    let mut parsed = 0usize;
    for result in reader.records() {
        let record = result.map_err(|err| TransformError::DecodeFailed(err.to_string()))?;
        let Some(feature) = record
            .get(feature_column)
            .and_then(|cell| cell.parse::<FeatureId>().ok())
        else {
            continue;
        };
        let Some(value) = record
            .get(value_column)
            .and_then(|cell| cell.trim().parse::<f64>().ok())
        else {
            continue;
        };
        parsed += 1;
        if !filter.is_empty() && !filter.contains(&feature) {
            continue;
        }
        profile.entry(feature).or_insert(value);
    }
    if profile.is_empty() {
        if parsed == 0 {
            return Err(TransformError::DecodeFailed(
                "no usable data rows".to_string(),
            ));
        }
        return Err(TransformError::EmptyAfterFilter);
    }
    Ok(profile)
}

fn pick_value_column(headers: &[String]) -> Option<usize> {
    for wanted in ["unstranded", "tpm_unstranded", "expression_value"] {
        if let Some(position) = headers.iter().position(|header| header == wanted) {
            return Some(position);
        }
    }
    headers
        .iter()
        .position(|header| header.contains("count") || header.contains("tpm"))
}

/// Gunzips when the payload starts with the gzip magic, then requires UTF-8.
fn decode_text(bytes: &[u8]) -> Result<String, TransformError> {
    if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        let mut text = String::new();
        GzDecoder::new(bytes)
            .read_to_string(&mut text)
            .map_err(|err| TransformError::DecodeFailed(format!("gzip: {err}")))?;
        return Ok(text);
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|_| TransformError::DecodeFailed("payload is not valid utf-8".to_string()))
}

/// Tab wins over comma, decided on the first line that is neither blank nor
/// a `#` comment.
fn sniff_delimiter(text: &str) -> Result<u8, TransformError> {
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        return Ok(if line.contains('\t') { b'\t' } else { b',' });
    }
    Err(TransformError::DecodeFailed("empty artifact".to_string()))
}

/// Annotation columns for one unit. Artifact tags come first (identity keys
/// dropped, sex and age normalized); on top of that the clinical table
/// contributes its columns without overriding a tag already present. A
/// reconcile miss against a non-empty table attaches "unknown" fields.
fn build_annotations(
    artifact: &SampleArtifact,
    clinical: &ClinicalTable,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    for (key, value) in &artifact.tags {
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "sample-id" | "patient-id" | "case-id" => {}
            "sex" | "gender" => {
                annotations.insert("sex".to_string(), Sex::parse(value).to_string());
            }
            "age" => {
                let normalized = if value.parse::<f64>().is_ok() {
                    value.to_string()
                } else if let Some(age) = parse_age_text(value) {
                    age.to_string()
                } else {
                    value.to_string()
                };
                annotations.insert("age".to_string(), normalized);
            }
            _ => {
                annotations.insert(key, value.to_string());
            }
        }
    }

    if clinical.is_empty() {
        return annotations;
    }
    let fields = match clinical.lookup(reconcile_key(artifact)) {
        Some(record) => record.annotation_fields(),
        None => ClinicalRecord::unknown_annotation_fields(),
    };
    for (key, value) in fields {
        annotations.entry(key).or_insert(value);
    }
    annotations
}

/// Join key for the clinical lookup: the patient-id tag, then case-id, then
/// sample-id, then the sample id from the artifact key itself.
fn reconcile_key(artifact: &SampleArtifact) -> &str {
    for wanted in ["patient-id", "case-id", "sample-id"] {
        let tagged = artifact
            .tags
            .iter()
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value.trim());
        if let Some(value) = tagged
            && !value.is_empty()
        {
            return value;
        }
    }
    artifact.reference.sample.as_str()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;
    use crate::catalog::ArtifactRef;
    use crate::clinical::ReconcilePolicy;

    const STAR_COUNTS: &str = concat!(
        "# gene-model: GENCODE v36\n",
        "gene_id\tgene_name\tgene_type\tunstranded\ttpm_unstranded\n",
        "N_unmapped\t\t\t100\t0.0\n",
        "ENSG00000000003.15\tTSPAN6\tprotein_coding\t4096\t21.5\n",
    );

    const CANONICAL_CSV: &str = concat!(
        "gene_id,gene_name,expression_value\n",
        "G1,Alpha,1.5\n",
        "G2,Beta,2.5\n",
        "G3,Gamma,3.5\n",
    );

    const MATRIX_TSV: &str = concat!(
        "gene_id\tS1\tS2\n",
        "G1.4\t1.0\t10.0\n",
        "G2\t2.0\t\n",
        "G1\t9.0\t9.0\n",
    );

    fn artifact_with(bytes: &[u8], tags: &[(&str, &str)]) -> SampleArtifact {
        SampleArtifact {
            reference: ArtifactRef {
                key: "raw/demo/samples/S1.csv".to_string(),
                sample: "S1".parse().unwrap(),
            },
            bytes: bytes.to_vec(),
            tags: tags
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }

    fn feature(id: &str) -> FeatureId {
        id.parse().unwrap()
    }

    #[test]
    fn decode_prefers_unstranded_counts() {
        let profile = decode_profile(STAR_COUNTS.as_bytes(), &FeatureFilterSet::new()).unwrap();
        assert_eq!(profile.len(), 2);
        assert_eq!(profile[&feature("ENSG00000000003")], 4096.0);
        assert_eq!(profile[&feature("N_unmapped")], 100.0);
    }

    #[test]
    fn decode_reads_canonical_csv() {
        let profile = decode_profile(CANONICAL_CSV.as_bytes(), &FeatureFilterSet::new()).unwrap();
        assert_eq!(profile.len(), 3);
        assert_eq!(profile[&feature("G2")], 2.5);
    }

    #[test]
    fn decode_handles_gzip_payload() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(CANONICAL_CSV.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let profile = decode_profile(&compressed, &FeatureFilterSet::new()).unwrap();
        assert_eq!(profile.len(), 3);
    }

    #[test]
    fn filter_restricts_profile_to_allowed_features() {
        let filter: FeatureFilterSet =
            [feature("G1"), feature("G2")].into_iter().collect();
        let profile = decode_profile(CANONICAL_CSV.as_bytes(), &filter).unwrap();
        let kept: Vec<&str> = profile.keys().map(FeatureId::as_str).collect();
        assert_eq!(kept, vec!["G1", "G2"]);
    }

    #[test]
    fn filtering_an_already_filtered_profile_changes_nothing() {
        let filter: FeatureFilterSet =
            [feature("G1"), feature("G2")].into_iter().collect();
        let once = decode_profile(CANONICAL_CSV.as_bytes(), &filter).unwrap();

        let mut reencoded = String::from("gene_id,expression_value\n");
        for (id, value) in &once {
            reencoded.push_str(&format!("{id},{value}\n"));
        }
        let twice = decode_profile(reencoded.as_bytes(), &filter).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn filter_that_excludes_everything_is_reported() {
        let filter: FeatureFilterSet = [feature("ENSG99999999999")].into_iter().collect();
        let err = decode_profile(CANONICAL_CSV.as_bytes(), &filter).unwrap_err();
        assert_matches!(err, TransformError::EmptyAfterFilter);
    }

    #[test]
    fn duplicate_features_keep_first_value() {
        let text = "gene_id,expression_value\nG1.1,1.0\nG1.2,2.0\n";
        let profile = decode_profile(text.as_bytes(), &FeatureFilterSet::new()).unwrap();
        assert_eq!(profile.len(), 1);
        assert_eq!(profile[&feature("G1")], 1.0);
    }

    #[test]
    fn missing_value_column_is_an_error() {
        let text = "gene_id,gene_name,strand\nG1,Alpha,+\n";
        let err = decode_profile(text.as_bytes(), &FeatureFilterSet::new()).unwrap_err();
        assert_matches!(err, TransformError::NoValueColumn);
    }

    #[test]
    fn undecodable_bytes_are_an_error() {
        let err = decode_profile(&[0xff, 0xfe, 0x00], &FeatureFilterSet::new()).unwrap_err();
        assert_matches!(err, TransformError::DecodeFailed(_));
    }

    #[test]
    fn header_only_artifact_is_an_error() {
        let text = "gene_id,expression_value\n";
        let err = decode_profile(text.as_bytes(), &FeatureFilterSet::new()).unwrap_err();
        assert_matches!(err, TransformError::DecodeFailed(_));
    }

    #[test]
    fn matrix_projects_one_sample_column() {
        let matrix = SharedMatrix::decode(MATRIX_TSV.as_bytes()).unwrap();
        let sample: SampleId = "S1".parse().unwrap();
        let profile = matrix.project(&sample, &FeatureFilterSet::new()).unwrap();
        // G1 appears twice (versioned and bare); the first row wins.
        assert_eq!(profile.len(), 2);
        assert_eq!(profile[&feature("G1")], 1.0);
        assert_eq!(profile[&feature("G2")], 2.0);
    }

    #[test]
    fn matrix_skips_blank_cells() {
        let matrix = SharedMatrix::decode(MATRIX_TSV.as_bytes()).unwrap();
        let sample: SampleId = "S2".parse().unwrap();
        let profile = matrix.project(&sample, &FeatureFilterSet::new()).unwrap();
        assert_eq!(profile.len(), 1);
        assert_eq!(profile[&feature("G1")], 10.0);
    }

    #[test]
    fn matrix_without_sample_column_is_reported() {
        let matrix = SharedMatrix::decode(MATRIX_TSV.as_bytes()).unwrap();
        let sample: SampleId = "S3".parse().unwrap();
        let err = matrix.project(&sample, &FeatureFilterSet::new()).unwrap_err();
        assert_matches!(err, TransformError::SampleNotFound(missing) if missing == sample);
    }

    #[test]
    fn transform_attaches_normalized_tags_and_clinical_fields() {
        let case = serde_json::json!({
            "case_id": "c-1",
            "submitter_id": "TCGA-01",
            "demographic": {
                "gender": "male",
                "vital_status": "Alive",
                "days_to_birth": -20000.0
            },
            "diagnoses": [{ "tumor_stage": "stage ii" }]
        });
        let clinical = ClinicalTable::from_cases(&[case], ReconcilePolicy::default());
        let artifact = artifact_with(
            CANONICAL_CSV.as_bytes(),
            &[
                ("patient-id", "TCGA-01"),
                ("gender", "FEMALE"),
                ("age", "Age: 61 yrs"),
            ],
        );

        let unit = transform(
            &artifact,
            &TransformMode::RowSource,
            &FeatureFilterSet::new(),
            &clinical,
        )
        .unwrap();

        assert_eq!(unit.sample.as_str(), "S1");
        // The artifact's own tag wins over the clinical value.
        assert_eq!(unit.annotations["sex"], "female");
        assert_eq!(unit.annotations["age"], "61");
        assert_eq!(unit.annotations["tumor-stage"], "stage ii");
        assert_eq!(unit.annotations["vital-status"], "Alive");
        assert!(!unit.annotations.contains_key("patient-id"));
    }

    #[test]
    fn reconcile_miss_attaches_unknown_fields() {
        let case = serde_json::json!({
            "case_id": "c-1",
            "submitter_id": "TCGA-01",
            "demographic": { "gender": "male" }
        });
        let clinical = ClinicalTable::from_cases(&[case], ReconcilePolicy::default());
        let artifact = artifact_with(CANONICAL_CSV.as_bytes(), &[("patient-id", "TCGA-99")]);

        let unit = transform(
            &artifact,
            &TransformMode::RowSource,
            &FeatureFilterSet::new(),
            &clinical,
        )
        .unwrap();

        assert_eq!(unit.annotations["sex"], "unknown");
        assert_eq!(unit.annotations["vital-status"], "unknown");
    }

    #[test]
    fn empty_clinical_table_contributes_nothing() {
        let artifact = artifact_with(CANONICAL_CSV.as_bytes(), &[("tissue", "lung")]);
        let unit = transform(
            &artifact,
            &TransformMode::RowSource,
            &FeatureFilterSet::new(),
            &ClinicalTable::default(),
        )
        .unwrap();

        assert_eq!(unit.annotations.len(), 1);
        assert_eq!(unit.annotations["tissue"], "lung");
    }
}
