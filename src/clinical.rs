use std::collections::HashMap;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::domain::{CaseId, Sex};
use crate::error::ExprcatError;

/// Which clinical row represents a case when its treatment history fans out
/// into several rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcilePolicy {
    EarliestTreatment,
    LatestTreatment,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        ReconcilePolicy::EarliestTreatment
    }
}

/// One flattened clinical row. A case with N treatment events yields N
/// records sharing every non-treatment field; a case without treatments
/// yields exactly one record with the treatment fields empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalRecord {
    pub case_id: CaseId,
    pub patient_id: String,
    pub sex: Sex,
    pub race: Option<String>,
    pub ethnicity: Option<String>,
    pub vital_status: Option<String>,
    pub age_years: Option<f64>,
    pub days_to_death: Option<f64>,
    pub age_at_diagnosis: Option<f64>,
    pub primary_diagnosis: Option<String>,
    pub tumor_stage: Option<String>,
    pub tissue_or_organ_of_origin: Option<String>,
    pub days_to_last_follow_up: Option<f64>,
    pub cigarettes_per_day: Option<f64>,
    pub pack_years_smoked: Option<f64>,
    pub years_smoked: Option<f64>,
    pub treatment_number: Option<u32>,
    pub treatment_type: Option<String>,
    pub therapeutic_agents: Option<String>,
    pub days_to_treatment_start: Option<f64>,
    pub days_to_treatment_end: Option<f64>,
    pub treatment_outcome: Option<String>,
}

impl ClinicalRecord {
    /// Annotation columns contributed to a transformed unit on a reconcile
    /// hit. Missing values surface as "unknown" rather than dropping the
    /// column.
    pub fn annotation_fields(&self) -> Vec<(String, String)> {
        let or_unknown =
            |field: &Option<String>| field.clone().unwrap_or_else(|| "unknown".to_string());
        vec![
            ("sex".to_string(), self.sex.to_string()),
            (
                "age".to_string(),
                self.age_years
                    .map(|age| age.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            ),
            ("tumor-stage".to_string(), or_unknown(&self.tumor_stage)),
            ("vital-status".to_string(), or_unknown(&self.vital_status)),
        ]
    }

    /// The same columns as [`annotation_fields`](Self::annotation_fields),
    /// all "unknown". Attached when a clinical table exists but has no row
    /// for the sample.
    pub fn unknown_annotation_fields() -> Vec<(String, String)> {
        ["sex", "age", "tumor-stage", "vital-status"]
            .into_iter()
            .map(|key| (key.to_string(), "unknown".to_string()))
            .collect()
    }
}

/// Flattened clinical table plus a case/patient lookup index built under a
/// [`ReconcilePolicy`]. Read-only once constructed.
#[derive(Debug, Clone, Default)]
pub struct ClinicalTable {
    records: Vec<ClinicalRecord>,
    index: HashMap<String, usize>,
}

impl ClinicalTable {
    pub fn from_cases(cases: &[Value], policy: ReconcilePolicy) -> Self {
        let records = flatten_cases(cases);
        Self::from_records(records, policy)
    }

    pub fn from_records(records: Vec<ClinicalRecord>, policy: ReconcilePolicy) -> Self {
        let mut index = HashMap::new();
        for (position, record) in records.iter().enumerate() {
            for key in [record.case_id.as_str(), record.patient_id.as_str()] {
                if key.is_empty() {
                    continue;
                }
                match policy {
                    ReconcilePolicy::EarliestTreatment => {
                        index.entry(key.to_string()).or_insert(position);
                    }
                    ReconcilePolicy::LatestTreatment => {
                        index.insert(key.to_string(), position);
                    }
                }
            }
        }
        Self { records, index }
    }

    /// Looks up a case by case id or patient (submitter) id. A miss is not
    /// an error; callers attach unknown fields instead.
    pub fn lookup(&self, key: &str) -> Option<&ClinicalRecord> {
        self.index
            .get(key)
            .and_then(|position| self.records.get(*position))
    }

    pub fn records(&self) -> &[ClinicalRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serializes the full table, one row per (case, treatment), for the
    /// cohort metadata export.
    pub fn to_csv(&self) -> Result<Vec<u8>, ExprcatError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in &self.records {
            writer
                .serialize(record)
                .map_err(|err| ExprcatError::Encode(err.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|err| ExprcatError::Encode(err.to_string()))
    }
}

/// Flattens nested case documents (demographic, first diagnosis, first
/// exposure, every treatment) into clinical rows.
pub fn flatten_cases(cases: &[Value]) -> Vec<ClinicalRecord> {
    let mut records = Vec::new();
    for case in cases {
        let Some(case_id) = text(case, "case_id").and_then(|id| id.parse::<CaseId>().ok()) else {
            warn!("skipping case document without case_id");
            continue;
        };
        let patient_id = text(case, "submitter_id").unwrap_or_default();

        let demographic = case.get("demographic").cloned().unwrap_or(Value::Null);
        let diagnosis = first_element(case, "diagnoses");
        let exposure = first_element(case, "exposures");

        let base = ClinicalRecord {
            case_id,
            patient_id,
            sex: Sex::parse(&text(&demographic, "gender").unwrap_or_default()),
            race: text(&demographic, "race"),
            ethnicity: text(&demographic, "ethnicity"),
            vital_status: text(&demographic, "vital_status"),
            age_years: number(&demographic, "days_to_birth").map(|days| -days / 365.25),
            days_to_death: number(&demographic, "days_to_death"),
            age_at_diagnosis: number(&diagnosis, "age_at_diagnosis"),
            primary_diagnosis: text(&diagnosis, "primary_diagnosis"),
            tumor_stage: text(&diagnosis, "tumor_stage"),
            tissue_or_organ_of_origin: text(&diagnosis, "tissue_or_organ_of_origin"),
            days_to_last_follow_up: number(&diagnosis, "days_to_last_follow_up"),
            cigarettes_per_day: number(&exposure, "cigarettes_per_day"),
            pack_years_smoked: number(&exposure, "pack_years_smoked"),
            years_smoked: number(&exposure, "years_smoked"),
            treatment_number: None,
            treatment_type: None,
            therapeutic_agents: None,
            days_to_treatment_start: None,
            days_to_treatment_end: None,
            treatment_outcome: None,
        };

        let treatments = case
            .get("treatments")
            .and_then(|value| value.as_array())
            .cloned()
            .unwrap_or_default();
        if treatments.is_empty() {
            records.push(base);
            continue;
        }
        for (position, treatment) in treatments.iter().enumerate() {
            let mut record = base.clone();
            record.treatment_number = Some(position as u32 + 1);
            record.treatment_type = text(treatment, "treatment_type");
            record.therapeutic_agents = text_or_list(treatment, "therapeutic_agents");
            record.days_to_treatment_start = number(treatment, "days_to_treatment_start");
            record.days_to_treatment_end = number(treatment, "days_to_treatment_end");
            record.treatment_outcome = text(treatment, "treatment_outcome");
            records.push(record);
        }
    }
    records
}

/// First integer found in a free-text age description, e.g. "age: 45 yrs".
pub fn parse_age_text(value: &str) -> Option<u32> {
    let digits = Regex::new(r"\d+").unwrap();
    digits
        .find(value)
        .and_then(|found| found.as_str().parse().ok())
}

fn first_element(case: &Value, field: &str) -> Value {
    case.get(field)
        .and_then(|value| value.as_array())
        .and_then(|list| list.first())
        .cloned()
        .unwrap_or(Value::Null)
}

fn text(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn text_or_list(value: &Value, field: &str) -> Option<String> {
    match value.get(field) {
        Some(Value::String(item)) => Some(item.clone()),
        Some(Value::Array(items)) => {
            let joined = items
                .iter()
                .filter_map(|item| item.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            if joined.is_empty() { None } else { Some(joined) }
        }
        _ => None,
    }
}

fn number(value: &Value, field: &str) -> Option<f64> {
    match value.get(field) {
        Some(Value::Number(num)) => num.as_f64(),
        Some(Value::String(raw)) => raw.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn case_with_two_treatments() -> Value {
        json!({
            "case_id": "c-1",
            "submitter_id": "TCGA-AB-0001",
            "demographic": {
                "gender": "female",
                "vital_status": "Alive",
                "days_to_birth": -18262.5
            },
            "diagnoses": [{
                "primary_diagnosis": "Adenocarcinoma",
                "tumor_stage": "stage ii"
            }],
            "exposures": [{ "pack_years_smoked": 20.0 }],
            "treatments": [
                { "treatment_type": "Radiation", "days_to_treatment_start": 10.0 },
                { "treatment_type": "Chemotherapy", "days_to_treatment_start": 90.0 }
            ]
        })
    }

    #[test]
    fn flatten_fans_out_one_row_per_treatment() {
        let records = flatten_cases(&[case_with_two_treatments()]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].treatment_number, Some(1));
        assert_eq!(records[0].treatment_type.as_deref(), Some("Radiation"));
        assert_eq!(records[1].treatment_number, Some(2));
        assert_eq!(records[1].treatment_type.as_deref(), Some("Chemotherapy"));
        assert_eq!(records[0].patient_id, records[1].patient_id);
        assert_eq!(records[0].tumor_stage, records[1].tumor_stage);
    }

    #[test]
    fn flatten_without_treatments_yields_single_row() {
        let case = json!({
            "case_id": "c-2",
            "submitter_id": "TCGA-AB-0002",
            "demographic": { "gender": "male" }
        });
        let records = flatten_cases(&[case]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].treatment_number, None);
        assert_eq!(records[0].sex, Sex::Male);
    }

    #[test]
    fn age_years_derived_from_days_to_birth() {
        let records = flatten_cases(&[case_with_two_treatments()]);
        let age = records[0].age_years.unwrap();
        assert!((age - 50.0).abs() < 0.01, "age was {age}");
    }

    #[test]
    fn earliest_treatment_wins_by_default() {
        let table = ClinicalTable::from_cases(
            &[case_with_two_treatments()],
            ReconcilePolicy::default(),
        );
        assert_eq!(table.len(), 2);
        let hit = table.lookup("TCGA-AB-0001").unwrap();
        assert_eq!(hit.treatment_number, Some(1));
        assert_eq!(hit.treatment_type.as_deref(), Some("Radiation"));
    }

    #[test]
    fn latest_treatment_policy_selects_last_row() {
        let table = ClinicalTable::from_cases(
            &[case_with_two_treatments()],
            ReconcilePolicy::LatestTreatment,
        );
        let hit = table.lookup("c-1").unwrap();
        assert_eq!(hit.treatment_number, Some(2));
    }

    #[test]
    fn lookup_miss_is_none() {
        let table = ClinicalTable::from_cases(&[], ReconcilePolicy::default());
        assert!(table.lookup("TCGA-ZZ-9999").is_none());
    }

    #[test]
    fn annotation_fields_use_unknown_for_missing() {
        let records = flatten_cases(&[json!({
            "case_id": "c-3",
            "submitter_id": "TCGA-AB-0003"
        })]);
        let fields = records[0].annotation_fields();
        assert!(fields.contains(&("sex".to_string(), "unknown".to_string())));
        assert!(fields.contains(&("age".to_string(), "unknown".to_string())));
        assert!(
            fields.contains(&("tumor-stage".to_string(), "unknown".to_string()))
        );
    }

    #[test]
    fn parse_age_text_finds_first_integer() {
        assert_eq!(parse_age_text("age: 45 yrs"), Some(45));
        assert_eq!(parse_age_text("Age 61"), Some(61));
        assert_eq!(parse_age_text("adult"), None);
    }

    #[test]
    fn csv_export_round_trips_header_and_rows() {
        let table = ClinicalTable::from_cases(
            &[case_with_two_treatments()],
            ReconcilePolicy::default(),
        );
        let bytes = table.to_csv().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("case_id,patient_id,sex"));
        assert_eq!(lines.count(), 2);
    }
}
