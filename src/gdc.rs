use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};

use crate::domain::CohortId;
use crate::error::ExprcatError;

/// Clinical fields requested per case, flattened downstream into the
/// one-row-per-treatment model.
const CASE_FIELDS: &[&str] = &[
    "case_id",
    "submitter_id",
    "demographic.gender",
    "demographic.race",
    "demographic.ethnicity",
    "demographic.vital_status",
    "demographic.days_to_birth",
    "demographic.days_to_death",
    "diagnoses.age_at_diagnosis",
    "diagnoses.primary_diagnosis",
    "diagnoses.tumor_stage",
    "diagnoses.tissue_or_organ_of_origin",
    "diagnoses.days_to_last_follow_up",
    "exposures.cigarettes_per_day",
    "exposures.pack_years_smoked",
    "exposures.years_smoked",
    "treatments.treatment_type",
    "treatments.therapeutic_agents",
    "treatments.days_to_treatment_start",
    "treatments.days_to_treatment_end",
    "treatments.treatment_outcome",
];

const PAGE_SIZE: &str = "10000";

/// Structured case query: cohort plus the artifact-producing pipeline the
/// cases must carry expression files for.
#[derive(Debug, Clone)]
pub struct CaseFilter {
    pub cohort: CohortId,
    pub category: String,
    pub data_type: String,
    pub assay: String,
    pub workflow: String,
}

impl CaseFilter {
    /// Default filter for STAR-quantified bulk RNA-Seq cohorts.
    pub fn rna_seq(cohort: CohortId) -> Self {
        Self {
            cohort,
            category: "Transcriptome Profiling".to_string(),
            data_type: "Gene Expression Quantification".to_string(),
            assay: "RNA-Seq".to_string(),
            workflow: "STAR - Counts".to_string(),
        }
    }
}

pub trait MetadataService: Send + Sync {
    /// Case ids matching the filter.
    fn search(&self, filter: &CaseFilter) -> Result<Vec<String>, ExprcatError>;
    /// Full case records (demographics, diagnoses, exposures, treatments)
    /// for the given ids.
    fn fetch_details(&self, ids: &[String]) -> Result<Vec<Value>, ExprcatError>;
}

#[derive(Clone)]
pub struct GdcHttpClient {
    client: Client,
    base_url: String,
}

impl GdcHttpClient {
    pub fn new() -> Result<Self, ExprcatError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("exprcat/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ExprcatError::GdcHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| ExprcatError::GdcHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: "https://api.gdc.cancer.gov".to_string(),
        })
    }

    fn get_hits(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Vec<Value>, ExprcatError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self.send_with_retries(|| self.client.get(&url).query(params))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "GDC request failed".to_string());
            return Err(ExprcatError::GdcStatus { status, message });
        }
        let body: Value = response
            .json()
            .map_err(|err| ExprcatError::GdcHttp(err.to_string()))?;
        let hits = body
            .get("data")
            .and_then(|data| data.get("hits"))
            .and_then(|hits| hits.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(hits)
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, ExprcatError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(ExprcatError::GdcHttp(err.to_string()));
                }
            }
        }
    }
}

impl MetadataService for GdcHttpClient {
    fn search(&self, filter: &CaseFilter) -> Result<Vec<String>, ExprcatError> {
        let params = [
            ("filters", case_search_filter(filter).to_string()),
            ("fields", "case_id".to_string()),
            ("format", "JSON".to_string()),
            ("size", PAGE_SIZE.to_string()),
        ];
        let hits = self.get_hits("cases", &params)?;
        let ids = hits
            .iter()
            .filter_map(|hit| hit.get("case_id").and_then(|id| id.as_str()))
            .map(str::to_string)
            .collect();
        Ok(ids)
    }

    fn fetch_details(&self, ids: &[String]) -> Result<Vec<Value>, ExprcatError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let params = [
            ("filters", case_details_filter(ids).to_string()),
            ("fields", CASE_FIELDS.join(",")),
            ("format", "JSON".to_string()),
            ("size", PAGE_SIZE.to_string()),
        ];
        self.get_hits("cases", &params)
    }
}

fn case_search_filter(filter: &CaseFilter) -> Value {
    json!({
        "op": "and",
        "content": [
            {
                "op": "=",
                "content": {
                    "field": "cases.project.project_id",
                    "value": [filter.cohort.as_str()]
                }
            },
            {
                "op": "=",
                "content": {
                    "field": "files.data_category",
                    "value": [filter.category]
                }
            },
            {
                "op": "=",
                "content": {
                    "field": "files.data_type",
                    "value": [filter.data_type]
                }
            },
            {
                "op": "=",
                "content": {
                    "field": "files.experimental_strategy",
                    "value": [filter.assay]
                }
            },
            {
                "op": "=",
                "content": {
                    "field": "files.analysis.workflow_type",
                    "value": [filter.workflow]
                }
            }
        ]
    })
}

fn case_details_filter(ids: &[String]) -> Value {
    json!({
        "op": "in",
        "content": {
            "field": "cases.case_id",
            "value": ids
        }
    })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
