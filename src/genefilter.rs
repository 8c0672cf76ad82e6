use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{info, warn};

use crate::domain::FeatureId;
use crate::error::ExprcatError;

pub const GENCODE_ANNOTATION_URL: &str =
    "https://ftp.ebi.ac.uk/pub/databases/gencode/Gencode_human/release_22/gencode.v22.annotation.gtf.gz";

const CACHE_FILE_NAME: &str = "protein_coding_genes.txt";

/// Allowed feature ids, version-stripped. Empty means "no filtering".
/// Loaded once per run and shared read-only across workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFilterSet(BTreeSet<FeatureId>);

impl FeatureFilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, feature: &FeatureId) -> bool {
        self.0.contains(feature)
    }

    pub fn insert(&mut self, feature: FeatureId) -> bool {
        self.0.insert(feature)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureId> {
        self.0.iter()
    }
}

impl FromIterator<FeatureId> for FeatureFilterSet {
    fn from_iter<T: IntoIterator<Item = FeatureId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Source of the reference annotation text. Implementations return an
/// already-decompressed line stream.
pub trait AnnotationClient: Send + Sync {
    fn fetch(&self) -> Result<Box<dyn Read + Send>, ExprcatError>;
}

pub struct GencodeHttpClient {
    client: Client,
    url: String,
}

impl GencodeHttpClient {
    pub fn new(url: String) -> Result<Self, ExprcatError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("exprcat/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ExprcatError::AnnotationHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| ExprcatError::AnnotationHttp(err.to_string()))?;
        Ok(Self { client, url })
    }
}

impl AnnotationClient for GencodeHttpClient {
    fn fetch(&self) -> Result<Box<dyn Read + Send>, ExprcatError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .map_err(|err| ExprcatError::AnnotationHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "annotation request failed".to_string());
            return Err(ExprcatError::AnnotationStatus { status, message });
        }
        if self.url.ends_with(".gz") {
            Ok(Box::new(GzDecoder::new(response)))
        } else {
            Ok(Box::new(response))
        }
    }
}

/// Resolves the protein-coding filter set. Cache wins when present and
/// non-empty; otherwise the reference annotation is fetched, parsed and
/// persisted. Any failure degrades to an empty set: filtering is an
/// optimization, never a correctness requirement.
pub fn load_filter_set(client: &dyn AnnotationClient, cache_path: &Utf8Path) -> FeatureFilterSet {
    match read_cache(cache_path) {
        Ok(set) if !set.is_empty() => {
            info!("loaded {} protein-coding genes from cache", set.len());
            return set;
        }
        Ok(_) => {}
        Err(err) => warn!("unreadable filter cache, refetching: {err}"),
    }

    let set = match client.fetch().and_then(parse_annotation) {
        Ok(set) => set,
        Err(err) => {
            warn!("could not load reference annotation, proceeding unfiltered: {err}");
            return FeatureFilterSet::default();
        }
    };
    if set.is_empty() {
        warn!("reference annotation yielded no protein-coding genes, proceeding unfiltered");
        return set;
    }
    if let Err(err) = persist_cache(cache_path, &set) {
        warn!("could not persist filter cache: {err}");
    }
    info!("loaded {} protein-coding genes from reference annotation", set.len());
    set
}

/// Default cache location under the user cache directory.
pub fn default_cache_path() -> Result<Utf8PathBuf, ExprcatError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("exprcat")).ok()
        })
        .map(|dir| dir.join(CACHE_FILE_NAME))
        .ok_or_else(|| ExprcatError::Filesystem("unable to resolve cache directory".to_string()))
}

pub fn clear_cache(cache_path: &Utf8Path) -> Result<(), ExprcatError> {
    if cache_path.as_std_path().exists() {
        fs::remove_file(cache_path.as_std_path())
            .map_err(|err| ExprcatError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// Parses GTF-style lines: tab-separated records whose third field is
/// `gene` and whose attribute block carries `gene_type "protein_coding"`.
/// The gene id is the first quoted value of the `gene_id` attribute, taken
/// up to the version dot.
fn parse_annotation(reader: Box<dyn Read + Send>) -> Result<FeatureFilterSet, ExprcatError> {
    let reader = BufReader::new(reader);
    let mut set = BTreeSet::new();
    for line in reader.lines() {
        let line = line.map_err(|err| ExprcatError::AnnotationHttp(err.to_string()))?;
        if line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 9 || fields[2] != "gene" {
            continue;
        }
        let attributes = fields[8];
        if !attributes.contains("gene_type \"protein_coding\"") {
            continue;
        }
        for attribute in attributes.split(';') {
            if attribute.contains("gene_id") {
                if let Some(raw) = attribute.split('"').nth(1) {
                    if let Ok(feature) = raw.parse::<FeatureId>() {
                        set.insert(feature);
                    }
                }
                break;
            }
        }
    }
    Ok(FeatureFilterSet(set))
}

fn read_cache(path: &Utf8Path) -> Result<FeatureFilterSet, ExprcatError> {
    if !path.as_std_path().is_file() {
        return Ok(FeatureFilterSet::default());
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| ExprcatError::Filesystem(err.to_string()))?;
    let set = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| line.trim().parse::<FeatureId>().ok())
        .collect();
    Ok(set)
}

fn persist_cache(path: &Utf8Path, set: &FeatureFilterSet) -> Result<(), ExprcatError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ExprcatError::Filesystem(err.to_string()))?;
    }
    let mut content = String::new();
    for feature in set.iter() {
        content.push_str(feature.as_str());
        content.push('\n');
    }
    let tmp_path = path.with_extension("txt.tmp");
    fs::write(tmp_path.as_std_path(), content.as_bytes())
        .map_err(|err| ExprcatError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| ExprcatError::Filesystem(err.to_string()))?;
    Ok(())
}
