use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::clinical::ReconcilePolicy;
use crate::domain::{Orientation, OutputFormat};
use crate::error::ExprcatError;
use crate::genefilter;

pub const DEFAULT_CONCURRENCY: usize = 4;

/// On-disk shape of `exprcat.json`. Everything is optional; resolution fills
/// in defaults.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub store_root: Option<String>,
    #[serde(default)]
    pub orientation: Option<Orientation>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub protein_coding_only: Option<bool>,
    #[serde(default)]
    pub reconcile: Option<ReconcilePolicy>,
    #[serde(default)]
    pub matrix_key: Option<String>,
    #[serde(default)]
    pub annotation_url: Option<String>,
    #[serde(default)]
    pub cache_path: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
}

/// Fully defaulted settings the engine runs with.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub store_root: Utf8PathBuf,
    pub orientation: Orientation,
    pub format: OutputFormat,
    pub concurrency: usize,
    pub protein_coding_only: bool,
    pub reconcile: ReconcilePolicy,
    pub matrix_key: Option<String>,
    pub annotation_url: String,
    pub cache_path: Utf8PathBuf,
    pub destination: Option<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ExprcatError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("exprcat.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(ExprcatError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ExprcatError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ExprcatError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ExprcatError> {
        let cache_path = match config.cache_path {
            Some(path) => Utf8PathBuf::from(path),
            None => genefilter::default_cache_path()?,
        };

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            store_root: Utf8PathBuf::from(
                config.store_root.unwrap_or_else(|| "data".to_string()),
            ),
            orientation: config.orientation.unwrap_or(Orientation::Rows),
            format: config.format.unwrap_or(OutputFormat::Csv),
            concurrency: config.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            protein_coding_only: config.protein_coding_only.unwrap_or(true),
            reconcile: config.reconcile.unwrap_or_default(),
            matrix_key: config.matrix_key,
            annotation_url: config
                .annotation_url
                .unwrap_or_else(|| genefilter::GENCODE_ANNOTATION_URL.to_string()),
            cache_path,
            destination: config.destination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_fills_defaults() {
        let config = Config {
            cache_path: Some("cache/genes.txt".to_string()),
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.store_root, Utf8PathBuf::from("data"));
        assert_eq!(resolved.orientation, Orientation::Rows);
        assert_eq!(resolved.format, OutputFormat::Csv);
        assert_eq!(resolved.concurrency, DEFAULT_CONCURRENCY);
        assert!(resolved.protein_coding_only);
        assert_eq!(resolved.reconcile, ReconcilePolicy::EarliestTreatment);
        assert!(resolved.matrix_key.is_none());
        assert!(resolved.destination.is_none());
    }

    #[test]
    fn resolve_parses_full_document() {
        let raw = r#"{
            "schema_version": 2,
            "store_root": "/var/lib/exprcat",
            "orientation": "matrix",
            "format": "parquet",
            "concurrency": 8,
            "protein_coding_only": false,
            "reconcile": "latest-treatment",
            "matrix_key": "raw/shared/expression.tsv",
            "cache_path": "cache/genes.txt",
            "destination": "processed/shared/out.parquet"
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 2);
        assert_eq!(resolved.orientation, Orientation::Matrix);
        assert_eq!(resolved.format, OutputFormat::Parquet);
        assert_eq!(resolved.concurrency, 8);
        assert!(!resolved.protein_coding_only);
        assert_eq!(resolved.reconcile, ReconcilePolicy::LatestTreatment);
        assert_eq!(
            resolved.matrix_key.as_deref(),
            Some("raw/shared/expression.tsv")
        );
        assert_eq!(
            resolved.destination.as_deref(),
            Some("processed/shared/out.parquet")
        );
    }

    #[test]
    fn unknown_orientation_is_a_parse_error() {
        let raw = r#"{ "orientation": "diagonal" }"#;
        assert!(serde_json::from_str::<Config>(raw).is_err());
    }
}
