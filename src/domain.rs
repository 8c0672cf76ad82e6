use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::ExprcatError;

/// Layout of the assembled dataset: samples as rows (features as columns),
/// or the transposed matrix layout with features as rows and one column per
/// sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Rows,
    Matrix,
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Orientation::Rows => write!(f, "rows"),
            Orientation::Matrix => write!(f, "matrix"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = ExprcatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "parquet" => Ok(OutputFormat::Parquet),
            _ => Err(ExprcatError::UnsupportedFormat(value.to_string())),
        }
    }
}

/// Sex classification from free-text clinical tokens. Parsing is total:
/// anything that is not recognizably female or male maps to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
    Unknown,
}

impl Sex {
    /// "female" is matched before "male" because the former contains the
    /// latter as a substring.
    pub fn parse(value: &str) -> Sex {
        let token = value.trim().to_ascii_lowercase();
        if token.is_empty() {
            return Sex::Unknown;
        }
        if token == "f" || token.contains("female") {
            return Sex::Female;
        }
        if token == "m" || token.contains("male") {
            return Sex::Male;
        }
        Sex::Unknown
    }

    pub fn as_str(&self) -> &str {
        match self {
            Sex::Female => "female",
            Sex::Male => "male",
            Sex::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CohortId(String);

impl CohortId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CohortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CohortId {
    type Err = ExprcatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(ExprcatError::InvalidCohort(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleId(String);

impl SampleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SampleId {
    type Err = ExprcatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let is_valid = !normalized.is_empty()
            && !normalized.contains('/')
            && !normalized.chars().any(char::is_whitespace);
        if !is_valid {
            return Err(ExprcatError::InvalidSample(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Patient/case identifier used to join artifacts against the clinical table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseId(String);

impl CaseId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CaseId {
    type Err = ExprcatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        if normalized.is_empty() {
            return Err(ExprcatError::InvalidCase(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Stable feature accession with any version suffix removed. Construction
/// keeps the substring before the first `.`, so `ENSG00000139.8` and
/// `ENSG00000139` name the same feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureId(String);

impl FeatureId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FeatureId {
    type Err = ExprcatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let stripped = trimmed.split('.').next().unwrap_or_default();
        if stripped.is_empty() || stripped.chars().any(char::is_whitespace) {
            return Err(ExprcatError::InvalidFeature(value.to_string()));
        }
        Ok(Self(stripped.to_string()))
    }
}
