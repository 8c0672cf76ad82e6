use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ExprcatError {
    #[error("invalid cohort id: {0}")]
    InvalidCohort(String),

    #[error("invalid sample id: {0}")]
    InvalidSample(String),

    #[error("invalid case id: {0}")]
    InvalidCase(String),

    #[error("invalid feature id: {0}")]
    InvalidFeature(String),

    #[error("missing config file exprcat.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("object store error: {0}")]
    Store(String),

    #[error("GDC request failed: {0}")]
    GdcHttp(String),

    #[error("GDC returned status {status}: {message}")]
    GdcStatus { status: u16, message: String },

    #[error("annotation request failed: {0}")]
    AnnotationHttp(String),

    #[error("annotation source returned status {status}: {message}")]
    AnnotationStatus { status: u16, message: String },

    #[error("no expression artifacts found for cohort {0}")]
    NoArtifactsFound(String),

    #[error("all {attempted} sample transforms failed, nothing to assemble")]
    AllTransformsFailed { attempted: usize },

    #[error("no transformed units to assemble")]
    EmptyInput,

    #[error("shared expression matrix unavailable: {0}")]
    MatrixUnavailable(String),

    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("dataset encode failed: {0}")]
    Encode(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
