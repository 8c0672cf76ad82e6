//! Parallel sample-ingestion and dataset-assembly engine for cohort
//! expression data: discovers per-sample artifacts in an object store,
//! fetches and transforms them concurrently, reconciles them with a
//! flattened clinical table and writes one wide dataset per cohort.

pub mod assemble;
pub mod catalog;
pub mod clinical;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod gdc;
pub mod genefilter;
pub mod object_store;
pub mod output;
pub mod pool;
pub mod sink;
pub mod transform;
