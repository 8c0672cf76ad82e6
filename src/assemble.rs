use std::collections::BTreeSet;

use crate::domain::{FeatureId, Orientation};
use crate::error::ExprcatError;
use crate::transform::TransformedUnit;

/// One wide dataset assembled from transformed units.
///
/// In `Rows` orientation each unit becomes a row keyed by sample id, with
/// one column per feature in the union of all profiles plus one column per
/// annotation key in the union of all annotations. In `Matrix` orientation
/// each feature becomes a row and each unit a column, with no annotation
/// columns.
///
/// Rows follow unit completion order in `Rows` orientation; feature and
/// annotation columns are sorted so the layout does not depend on which
/// unit finished first.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledDataset {
    pub orientation: Orientation,
    pub key_column: String,
    pub keys: Vec<String>,
    pub value_columns: Vec<String>,
    pub values: Vec<Vec<Option<f64>>>,
    pub meta_columns: Vec<String>,
    pub meta: Vec<Vec<Option<String>>>,
}

impl AssembledDataset {
    /// Number of data rows, excluding the header.
    pub fn row_count(&self) -> usize {
        self.keys.len()
    }

    /// Total column count: the key column, value columns and annotation
    /// columns.
    pub fn column_count(&self) -> usize {
        1 + self.value_columns.len() + self.meta_columns.len()
    }
}

pub fn assemble(
    units: &[TransformedUnit],
    orientation: Orientation,
) -> Result<AssembledDataset, ExprcatError> {
    if units.is_empty() {
        return Err(ExprcatError::EmptyInput);
    }
    Ok(match orientation {
        Orientation::Rows => assemble_rows(units),
        Orientation::Matrix => assemble_matrix(units),
    })
}

fn assemble_rows(units: &[TransformedUnit]) -> AssembledDataset {
    let mut features = BTreeSet::new();
    let mut annotation_keys = BTreeSet::new();
    for unit in units {
        features.extend(unit.profile.keys().cloned());
        annotation_keys.extend(unit.annotations.keys().cloned());
    }
    let feature_order: Vec<FeatureId> = features.into_iter().collect();
    let meta_columns: Vec<String> = annotation_keys.into_iter().collect();

    let mut keys = Vec::with_capacity(units.len());
    let mut values = Vec::with_capacity(units.len());
    let mut meta = Vec::with_capacity(units.len());
    for unit in units {
        keys.push(unit.sample.to_string());
        values.push(
            feature_order
                .iter()
                .map(|feature| unit.profile.get(feature).copied())
                .collect(),
        );
        meta.push(
            meta_columns
                .iter()
                .map(|column| unit.annotations.get(column).cloned())
                .collect(),
        );
    }

    AssembledDataset {
        orientation: Orientation::Rows,
        key_column: "sample_id".to_string(),
        keys,
        value_columns: feature_order
            .into_iter()
            .map(|feature| feature.to_string())
            .collect(),
        values,
        meta_columns,
        meta,
    }
}

fn assemble_matrix(units: &[TransformedUnit]) -> AssembledDataset {
    let mut features = BTreeSet::new();
    for unit in units {
        features.extend(unit.profile.keys().cloned());
    }
    let feature_order: Vec<FeatureId> = features.into_iter().collect();

    let value_columns: Vec<String> = units.iter().map(|unit| unit.sample.to_string()).collect();
    let mut keys = Vec::with_capacity(feature_order.len());
    let mut values = Vec::with_capacity(feature_order.len());
    for feature in &feature_order {
        keys.push(feature.to_string());
        values.push(
            units
                .iter()
                .map(|unit| unit.profile.get(feature).copied())
                .collect(),
        );
    }

    let meta = keys.iter().map(|_| Vec::new()).collect();
    AssembledDataset {
        orientation: Orientation::Matrix,
        key_column: "gene_id".to_string(),
        keys,
        value_columns,
        values,
        meta_columns: Vec::new(),
        meta,
    }
}
