use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use tracing::info;

use crate::assemble::AssembledDataset;
use crate::domain::OutputFormat;
use crate::error::ExprcatError;
use crate::object_store::ObjectStore;

/// What one dataset write produced.
#[derive(Debug, Clone, Serialize)]
pub struct SinkReceipt {
    pub key: String,
    pub format: OutputFormat,
    pub bytes_written: usize,
    pub rows: usize,
    pub columns: usize,
}

/// Serializes the dataset in memory and stores it under `key` with a single
/// atomic put. A failed put leaves whatever was at `key` before untouched.
pub fn write_dataset(
    store: &dyn ObjectStore,
    key: &str,
    dataset: &AssembledDataset,
    format: OutputFormat,
) -> Result<SinkReceipt, ExprcatError> {
    let bytes = match format {
        OutputFormat::Csv => encode_csv(dataset)?,
        OutputFormat::Parquet => encode_parquet(dataset)?,
    };

    let mut metadata = BTreeMap::new();
    metadata.insert("rows".to_string(), dataset.row_count().to_string());
    metadata.insert("columns".to_string(), dataset.column_count().to_string());
    metadata.insert("orientation".to_string(), dataset.orientation.to_string());
    metadata.insert("format".to_string(), format.to_string());
    metadata.insert("generated-at".to_string(), Utc::now().to_rfc3339());
    store.put(key, &bytes, &metadata)?;

    info!(
        "wrote {} ({} rows, {} columns, {} bytes)",
        key,
        dataset.row_count(),
        dataset.column_count(),
        bytes.len()
    );
    Ok(SinkReceipt {
        key: key.to_string(),
        format,
        bytes_written: bytes.len(),
        rows: dataset.row_count(),
        columns: dataset.column_count(),
    })
}

/// Missing values serialize as empty cells.
fn encode_csv(dataset: &AssembledDataset) -> Result<Vec<u8>, ExprcatError> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = Vec::with_capacity(dataset.column_count());
    header.push(dataset.key_column.as_str());
    header.extend(dataset.value_columns.iter().map(String::as_str));
    header.extend(dataset.meta_columns.iter().map(String::as_str));
    writer
        .write_record(&header)
        .map_err(|err| ExprcatError::Encode(err.to_string()))?;

    for (row, key) in dataset.keys.iter().enumerate() {
        let mut record = Vec::with_capacity(dataset.column_count());
        record.push(key.clone());
        for value in &dataset.values[row] {
            record.push(value.map(|v| v.to_string()).unwrap_or_default());
        }
        for value in &dataset.meta[row] {
            record.push(value.clone().unwrap_or_default());
        }
        writer
            .write_record(&record)
            .map_err(|err| ExprcatError::Encode(err.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|err| ExprcatError::Encode(err.to_string()))
}

/// One record batch: the key column as non-null strings, expression values
/// as nullable floats, annotation columns as nullable strings. Snappy
/// compressed.
fn encode_parquet(dataset: &AssembledDataset) -> Result<Vec<u8>, ExprcatError> {
    let mut fields = Vec::with_capacity(dataset.column_count());
    fields.push(Field::new(&dataset.key_column, DataType::Utf8, false));
    for column in &dataset.value_columns {
        fields.push(Field::new(column, DataType::Float64, true));
    }
    for column in &dataset.meta_columns {
        fields.push(Field::new(column, DataType::Utf8, true));
    }
    let schema = Arc::new(Schema::new(fields));

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(dataset.column_count());
    arrays.push(Arc::new(StringArray::from(
        dataset.keys.iter().map(String::as_str).collect::<Vec<_>>(),
    )));
    for position in 0..dataset.value_columns.len() {
        let column: Vec<Option<f64>> = dataset.values.iter().map(|row| row[position]).collect();
        arrays.push(Arc::new(Float64Array::from(column)));
    }
    for position in 0..dataset.meta_columns.len() {
        let column: Vec<Option<&str>> = dataset
            .meta
            .iter()
            .map(|row| row[position].as_deref())
            .collect();
        arrays.push(Arc::new(StringArray::from(column)));
    }

    let batch = RecordBatch::try_new(schema.clone(), arrays)
        .map_err(|err| ExprcatError::Encode(err.to_string()))?;
    let properties = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(properties))
        .map_err(|err| ExprcatError::Encode(err.to_string()))?;
    writer
        .write(&batch)
        .map_err(|err| ExprcatError::Encode(err.to_string()))?;
    writer
        .close()
        .map_err(|err| ExprcatError::Encode(err.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use arrow::array::Array;
    use camino::Utf8PathBuf;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    use super::*;
    use crate::assemble::assemble;
    use crate::domain::Orientation;
    use crate::object_store::FsObjectStore;
    use crate::transform::TransformedUnit;

    fn sample_dataset() -> AssembledDataset {
        let units = vec![
            TransformedUnit {
                sample: "SampleA".parse().unwrap(),
                profile: [("G1".parse().unwrap(), 1.0), ("G2".parse().unwrap(), 2.0)]
                    .into_iter()
                    .collect(),
                annotations: [("sex".to_string(), "female".to_string())]
                    .into_iter()
                    .collect(),
            },
            TransformedUnit {
                sample: "SampleB".parse().unwrap(),
                profile: [("G2".parse().unwrap(), 4.0), ("G3".parse().unwrap(), 6.0)]
                    .into_iter()
                    .collect(),
                annotations: [("age".to_string(), "50".to_string())]
                    .into_iter()
                    .collect(),
            },
        ];
        assemble(&units, Orientation::Rows).unwrap()
    }

    #[test]
    fn csv_encoding_uses_empty_cells_for_missing_values() {
        let bytes = encode_csv(&sample_dataset()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "sample_id,G1,G2,G3,age,sex");
        assert_eq!(lines[1], "SampleA,1,2,,,female");
        assert_eq!(lines[2], "SampleB,,4,6,50,");
    }

    #[test]
    fn parquet_encoding_round_trips_values_and_nulls() {
        let encoded = encode_parquet(&sample_dataset()).unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&encoded).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>().unwrap();

        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 2);
        let schema = batch.schema();
        let names: Vec<&str> = schema
            .fields()
            .iter()
            .map(|field| field.name().as_str())
            .collect();
        assert_eq!(names, vec!["sample_id", "G1", "G2", "G3", "age", "sex"]);

        let g1 = batch
            .column(1)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(g1.value(0), 1.0);
        assert!(g1.is_null(1));

        let sex = batch
            .column(5)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(sex.value(0), "female");
        assert!(sex.is_null(1));
    }

    #[test]
    fn write_dataset_stores_payload_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = FsObjectStore::new(root);

        let receipt = write_dataset(
            &store,
            "processed/demo/merged_dataset.csv",
            &sample_dataset(),
            OutputFormat::Csv,
        )
        .unwrap();

        assert_eq!(receipt.rows, 2);
        assert_eq!(receipt.columns, 6);

        let metadata = store.head("processed/demo/merged_dataset.csv").unwrap();
        assert_eq!(metadata["rows"], "2");
        assert_eq!(metadata["orientation"], "rows");
        assert_eq!(metadata["format"], "csv");

        let payload = store.get("processed/demo/merged_dataset.csv").unwrap();
        assert!(payload.starts_with(b"sample_id,"));
    }
}
