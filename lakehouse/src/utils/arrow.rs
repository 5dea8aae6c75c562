use arrow::array::{Array, ArrayRef, AsArray, StringArray};
use arrow::compute::{cast, concat_batches};
use arrow::csv::ReaderBuilder;
use arrow::csv::reader::Format;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use common::Result;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::io::Cursor;
use std::sync::Arc;

const CSV_BATCH_SIZE: usize = 8192;

/// Returns any array as UTF-8 text, casting when needed.
pub fn as_utf8(array: &ArrayRef) -> Result<StringArray> {
    let text = match array.data_type() {
        DataType::Utf8 => array.clone(),
        _ => cast(array.as_ref(), &DataType::Utf8)?,
    };
    Ok(text.as_string::<i32>().clone())
}

/// Trims a text value and treats blank strings as missing.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a ArrayRef> {
    batch
        .schema_ref()
        .index_of(name)
        .ok()
        .map(|idx| batch.column(idx))
}

pub fn concat(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<RecordBatch> {
    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(schema.clone()));
    }
    Ok(concat_batches(schema, batches)?)
}

fn without_view_type(data_type: &DataType) -> Option<DataType> {
    match data_type {
        DataType::Utf8View => Some(DataType::Utf8),
        DataType::BinaryView => Some(DataType::Binary),
        _ => None,
    }
}

pub fn without_view_schema(schema: &Schema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|field| match without_view_type(field.data_type()) {
            Some(data_type) => Field::new(field.name(), data_type, field.is_nullable()),
            None => field.as_ref().clone(),
        })
        .collect();
    Arc::new(Schema::new(fields))
}

/// Casts view-typed string columns back to plain `Utf8` so query output can
/// be written with the same layout as the master table.
pub fn without_view_types(batch: &RecordBatch) -> Result<RecordBatch> {
    let schema = without_view_schema(batch.schema_ref());
    let columns = batch
        .columns()
        .iter()
        .zip(schema.fields().iter())
        .map(|(column, field)| {
            if column.data_type() == field.data_type() {
                Ok(column.clone())
            } else {
                cast(column.as_ref(), field.data_type())
            }
        })
        .collect::<std::result::Result<Vec<ArrayRef>, _>>()?;

    Ok(RecordBatch::try_new(schema, columns)?)
}

pub fn write_parquet(
    schema: SchemaRef,
    batches: &[RecordBatch],
    metadata: Vec<(String, String)>,
) -> Result<Vec<u8>> {
    let key_value_metadata = if metadata.is_empty() {
        None
    } else {
        Some(
            metadata
                .into_iter()
                .map(|(key, value)| KeyValue::new(key, value))
                .collect::<Vec<KeyValue>>(),
        )
    };

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_key_value_metadata(key_value_metadata)
        .build();

    let mut buffer: Vec<u8> = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.close()?;

    Ok(buffer)
}

pub fn read_parquet(data: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
    let schema = builder.schema().clone();
    let reader = builder.build()?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}

/// Reads a headed CSV file with every column typed as text; type coercion is
/// left to the normalizer.
pub fn read_csv_as_text(data: &[u8]) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let data = data.strip_prefix("\u{feff}".as_bytes()).unwrap_or(data);

    let (inferred, _) = Format::default()
        .with_header(true)
        .infer_schema(Cursor::new(data), Some(10))?;

    let fields: Vec<Field> = inferred
        .fields()
        .iter()
        .map(|f| Field::new(f.name().trim(), DataType::Utf8, true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let reader = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .with_batch_size(CSV_BATCH_SIZE)
        .build(Cursor::new(data))?;

    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}
