//! Column-level coercions from arbitrary raw arrow types to canonical types.

use super::parse::{normalize_station_id, parse_timestamp_millis};
use crate::schema::TIMESTAMP_TYPE;
use crate::utils::arrow::{as_utf8, non_blank};
use arrow::array::{
    ArrayRef, AsArray, Float64Array, Int64Array, StringArray, TimestampMillisecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type, TimestampMillisecondType};
use common::Result;

/// Integer ids and counts. Native integers are cast; everything else goes
/// through text so `31000`, `"31000"` and `"31000.0"` agree.
pub fn integer_column(array: &ArrayRef) -> Result<Int64Array> {
    match array.data_type() {
        dt if dt.is_integer() => Ok(cast(array.as_ref(), &DataType::Int64)?
            .as_primitive::<Int64Type>()
            .clone()),
        DataType::Null => Ok(Int64Array::new_null(array.len())),
        _ => {
            let text = as_utf8(array)?;
            Ok(text
                .iter()
                .map(|v| v.and_then(normalize_station_id))
                .collect())
        }
    }
}

/// Non-strict timestamp coercion: unparsable values become null.
pub fn timestamp_column(array: &ArrayRef) -> Result<TimestampMillisecondArray> {
    match array.data_type() {
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
            Ok(cast(array.as_ref(), &TIMESTAMP_TYPE)?
                .as_primitive::<TimestampMillisecondType>()
                .clone())
        }
        DataType::Null => Ok(TimestampMillisecondArray::new_null(array.len())),
        _ => {
            let text = as_utf8(array)?;
            Ok(text
                .iter()
                .map(|v| v.and_then(parse_timestamp_millis))
                .collect())
        }
    }
}

pub fn float_column(array: &ArrayRef) -> Result<Float64Array> {
    Ok(cast(array.as_ref(), &DataType::Float64)?
        .as_primitive::<Float64Type>()
        .clone())
}

/// Text with surrounding whitespace removed; blank strings become null.
pub fn text_column(array: &ArrayRef) -> Result<StringArray> {
    let text = as_utf8(array)?;
    Ok(text.iter().map(non_blank).collect())
}

pub fn integer_or_null(array: Option<&ArrayRef>, rows: usize) -> Result<Int64Array> {
    array.map_or_else(|| Ok(Int64Array::new_null(rows)), integer_column)
}

pub fn timestamp_or_null(array: Option<&ArrayRef>, rows: usize) -> Result<TimestampMillisecondArray> {
    array.map_or_else(
        || Ok(TimestampMillisecondArray::new_null(rows)),
        timestamp_column,
    )
}

pub fn float_or_null(array: Option<&ArrayRef>, rows: usize) -> Result<Float64Array> {
    array.map_or_else(|| Ok(Float64Array::new_null(rows)), float_column)
}

pub fn text_or_null(array: Option<&ArrayRef>, rows: usize) -> Result<StringArray> {
    array.map_or_else(|| Ok(StringArray::new_null(rows)), text_column)
}
