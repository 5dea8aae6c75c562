use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use lazy_static::lazy_static;
use std::sync::Arc;

/// Version stamped into every partition file's key/value metadata.
pub const TRIP_SCHEMA_VERSION: &str = "1";

pub const TIMESTAMP_TYPE: DataType = DataType::Timestamp(TimeUnit::Millisecond, None);

/// Column names of the canonical trip record, in output order.
pub const CANONICAL_COLUMNS: [&str; 18] = [
    "ride_id",
    "rideable_type",
    "started_at",
    "ended_at",
    "duration_sec",
    "start_station_id",
    "start_station_name",
    "end_station_id",
    "end_station_name",
    "start_lat",
    "start_lng",
    "end_lat",
    "end_lng",
    "bike_number",
    "member_type",
    "day",
    "hour",
    "weekday",
];

// Canonical trip schema shared by every partition regardless of source era
pub fn canonical_trip_schema() -> Schema {
    Schema::new(vec![
        Field::new("ride_id", DataType::Utf8, true),
        Field::new("rideable_type", DataType::Utf8, true),
        Field::new("started_at", TIMESTAMP_TYPE, true),
        Field::new("ended_at", TIMESTAMP_TYPE, true),
        Field::new("duration_sec", DataType::Int64, true),
        Field::new("start_station_id", DataType::Int64, true),
        Field::new("start_station_name", DataType::Utf8, true),
        Field::new("end_station_id", DataType::Int64, true),
        Field::new("end_station_name", DataType::Utf8, true),
        Field::new("start_lat", DataType::Float64, true),
        Field::new("start_lng", DataType::Float64, true),
        Field::new("end_lat", DataType::Float64, true),
        Field::new("end_lng", DataType::Float64, true),
        Field::new("bike_number", DataType::Utf8, true),
        Field::new("member_type", DataType::Utf8, true),
        Field::new("day", DataType::Int8, true),
        Field::new("hour", DataType::Int8, true),
        Field::new("weekday", DataType::Int8, true),
    ])
}

// Station dimension schema: one row per station_id
pub fn station_dimension_schema() -> Schema {
    Schema::new(vec![
        Field::new("station_id", DataType::Int64, false),
        Field::new("station_name", DataType::Utf8, true),
        Field::new("lat", DataType::Float64, true),
        Field::new("lng", DataType::Float64, true),
        Field::new("earliest_seen", TIMESTAMP_TYPE, true),
        Field::new("latest_seen", TIMESTAMP_TYPE, true),
    ])
}

pub enum TableSchema {
    Trips,
    Stations,
}

pub fn get_schema(table: TableSchema) -> SchemaRef {
    match table {
        TableSchema::Trips => TRIP_SCHEMA.clone(),
        TableSchema::Stations => STATION_SCHEMA.clone(),
    }
}

// Lazy-loaded static schemas
lazy_static! {
    static ref TRIP_SCHEMA: SchemaRef = Arc::new(canonical_trip_schema());
    static ref STATION_SCHEMA: SchemaRef = Arc::new(station_dimension_schema());
}
