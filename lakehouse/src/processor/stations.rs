//! Station reference lookups and the station dimension rebuilt from trip
//! observations.

use crate::processor::ingest::scan::PartitionScanner;
use crate::processor::normalize::columns::{
    float_or_null, integer_or_null, text_or_null, timestamp_or_null,
};
use crate::schema::{TableSchema, get_schema};
use crate::storage::ObjectStorage;
use crate::utils::arrow::{column, read_parquet, write_parquet};
use arrow::array::{
    Array, ArrayRef, Float64Array, Int64Array, StringArray, TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::Utc;
use common::{Error, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationInfo {
    pub name: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

/// Id-keyed station attributes used to backfill trips that lack them.
#[derive(Debug, Clone, Default)]
pub struct StationReference {
    by_id: HashMap<i64, StationInfo>,
}

// Column names accepted for (id, name, lat, lng), canonical layout first.
const REFERENCE_LAYOUTS: [[&str; 4]; 2] = [
    ["station_id", "station_name", "lat", "lng"],
    [
        "start_station_id",
        "start_station_name",
        "start_lat",
        "start_lng",
    ],
];

impl StationReference {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, station_id: i64) -> Option<&StationInfo> {
        self.by_id.get(&station_id)
    }

    pub fn insert(&mut self, station_id: i64, info: StationInfo) {
        self.by_id.insert(station_id, info);
    }

    /// Builds a reference from the dimension layout or the legacy
    /// `start_station_*` bootstrap layout. The first row per id wins.
    pub fn from_batches(batches: &[RecordBatch]) -> Result<Self> {
        let mut reference = Self::empty();

        for batch in batches {
            let Some([id, name, lat, lng]) = REFERENCE_LAYOUTS
                .iter()
                .find(|layout| column(batch, layout[0]).is_some())
            else {
                return Err(Error::SchemaMismatch(
                    "station reference has neither station_id nor start_station_id".to_string(),
                ));
            };

            let rows = batch.num_rows();
            let ids = integer_or_null(column(batch, id), rows)?;
            let names = text_or_null(column(batch, name), rows)?;
            let lats = float_or_null(column(batch, lat), rows)?;
            let lngs = float_or_null(column(batch, lng), rows)?;

            for i in 0..rows {
                if ids.is_null(i) {
                    continue;
                }
                reference
                    .by_id
                    .entry(ids.value(i))
                    .or_insert_with(|| StationInfo {
                        name: names.is_valid(i).then(|| names.value(i).to_string()),
                        lat: lats.is_valid(i).then(|| lats.value(i)),
                        lng: lngs.is_valid(i).then(|| lngs.value(i)),
                    });
            }
        }

        Ok(reference)
    }

    /// Loads the reference stored at `key`; a missing object is a cold start.
    pub async fn load(storage: &dyn ObjectStorage, key: &str) -> Result<Self> {
        let data = match storage.get_object(key).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                info!(%key, "No station reference found, starting cold");
                return Ok(Self::empty());
            }
            Err(e) => return Err(e),
        };
        let (schema, batches) = read_parquet(Bytes::from(data))?;
        // Checked before coercion, which would accept text ids.
        if schema.field_with_name("station_id").is_ok() {
            validate_station_schema(&schema)?;
        }
        let reference = Self::from_batches(&batches)?;
        info!(%key, stations = reference.len(), "Loaded station reference");
        Ok(reference)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationRecord {
    pub station_id: i64,
    pub station_name: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub earliest_seen: Option<i64>,
    pub latest_seen: Option<i64>,
}

#[derive(Debug, Default, Clone)]
struct ObservationStats {
    lat_sum: f64,
    lat_count: u64,
    lng_sum: f64,
    lng_count: u64,
    earliest: Option<i64>,
    latest: Option<i64>,
}

impl ObservationStats {
    fn observe(&mut self, lat: Option<f64>, lng: Option<f64>, seen_at: Option<i64>) {
        if let Some(lat) = lat {
            self.lat_sum += lat;
            self.lat_count += 1;
        }
        if let Some(lng) = lng {
            self.lng_sum += lng;
            self.lng_count += 1;
        }
        if let Some(ts) = seen_at {
            self.earliest = Some(self.earliest.map_or(ts, |e| e.min(ts)));
            self.latest = Some(self.latest.map_or(ts, |l| l.max(ts)));
        }
    }

    fn merge(&mut self, other: &ObservationStats) {
        self.lat_sum += other.lat_sum;
        self.lat_count += other.lat_count;
        self.lng_sum += other.lng_sum;
        self.lng_count += other.lng_count;
        self.earliest = match (self.earliest, other.earliest) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.latest = self.latest.max(other.latest);
    }

    fn mean_lat(&self) -> Option<f64> {
        (self.lat_count > 0).then(|| self.lat_sum / self.lat_count as f64)
    }

    fn mean_lng(&self) -> Option<f64> {
        (self.lng_count > 0).then(|| self.lng_sum / self.lng_count as f64)
    }
}

/// Accumulates start and end observations grouped by `(station_id, station_name)`
/// and collapses them to one record per station id.
#[derive(Debug, Default)]
pub struct StationDimensionBuilder {
    groups: HashMap<(i64, Option<String>), ObservationStats>,
    observations: u64,
}

impl StationDimensionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }

    /// Adds both station roles of every trip in `trips`.
    pub fn observe_batch(&mut self, trips: &RecordBatch) -> Result<()> {
        let rows = trips.num_rows();
        let seen_at = timestamp_or_null(column(trips, "started_at"), rows)?;

        for role in ["start", "end"] {
            let ids = integer_or_null(column(trips, &format!("{role}_station_id")), rows)?;
            let names = text_or_null(column(trips, &format!("{role}_station_name")), rows)?;
            let lats = float_or_null(column(trips, &format!("{role}_lat")), rows)?;
            let lngs = float_or_null(column(trips, &format!("{role}_lng")), rows)?;
            self.observe_role(&ids, &names, &lats, &lngs, &seen_at);
        }

        Ok(())
    }

    fn observe_role(
        &mut self,
        ids: &Int64Array,
        names: &StringArray,
        lats: &Float64Array,
        lngs: &Float64Array,
        seen_at: &TimestampMillisecondArray,
    ) {
        for i in 0..ids.len() {
            if ids.is_null(i) {
                continue;
            }
            let name = names.is_valid(i).then(|| names.value(i).to_string());
            let stats = self.groups.entry((ids.value(i), name)).or_default();
            stats.observe(
                lats.is_valid(i).then(|| lats.value(i)),
                lngs.is_valid(i).then(|| lngs.value(i)),
                seen_at.is_valid(i).then(|| seen_at.value(i)),
            );
            self.observations += 1;
        }
    }

    /// One record per station id, ordered by id. The name comes from the group
    /// seen most recently; coordinates and the seen window span every group.
    pub fn finish(self) -> Vec<StationRecord> {
        let mut by_id: HashMap<i64, (Option<String>, Option<i64>, ObservationStats)> =
            HashMap::new();

        for ((station_id, name), stats) in self.groups {
            match by_id.get_mut(&station_id) {
                None => {
                    by_id.insert(station_id, (name, stats.latest, stats));
                }
                Some((best_name, best_latest, total)) => {
                    // Ties on latest_seen fall back to name order so rebuilds are stable.
                    if (stats.latest, &name) > (*best_latest, &*best_name) {
                        *best_name = name;
                        *best_latest = stats.latest;
                    }
                    total.merge(&stats);
                }
            }
        }

        let mut records: Vec<StationRecord> = by_id
            .into_iter()
            .map(|(station_id, (station_name, _, stats))| StationRecord {
                station_id,
                station_name,
                lat: stats.mean_lat(),
                lng: stats.mean_lng(),
                earliest_seen: stats.earliest,
                latest_seen: stats.latest,
            })
            .collect();
        records.sort_by_key(|r| r.station_id);
        records
    }
}

pub fn records_to_batch(records: &[StationRecord]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from_iter_values(records.iter().map(|r| r.station_id))),
        Arc::new(StringArray::from_iter(records.iter().map(|r| r.station_name.as_deref()))),
        Arc::new(Float64Array::from_iter(records.iter().map(|r| r.lat))),
        Arc::new(Float64Array::from_iter(records.iter().map(|r| r.lng))),
        Arc::new(TimestampMillisecondArray::from_iter(records.iter().map(|r| r.earliest_seen))),
        Arc::new(TimestampMillisecondArray::from_iter(records.iter().map(|r| r.latest_seen))),
    ];

    Ok(RecordBatch::try_new(get_schema(TableSchema::Stations), columns)?)
}

/// Station ids must be integers; anything else would break every join on the dimension.
pub fn validate_station_schema(schema: &Schema) -> Result<()> {
    let field = schema
        .field_with_name("station_id")
        .map_err(|_| Error::SchemaValidation("station dimension has no station_id".to_string()))?;

    if field.data_type() != &DataType::Int64 {
        return Err(Error::SchemaValidation(format!(
            "station_id must be Int64, found {}",
            field.data_type()
        )));
    }
    Ok(())
}

/// Rebuilds the dimension from a full scan of the master table, one partition at a time.
pub async fn build_station_dimension(scanner: &PartitionScanner) -> Result<RecordBatch> {
    let mut builder = StationDimensionBuilder::new();
    let mut partitions = 0usize;

    let mut stream = Box::pin(scanner.scan().await?);
    while let Some(partition) = stream.next().await {
        let partition = partition?;
        for batch in &partition.batches {
            builder.observe_batch(batch)?;
        }
        partitions += 1;
        debug!(partition = %partition.key, "Observed stations in partition");
    }

    let observations = builder.observations();
    let records = builder.finish();
    info!(partitions, observations, stations = records.len(), "Built station dimension");
    records_to_batch(&records)
}

/// Key of the marker that exists while the master table holds partitions
/// the dimension at `stations_key` has not seen.
pub fn stale_marker_key(stations_key: &str) -> String {
    format!("{}.stale", stations_key)
}

/// Rebuilds the dimension, overwrites the object at `key` and clears its
/// stale marker.
pub async fn write_station_dimension(
    scanner: &PartitionScanner,
    storage: &dyn ObjectStorage,
    key: &str,
) -> Result<usize> {
    let batch = build_station_dimension(scanner).await?;
    let rows = batch.num_rows();

    let metadata = vec![
        ("row_count".to_string(), rows.to_string()),
        ("written_at".to_string(), Utc::now().to_rfc3339()),
    ];
    let data = write_parquet(batch.schema(), &[batch], metadata)?;
    storage.put_object(key, &data).await?;
    storage.delete_object(&stale_marker_key(key)).await?;

    info!(%key, stations = rows, "Wrote station dimension");
    Ok(rows)
}
