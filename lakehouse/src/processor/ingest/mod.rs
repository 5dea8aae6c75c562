pub mod classify;
pub mod scan;

use crate::processor::normalize::{SourceEra, TripNormalizer};
use crate::processor::normalize::parse::millis_to_datetime;
use crate::processor::stations::{StationReference, stale_marker_key, write_station_dimension};
use crate::schema::{TRIP_SCHEMA_VERSION, TableSchema, get_schema};
use crate::storage::{ObjectStorage, StorageConfig};
use crate::utils::arrow::{column, concat, read_csv_as_text, read_parquet};
use crate::utils::arrow::write_parquet;
use crate::utils::paths::{PartitionKey, PathBuilder};
use arrow::array::{Array, AsArray, BooleanArray, TimestampMillisecondArray};
use arrow::compute::filter_record_batch;
use arrow::datatypes::TimestampMillisecondType;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{Datelike, Utc};
use classify::{RawFileFormat, RawFileKind, classify, raw_format};
use common::config::BucketConfig;
use common::{Error, Result};
use scan::PartitionScanner;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one assembler run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestReport {
    pub files_seen: usize,
    pub files_ignored: Vec<String>,
    pub files_skipped: Vec<String>,
    pub partitions_written: Vec<PartitionKey>,
    pub partitions_skipped: Vec<PartitionKey>,
    pub rows_written: usize,
    pub rows_dropped: usize,
    /// Station count of the rebuilt dimension, when it was rebuilt.
    pub stations_rebuilt: Option<usize>,
}

impl IngestReport {
    pub fn wrote_anything(&self) -> bool {
        !self.partitions_written.is_empty() || self.stations_rebuilt.is_some()
    }
}

/// Incremental driver that turns raw monthly and yearly trip files into the
/// `year=/month=` partitioned master table.
pub struct MasterTableBuilder {
    raw: Arc<dyn ObjectStorage>,
    processed: Arc<dyn ObjectStorage>,
    raw_prefix: String,
    master_prefix: String,
    stations_key: String,
    refresh_stations: bool,
}

impl MasterTableBuilder {
    pub fn new(storage: &StorageConfig, buckets: &BucketConfig) -> Self {
        Self {
            raw: storage.raw.clone(),
            processed: storage.processed.clone(),
            raw_prefix: buckets.raw_prefix.clone(),
            master_prefix: buckets.master_prefix.clone(),
            stations_key: buckets.stations_key.clone(),
            refresh_stations: false,
        }
    }

    pub fn with_refresh_stations(mut self, refresh: bool) -> Self {
        self.refresh_stations = refresh;
        self
    }

    pub fn scanner(&self) -> PartitionScanner {
        PartitionScanner::new(self.processed.clone(), &self.master_prefix)
    }

    /// Processes every raw file in listing order, stopping at the first failure.
    /// With `missing_months` set, partitions that already exist are neither
    /// re-read nor re-written.
    pub async fn build_master_table(
        &self,
        stations: &StationReference,
        missing_months: bool,
    ) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let raw_keys = self.raw.list_objects(&self.raw_prefix).await?;
        report.files_seen = raw_keys.len();

        let mut files: Vec<(String, RawFileKind)> = Vec::new();
        for key in raw_keys {
            match classify(&key) {
                RawFileKind::Ignore => {
                    debug!(%key, "Ignoring raw object");
                    report.files_ignored.push(key);
                }
                kind => files.push((key, kind)),
            }
        }

        // Months owned by a monthly file are never taken from a bulk file.
        let monthly_owned: BTreeSet<PartitionKey> = files
            .iter()
            .filter_map(|(_, kind)| match kind {
                RawFileKind::Monthly(partition) => Some(*partition),
                _ => None,
            })
            .collect();

        let mut existing = self.scanner().existing_partitions().await?;
        let normalizer = TripNormalizer::new(stations);
        let marker = stale_marker_key(&self.stations_key);
        let mut dimension_stale = self.processed.check_file_exists(&marker).await?;
        if dimension_stale {
            warn!(%marker, "Station dimension is behind the master table, it will be rebuilt");
        }

        info!(
            raw_bucket = self.raw.bucket(),
            processed_bucket = self.processed.bucket(),
            files = files.len(),
            existing = existing.len(),
            missing_months,
            "Assembling master table"
        );

        for (key, kind) in &files {
            match *kind {
                RawFileKind::Monthly(partition) => {
                    if missing_months && existing.contains(&partition) {
                        debug!(%key, %partition, "Partition exists, skipping file");
                        report.files_skipped.push(key.clone());
                        report.partitions_skipped.push(partition);
                        continue;
                    }

                    let trips = self
                        .load_trips(key, &normalizer)
                        .await
                        .map_err(|e| e.in_file(key))?;
                    let (placed, dropped) = drop_untimed(&trips)?;
                    report.rows_dropped += dropped;

                    self.mark_dimension_stale(&marker, &mut dimension_stale).await?;
                    self.write_partition(partition, key, &placed)
                        .await
                        .map_err(|e| e.in_file(key))?;
                    report.rows_written += placed.num_rows();
                    report.partitions_written.push(partition);
                    existing.insert(partition);
                }
                RawFileKind::Bulk(year) => {
                    let wanted: BTreeSet<PartitionKey> = (1..=12)
                        .map(|month| PartitionKey::new(year, month))
                        .filter(|p| !monthly_owned.contains(p))
                        .filter(|p| !(missing_months && existing.contains(p)))
                        .collect();

                    if wanted.is_empty() {
                        debug!(%key, year, "Every month of bulk file is present, skipping file");
                        report.files_skipped.push(key.clone());
                        continue;
                    }

                    let trips = self
                        .load_trips(key, &normalizer)
                        .await
                        .map_err(|e| e.in_file(key))?;
                    let (months, dropped) = split_by_month(&trips, year).map_err(|e| e.in_file(key))?;
                    if dropped > 0 {
                        warn!(%key, year, dropped, "Dropped bulk rows outside the file's year or without a start time");
                    }
                    report.rows_dropped += dropped;

                    for (partition, batch) in months {
                        if !wanted.contains(&partition) {
                            debug!(%key, %partition, "Month already covered, not rewriting");
                            report.partitions_skipped.push(partition);
                            continue;
                        }
                        self.mark_dimension_stale(&marker, &mut dimension_stale).await?;
                        self.write_partition(partition, key, &batch)
                            .await
                            .map_err(|e| e.in_file(key))?;
                        report.rows_written += batch.num_rows();
                        report.partitions_written.push(partition);
                        existing.insert(partition);
                    }
                }
                RawFileKind::Ignore => {}
            }
        }

        let dimension_missing = !self.processed.check_file_exists(&self.stations_key).await?;
        if dimension_stale || dimension_missing || self.refresh_stations {
            let stations = write_station_dimension(
                &self.scanner(),
                self.processed.as_ref(),
                &self.stations_key,
            )
            .await?;
            report.stations_rebuilt = Some(stations);
        } else {
            debug!("Master table unchanged, keeping station dimension");
        }

        info!(
            written = report.partitions_written.len(),
            skipped = report.partitions_skipped.len(),
            rows = report.rows_written,
            dropped = report.rows_dropped,
            "Master table assembled"
        );
        Ok(report)
    }

    /// Writes the stale marker once per run, before the first partition
    /// write, so a failure before the dimension is rebuilt survives into the
    /// next run.
    async fn mark_dimension_stale(&self, marker: &str, stale: &mut bool) -> Result<()> {
        if !*stale {
            self.processed.put_object(marker, &[]).await?;
            *stale = true;
        }
        Ok(())
    }

    /// Reads one raw object and maps it onto the canonical trip schema.
    async fn load_trips(&self, key: &str, normalizer: &TripNormalizer<'_>) -> Result<RecordBatch> {
        let format = raw_format(key)
            .ok_or_else(|| Error::InvalidInput(format!("unsupported raw file format: {}", key)))?;
        let data = self.raw.get_object(key).await?;

        let (schema, batches) = match format {
            RawFileFormat::Csv => read_csv_as_text(&data)?,
            RawFileFormat::Parquet => read_parquet(Bytes::from(data))?,
        };
        // Detect before normalizing so a header-only file still fails on bad columns.
        let era = SourceEra::detect(&schema)?;

        let normalized = batches
            .iter()
            .map(|batch| normalizer.normalize(batch))
            .collect::<Result<Vec<_>>>()?;
        let trips = concat(&get_schema(TableSchema::Trips), &normalized)?;

        info!(%key, era = ?era, rows = trips.num_rows(), "Normalized raw file");
        Ok(trips)
    }

    async fn write_partition(
        &self,
        partition: PartitionKey,
        source_key: &str,
        trips: &RecordBatch,
    ) -> Result<()> {
        let path = PathBuilder::new(&self.master_prefix, partition).build_file_path();
        let metadata = vec![
            ("source_key".to_string(), source_key.to_string()),
            ("schema_version".to_string(), TRIP_SCHEMA_VERSION.to_string()),
            ("row_count".to_string(), trips.num_rows().to_string()),
            ("written_at".to_string(), Utc::now().to_rfc3339()),
        ];

        let result = async {
            let data = write_parquet(trips.schema(), std::slice::from_ref(trips), metadata)?;
            self.processed.put_object(&path, &data).await
        }
        .await;
        result.map_err(|e| e.in_partition(partition.year, partition.month))?;

        info!(%path, rows = trips.num_rows(), "Wrote partition");
        Ok(())
    }
}

fn started_at(trips: &RecordBatch) -> Result<&TimestampMillisecondArray> {
    column(trips, "started_at")
        .and_then(|array| array.as_primitive_opt::<TimestampMillisecondType>())
        .ok_or_else(|| Error::SchemaValidation("normalized trips lack started_at".to_string()))
}

/// Removes rows that cannot be placed in time.
fn drop_untimed(trips: &RecordBatch) -> Result<(RecordBatch, usize)> {
    let started = started_at(trips)?;
    if started.null_count() == 0 {
        return Ok((trips.clone(), 0));
    }

    let mask: BooleanArray = started.iter().map(|v| Some(v.is_some())).collect();
    let placed = filter_record_batch(trips, &mask)?;
    let dropped = trips.num_rows() - placed.num_rows();
    Ok((placed, dropped))
}

/// Groups a bulk file's trips by start month. Rows outside `year` or without
/// a start time are dropped and counted.
fn split_by_month(trips: &RecordBatch, year: i32) -> Result<(BTreeMap<PartitionKey, RecordBatch>, usize)> {
    let started = started_at(trips)?;
    let months: Vec<Option<u32>> = started
        .iter()
        .map(|v| {
            v.and_then(millis_to_datetime)
                .filter(|ts| ts.year() == year)
                .map(|ts| ts.month())
        })
        .collect();

    let present: BTreeSet<u32> = months.iter().flatten().copied().collect();
    let mut groups = BTreeMap::new();
    for month in present {
        let mask: BooleanArray = months.iter().map(|m| Some(*m == Some(month))).collect();
        groups.insert(
            PartitionKey::new(year, month),
            filter_record_batch(trips, &mask)?,
        );
    }

    let placed: usize = groups.values().map(RecordBatch::num_rows).sum();
    Ok((groups, trips.num_rows() - placed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::arrow::column;
    use arrow::array::{Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use async_trait::async_trait;
    use common::config::BucketConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PRE_HEADER: &str = "Duration,Start date,End date,Start station number,Start station,\
End station number,End station,Bike number,Member type\n";

    fn pre_row(start: &str, end: &str, from: i64, to: i64) -> String {
        format!("600,{start},{end},{from},Station {from},{to},Station {to},W00001,Registered\n")
    }

    fn buckets(raw_prefix: &str) -> BucketConfig {
        BucketConfig {
            raw_prefix: raw_prefix.to_string(),
            ..BucketConfig::default()
        }
    }

    fn setup() -> (StorageConfig, MasterTableBuilder) {
        let storage = StorageConfig::in_memory("raw", "processed").unwrap();
        let builder = MasterTableBuilder::new(&storage, &buckets(""));
        (storage, builder)
    }

    async fn put_raw(storage: &StorageConfig, key: &str, body: String) {
        storage.raw.put_object(key, body.as_bytes()).await.unwrap();
    }

    async fn partition_rows(storage: &StorageConfig, year: i32, month: u32) -> usize {
        let path = PathBuilder::new("master/trips", PartitionKey::new(year, month)).build_file_path();
        let data = storage.processed.get_object(&path).await.unwrap();
        let (_, batches) = read_parquet(Bytes::from(data)).unwrap();
        batches.iter().map(|b| b.num_rows()).sum()
    }

    #[tokio::test]
    async fn test_second_run_writes_nothing() {
        let (storage, builder) = setup();
        let body = format!(
            "{PRE_HEADER}{}{}",
            pre_row("2019-05-01 08:00:00", "2019-05-01 08:10:00", 31000, 31001),
            pre_row("2019-05-02 09:00:00", "2019-05-02 09:10:00", 31001, 31000),
        );
        put_raw(&storage, "201905.csv", body).await;
        put_raw(&storage, "README.md", "notes".to_string()).await;

        let first = builder
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap();
        assert_eq!(first.partitions_written, vec![PartitionKey::new(2019, 5)]);
        assert_eq!(first.rows_written, 2);
        assert_eq!(first.files_ignored, vec!["README.md".to_string()]);
        assert_eq!(first.stations_rebuilt, Some(2));

        let second = builder
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap();
        assert!(!second.wrote_anything());
        assert_eq!(second.files_skipped, vec!["201905.csv".to_string()]);
        assert_eq!(partition_rows(&storage, 2019, 5).await, 2);
    }

    /// Processed store whose writes to one key fail a fixed number of times.
    struct FailingWrites {
        inner: Arc<dyn ObjectStorage>,
        key: String,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStorage for FailingWrites {
        async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
            let fail = key == self.key
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if fail {
                return Err(Error::Storage(format!("PUT {} failed: connection reset", key)));
            }
            self.inner.put_object(key, data).await
        }

        async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
            self.inner.get_object(key).await
        }

        async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list_objects(prefix).await
        }

        async fn check_file_exists(&self, key: &str) -> Result<bool> {
            self.inner.check_file_exists(key).await
        }

        async fn delete_object(&self, key: &str) -> Result<()> {
            self.inner.delete_object(key).await
        }

        fn bucket(&self) -> &str {
            self.inner.bucket()
        }
    }

    #[tokio::test]
    async fn test_rerun_rebuilds_dimension_after_failed_write() {
        let (storage, builder) = setup();
        let stations_key = buckets("").stations_key;
        put_raw(
            &storage,
            "201901.csv",
            format!("{PRE_HEADER}{}", pre_row("2019-01-05 08:00:00", "2019-01-05 08:10:00", 31000, 31000)),
        )
        .await;
        let first = builder
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap();
        assert_eq!(first.stations_rebuilt, Some(1));

        // February lands but the dimension write that follows it fails.
        put_raw(
            &storage,
            "201902.csv",
            format!("{PRE_HEADER}{}", pre_row("2019-02-05 08:00:00", "2019-02-05 08:10:00", 31001, 31002)),
        )
        .await;
        let failing = StorageConfig {
            processed: Arc::new(FailingWrites {
                inner: storage.processed.clone(),
                key: stations_key.clone(),
                failures: AtomicUsize::new(1),
            }),
            ..storage.clone()
        };
        let err = MasterTableBuilder::new(&failing, &buckets(""))
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(partition_rows(&storage, 2019, 2).await, 1);

        let rerun = builder
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap();
        assert!(rerun.partitions_written.is_empty());
        assert_eq!(rerun.stations_rebuilt, Some(3));
        let reference = StationReference::load(storage.processed.as_ref(), &stations_key)
            .await
            .unwrap();
        assert!(reference.get(31001).is_some());
        assert!(reference.get(31002).is_some());

        let settled = builder
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap();
        assert!(!settled.wrote_anything());
        assert!(
            !storage
                .processed
                .check_file_exists(&stale_marker_key(&stations_key))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_bulk_file_fills_only_missing_months() {
        let storage = StorageConfig::in_memory("raw", "processed").unwrap();
        let seeder = MasterTableBuilder::new(&storage, &buckets("seed"));
        let builder = MasterTableBuilder::new(&storage, &buckets("incoming"));

        // January is already materialized from an earlier run.
        let january = format!(
            "{PRE_HEADER}{}",
            pre_row("2015-01-10 08:00:00", "2015-01-10 08:10:00", 31000, 31001)
        );
        put_raw(&storage, "seed/201501.csv", january).await;
        seeder
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap();

        let bulk = format!(
            "{PRE_HEADER}{}{}{}{}",
            pre_row("2015-01-05 08:00:00", "2015-01-05 08:10:00", 31000, 31001),
            pre_row("2015-01-06 08:00:00", "2015-01-06 08:10:00", 31000, 31001),
            pre_row("2015-02-05 08:00:00", "2015-02-05 08:10:00", 31000, 31001),
            pre_row("2015-03-05 08:00:00", "2015-03-05 08:10:00", 31002, 31001),
        );
        put_raw(&storage, "incoming/2015.csv", bulk).await;

        let report = builder
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap();

        assert_eq!(
            report.partitions_written,
            vec![PartitionKey::new(2015, 2), PartitionKey::new(2015, 3)]
        );
        assert!(report.partitions_skipped.contains(&PartitionKey::new(2015, 1)));
        assert_eq!(partition_rows(&storage, 2015, 1).await, 1);
        assert_eq!(partition_rows(&storage, 2015, 2).await, 1);
        assert_eq!(report.stations_rebuilt, Some(3));
    }

    #[tokio::test]
    async fn test_monthly_file_wins_over_bulk() {
        let (storage, builder) = setup();
        let bulk = format!(
            "{PRE_HEADER}{}{}{}",
            pre_row("2016-02-01 08:00:00", "2016-02-01 08:10:00", 31000, 31001),
            pre_row("2016-02-02 08:00:00", "2016-02-02 08:10:00", 31000, 31001),
            pre_row("2016-04-02 08:00:00", "2016-04-02 08:10:00", 31000, 31001),
        );
        let monthly = format!(
            "{PRE_HEADER}{}",
            pre_row("2016-02-03 08:00:00", "2016-02-03 08:10:00", 31000, 31001)
        );
        put_raw(&storage, "2016.csv", bulk).await;
        put_raw(&storage, "201602.csv", monthly).await;

        let report = builder
            .build_master_table(&StationReference::empty(), false)
            .await
            .unwrap();

        assert_eq!(partition_rows(&storage, 2016, 2).await, 1);
        assert_eq!(partition_rows(&storage, 2016, 4).await, 1);
        assert_eq!(report.partitions_written.len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_drops_rows_outside_year_and_untimed() {
        let (storage, builder) = setup();
        let bulk = format!(
            "{PRE_HEADER}{}{}{}",
            pre_row("2017-06-01 08:00:00", "2017-06-01 08:10:00", 31000, 31001),
            pre_row("2018-01-01 00:05:00", "2018-01-01 00:15:00", 31000, 31001),
            pre_row("not a date", "2017-06-01 08:10:00", 31000, 31001),
        );
        put_raw(&storage, "2017.csv", bulk).await;

        let report = builder
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap();

        assert_eq!(report.partitions_written, vec![PartitionKey::new(2017, 6)]);
        assert_eq!(report.rows_dropped, 2);
        assert!(
            !storage
                .processed
                .check_file_exists("master/trips/year=2018/month=01/part.parquet")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_file_without_date_columns_fails_with_context() {
        let (storage, builder) = setup();
        put_raw(&storage, "201801.csv", "Duration,Bike number\n60,W1\n".to_string()).await;

        let err = builder
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::File { ref key, .. } if key == "201801.csv"));
        assert!(
            storage
                .processed
                .list_objects("master/trips")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_parquet_raw_file_with_post_era_columns() {
        let (storage, builder) = setup();
        let schema = Arc::new(Schema::new(vec![
            Field::new("ride_id", DataType::Utf8, true),
            Field::new("started_at", DataType::Utf8, true),
            Field::new("ended_at", DataType::Utf8, true),
            Field::new("start_station_id", DataType::Utf8, true),
            Field::new("member_casual", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["R1"])),
                Arc::new(StringArray::from(vec!["2021-05-03 09:15:00"])),
                Arc::new(StringArray::from(vec!["2021-05-03 09:25:00"])),
                Arc::new(StringArray::from(vec!["31000.0"])),
                Arc::new(StringArray::from(vec!["member"])),
            ],
        )
        .unwrap();
        let data = write_parquet(schema, &[batch], vec![]).unwrap();
        storage.raw.put_object("202105.parquet", &data).await.unwrap();

        builder
            .build_master_table(&StationReference::empty(), true)
            .await
            .unwrap();

        let path = "master/trips/year=2021/month=05/part.parquet";
        let data = storage.processed.get_object(path).await.unwrap();
        let (schema, batches) = read_parquet(Bytes::from(data)).unwrap();
        assert_eq!(schema.fields().len(), 18);
        let ids = column(&batches[0], "start_station_id").unwrap();
        assert_eq!(ids.data_type(), &DataType::Int64);
        assert!(ids.is_valid(0));

        let reference = StationReference::load(storage.processed.as_ref(), &buckets("").stations_key)
            .await
            .unwrap();
        assert!(reference.get(31000).is_some());
    }
}
