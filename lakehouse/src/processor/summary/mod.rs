pub mod queries;

use crate::processor::ingest::scan::PartitionScanner;
use crate::schema::{TableSchema, get_schema};
use crate::storage::{ObjectStorage, StorageConfig, TableStore};
use crate::utils::arrow::{without_view_schema, without_view_types, write_parquet};
use crate::utils::paths::join_key;
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use common::config::{BucketConfig, SummaryConfig};
use common::{Error, Result};
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Read-optimized tables derived from the master table and station dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SummaryTable {
    SystemDaily,
    SystemDailyDetailed,
    StationDaily,
    StationDailyDetailed,
    StationHourly,
    StationRoutes,
    TimeAggregated,
}

impl SummaryTable {
    pub const ALL: [SummaryTable; 7] = [
        SummaryTable::SystemDaily,
        SummaryTable::SystemDailyDetailed,
        SummaryTable::StationDaily,
        SummaryTable::StationDailyDetailed,
        SummaryTable::StationHourly,
        SummaryTable::StationRoutes,
        SummaryTable::TimeAggregated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SummaryTable::SystemDaily => "system_daily",
            SummaryTable::SystemDailyDetailed => "system_daily_detailed",
            SummaryTable::StationDaily => "station_daily",
            SummaryTable::StationDailyDetailed => "station_daily_detailed",
            SummaryTable::StationHourly => "station_hourly",
            SummaryTable::StationRoutes => "station_routes",
            SummaryTable::TimeAggregated => "time_aggregated",
        }
    }

    pub fn sql(&self, config: &SummaryConfig) -> String {
        match self {
            SummaryTable::SystemDaily => queries::system_daily(),
            SummaryTable::SystemDailyDetailed => queries::system_daily_detailed(),
            SummaryTable::StationDaily => queries::station_daily(),
            SummaryTable::StationDailyDetailed => queries::station_daily_detailed(),
            SummaryTable::StationHourly => queries::station_hourly(),
            SummaryTable::StationRoutes => queries::station_routes(config),
            SummaryTable::TimeAggregated => queries::time_aggregated(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SummaryReport {
    /// Output key and row count per table.
    pub tables: BTreeMap<String, usize>,
}

pub struct SummaryBuilder {
    ctx: SessionContext,
    processed: Arc<dyn ObjectStorage>,
    table_store: TableStore,
    master_prefix: String,
    stations_key: String,
    aggregates_prefix: String,
    config: SummaryConfig,
}

impl SummaryBuilder {
    pub fn new(storage: &StorageConfig, buckets: &BucketConfig, config: &SummaryConfig) -> Self {
        Self {
            ctx: SessionContext::new(),
            processed: storage.processed.clone(),
            table_store: storage.processed_table.clone(),
            master_prefix: buckets.master_prefix.clone(),
            stations_key: buckets.stations_key.clone(),
            aggregates_prefix: buckets.aggregates_prefix.clone(),
            config: config.clone(),
        }
    }

    pub fn output_key(&self, table: SummaryTable) -> String {
        join_key(&self.aggregates_prefix, &format!("{}.parquet", table.name()))
    }

    /// Registers `trips` and `stations` against the processed bucket.
    async fn register_tables(&self) -> Result<()> {
        let scanner = PartitionScanner::new(self.processed.clone(), &self.master_prefix);
        if scanner.existing_partitions().await?.is_empty() {
            return Err(Error::InvalidInput(format!(
                "master table under {} has no partitions",
                self.master_prefix
            )));
        }
        if !self.processed.check_file_exists(&self.stations_key).await? {
            return Err(Error::InvalidInput(format!(
                "station dimension {} is missing",
                self.stations_key
            )));
        }

        self.table_store.register(&self.ctx);

        let trips_schema = get_schema(TableSchema::Trips);
        let trips_options = ParquetReadOptions::default()
            .schema(&trips_schema)
            .table_partition_cols(vec![]);
        let trips_url = self.table_store.prefix_url(&self.master_prefix);
        self.register("trips", &trips_url, trips_options).await?;

        let stations_schema = get_schema(TableSchema::Stations);
        let stations_options = ParquetReadOptions::default().schema(&stations_schema);
        let stations_url = self.table_store.object_url(&self.stations_key);
        self.register("stations", &stations_url, stations_options).await
    }

    async fn register(&self, name: &str, url: &str, options: ParquetReadOptions<'_>) -> Result<()> {
        self.ctx.deregister_table(name)?;
        self.ctx
            .register_parquet(name, url, options)
            .await
            .map_err(|e| Error::Other(format!("Failed to register {} at {}: {}", name, url, e)))
    }

    async fn run_query(&self, table: SummaryTable) -> Result<(arrow::datatypes::SchemaRef, Vec<RecordBatch>)> {
        let df = self.ctx.sql(&table.sql(&self.config)).await?;
        let planned = without_view_schema(df.schema().as_arrow());
        let batches = df
            .collect()
            .await?
            .iter()
            .map(without_view_types)
            .collect::<Result<Vec<_>>>()?;
        let schema = batches.first().map(|b| b.schema()).unwrap_or(planned);
        Ok((schema, batches))
    }

    async fn write_table(&self, table: SummaryTable) -> Result<usize> {
        let (schema, batches) = self.run_query(table).await?;
        let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();

        let metadata = vec![
            ("row_count".to_string(), rows.to_string()),
            ("written_at".to_string(), Utc::now().to_rfc3339()),
        ];
        let data = write_parquet(schema, &batches, metadata)?;
        let key = self.output_key(table);
        self.processed.put_object(&key, &data).await?;

        info!(table = table.name(), %key, rows, "Wrote summary table");
        Ok(rows)
    }

    pub async fn build_table(&self, table: SummaryTable) -> Result<usize> {
        self.register_tables().await?;
        self.write_table(table).await
    }

    pub async fn build_all_summaries(&self) -> Result<SummaryReport> {
        self.register_tables().await?;

        let mut report = SummaryReport::default();
        for table in SummaryTable::ALL {
            let rows = self.write_table(table).await?;
            report.tables.insert(self.output_key(table), rows);
        }

        info!(tables = report.tables.len(), "Built all summary tables");
        Ok(report)
    }
}
