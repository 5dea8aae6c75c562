use crate::processor::stations::write_station_dimension;
use crate::processor::{
    IngestReport, MasterTableBuilder, StationReference, SummaryBuilder, SummaryReport,
};
use crate::storage::StorageConfig;
use common::Result;
use common::config::Settings;
use tracing::info;

/// Entry points for each pipeline stage over one configured pair of buckets.
pub struct PipelineService {
    settings: Settings,
    storage: StorageConfig,
}

impl PipelineService {
    pub async fn new(settings: &Settings) -> Result<Self> {
        let storage = StorageConfig::from_settings(settings).await?;
        Ok(Self::with_storage(settings, storage))
    }

    pub fn with_storage(settings: &Settings, storage: StorageConfig) -> Self {
        Self {
            settings: settings.clone(),
            storage,
        }
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    fn master_table(&self, refresh_stations: bool) -> MasterTableBuilder {
        MasterTableBuilder::new(&self.storage, &self.settings.buckets)
            .with_refresh_stations(refresh_stations || self.settings.ingest.refresh_stations)
    }

    /// Runs the assembler against the current station dimension. `rebuild`
    /// rewrites partitions that already exist.
    pub async fn run_ingest(&self, rebuild: bool, refresh_stations: bool) -> Result<IngestReport> {
        let stations_key = &self.settings.buckets.stations_key;
        let stations = StationReference::load(self.storage.processed.as_ref(), stations_key).await?;
        let missing_months = self.settings.ingest.missing_months && !rebuild;

        info!(missing_months, reference_stations = stations.len(), "Starting ingest");
        self.master_table(refresh_stations)
            .build_master_table(&stations, missing_months)
            .await
    }

    pub async fn rebuild_stations(&self) -> Result<usize> {
        let scanner = self.master_table(true).scanner();
        write_station_dimension(
            &scanner,
            self.storage.processed.as_ref(),
            &self.settings.buckets.stations_key,
        )
        .await
    }

    pub async fn build_summaries(&self) -> Result<SummaryReport> {
        SummaryBuilder::new(&self.storage, &self.settings.buckets, &self.settings.summary)
            .build_all_summaries()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::StorageBackend;

    fn memory_settings() -> Settings {
        let mut settings = Settings::default();
        settings.storage.backend = StorageBackend::Memory;
        settings.summary.min_route_trips = 1;
        settings
    }

    #[tokio::test]
    async fn test_full_run_then_rerun() {
        let settings = memory_settings();
        let service = PipelineService::new(&settings).await.unwrap();

        let csv = "ride_id,rideable_type,started_at,ended_at,start_station_name,start_station_id,\
end_station_name,end_station_id,start_lat,start_lng,end_lat,end_lng,member_casual\n\
R1,classic_bike,2023-07-04 12:00:00,2023-07-04 12:20:00,Lincoln Memorial,31258,Jefferson Memorial,31249,38.888,-77.050,38.879,-77.037,casual\n";
        service
            .storage()
            .raw
            .put_object("202307.csv", csv.as_bytes())
            .await
            .unwrap();

        let first = service.run_ingest(false, false).await.unwrap();
        assert_eq!(first.rows_written, 1);
        assert_eq!(first.stations_rebuilt, Some(2));

        let summaries = service.build_summaries().await.unwrap();
        assert!(summaries.tables.contains_key("aggregates/station_routes.parquet"));

        let second = service.run_ingest(false, false).await.unwrap();
        assert!(!second.wrote_anything());

        let forced = service.run_ingest(true, false).await.unwrap();
        assert_eq!(forced.partitions_written.len(), 1);
        assert_eq!(service.rebuild_stations().await.unwrap(), 2);
    }
}
