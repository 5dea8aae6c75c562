use config::{Config, ConfigError};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub buckets: BucketConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Local,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_s3_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default = "default_local_root")]
    pub local_root: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BucketConfig {
    #[serde(default = "default_raw_bucket")]
    pub raw_bucket: String,
    #[serde(default)]
    pub raw_prefix: String,
    #[serde(default = "default_processed_bucket")]
    pub processed_bucket: String,
    #[serde(default = "default_master_prefix")]
    pub master_prefix: String,
    #[serde(default = "default_stations_key")]
    pub stations_key: String,
    #[serde(default = "default_aggregates_prefix")]
    pub aggregates_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Skip partitions that already exist in the master table.
    #[serde(default = "default_true")]
    pub missing_months: bool,
    /// Rebuild the station dimension even when no partition changed.
    #[serde(default)]
    pub refresh_stations: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummaryConfig {
    #[serde(default = "default_min_route_trips")]
    pub min_route_trips: i64,
    #[serde(default = "default_max_routes")]
    pub max_routes: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            endpoint: None,
            region: default_s3_region(),
            access_key: None,
            secret_key: None,
            local_root: default_local_root(),
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            raw_bucket: default_raw_bucket(),
            raw_prefix: String::new(),
            processed_bucket: default_processed_bucket(),
            master_prefix: default_master_prefix(),
            stations_key: default_stations_key(),
            aggregates_prefix: default_aggregates_prefix(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            missing_months: true,
            refresh_stations: false,
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            min_route_trips: default_min_route_trips(),
            max_routes: default_max_routes(),
        }
    }
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_local_root() -> String {
    "data".to_string()
}

fn default_raw_bucket() -> String {
    "capital-bikeshare-public".to_string()
}

fn default_processed_bucket() -> String {
    "capital-bikeshare-manipulated".to_string()
}

fn default_master_prefix() -> String {
    "master/trips".to_string()
}

fn default_stations_key() -> String {
    "dimensions/stations.parquet".to_string()
}

fn default_aggregates_prefix() -> String {
    "aggregates".to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_route_trips() -> i64 {
    10
}

fn default_max_routes() -> usize {
    10_000
}

impl Settings {
    /// Loads settings from an optional config file, `CABI_*` variables and the
    /// bucket override variables, in increasing priority.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("CABI")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        let mut settings: Settings = config.try_deserialize()?;

        settings.apply_overrides(|name| std::env::var(name).ok());

        debug!(
            backend = ?settings.storage.backend,
            raw_bucket = %settings.buckets.raw_bucket,
            processed_bucket = %settings.buckets.processed_bucket,
            "Loaded pipeline settings"
        );

        Ok(settings)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let buckets = &mut self.buckets;
        let targets: [(&str, &mut String); 6] = [
            ("S3_BUCKET_RAW", &mut buckets.raw_bucket),
            ("S3_PREFIX_RAW", &mut buckets.raw_prefix),
            ("S3_BUCKET_PROCESSED", &mut buckets.processed_bucket),
            ("S3_PREFIX_MASTER", &mut buckets.master_prefix),
            ("S3_KEY_STATIONS", &mut buckets.stations_key),
            ("S3_PREFIX_AGG", &mut buckets.aggregates_prefix),
        ];

        for (name, target) in targets {
            if let Some(value) = lookup(name) {
                *target = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = Settings::new("does/not/exist/etl").unwrap();
        assert_eq!(settings.buckets.master_prefix, "master/trips");
        assert_eq!(settings.buckets.stations_key, "dimensions/stations.parquet");
        assert!(settings.ingest.missing_months);
        assert_eq!(settings.summary.min_route_trips, 10);
    }

    #[test]
    fn test_file_sections_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[storage]
backend = "local"
local_root = "/tmp/cabi"

[buckets]
raw_bucket = "raw"
master_prefix = "trips"

[ingest]
missing_months = false
"#
        )
        .unwrap();

        let settings = Settings::new(file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.storage.backend, StorageBackend::Local);
        assert_eq!(settings.storage.local_root, "/tmp/cabi");
        assert_eq!(settings.buckets.raw_bucket, "raw");
        assert_eq!(settings.buckets.master_prefix, "trips");
        assert_eq!(settings.buckets.aggregates_prefix, "aggregates");
        assert!(!settings.ingest.missing_months);
    }

    #[test]
    fn test_bucket_overrides() {
        let mut settings = Settings::default();
        settings.apply_overrides(|name| match name {
            "S3_BUCKET_PROCESSED" => Some("processed".to_string()),
            "S3_KEY_STATIONS" => Some("stations.parquet".to_string()),
            _ => None,
        });
        assert_eq!(settings.buckets.processed_bucket, "processed");
        assert_eq!(settings.buckets.stations_key, "stations.parquet");
        assert_eq!(settings.buckets.raw_bucket, "capital-bikeshare-public");
    }
}
