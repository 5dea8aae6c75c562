pub mod object;
pub mod s3;

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use common::Result;
use common::config::{Settings, StorageBackend};
use datafusion::execution::context::SessionContext;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use object::ObjectStoreStorage;
use s3::S3Storage;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;
    /// Lists every key under `prefix`, sorted.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
    async fn check_file_exists(&self, key: &str) -> Result<bool>;
    /// Removes `key`; deleting an absent key succeeds.
    async fn delete_object(&self, key: &str) -> Result<()>;
    fn bucket(&self) -> &str;
}

#[derive(Clone)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl S3Config {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            endpoint: settings.storage.endpoint.clone(),
            region: settings.storage.region.clone(),
            access_key: settings.storage.access_key.clone(),
            secret_key: settings.storage.secret_key.clone(),
        }
    }
}

#[derive(Clone)]
pub struct S3Manager {
    pub config: S3Config,
    client_cache: Arc<dashmap::DashMap<String, Arc<S3Client>>>,
    object_store_cache: Arc<dashmap::DashMap<String, Arc<object_store::aws::AmazonS3>>>,
}

impl S3Manager {
    pub fn new(config: S3Config) -> Self {
        Self {
            config,
            client_cache: Arc::new(dashmap::DashMap::new()),
            object_store_cache: Arc::new(dashmap::DashMap::new()),
        }
    }

    pub async fn get_client(&self, bucket: &str) -> Result<Arc<S3Client>> {
        if let Some(client) = self.client_cache.get(bucket) {
            return Ok(client.clone());
        }

        let region = Region::new(self.config.region.clone());
        let mut builder = match (&self.config.access_key, &self.config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "static");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region.clone())
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        builder = builder.region(region);
        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = Arc::new(aws_sdk_s3::Client::from_conf(builder.build()));
        self.client_cache.insert(bucket.to_string(), client.clone());
        Ok(client)
    }

    pub async fn get_object_store(&self, bucket: &str) -> Result<Arc<object_store::aws::AmazonS3>> {
        if let Some(store) = self.object_store_cache.get(bucket) {
            return Ok(store.clone());
        }

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(&self.config.region);

        if let (Some(access_key), Some(secret_key)) =
            (&self.config.access_key, &self.config.secret_key)
        {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
        }

        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }

        let store = Arc::new(builder.build()?);
        self.object_store_cache
            .insert(bucket.to_string(), store.clone());
        Ok(store)
    }

    /// Verifies that a bucket exists and is accessible
    pub async fn verify_bucket_exists(&self, bucket: &str) -> Result<()> {
        let client = self.get_client(bucket).await?;

        match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) => Err(common::Error::Storage(format!(
                "Cannot access bucket '{}': {}",
                bucket, e
            ))),
        }
    }
}

/// An object store registered with DataFusion under a fixed URL so SQL can
/// scan the processed bucket directly.
#[derive(Clone)]
pub struct TableStore {
    pub url: Url,
    pub store: Arc<dyn ObjectStore>,
}

impl TableStore {
    pub fn new(url: Url, store: Arc<dyn ObjectStore>) -> Self {
        Self { url, store }
    }

    pub fn register(&self, ctx: &SessionContext) {
        ctx.register_object_store(&self.url, self.store.clone());
    }

    /// URL of a directory-like prefix inside the store, with trailing slash.
    pub fn prefix_url(&self, prefix: &str) -> String {
        format!(
            "{}/{}/",
            self.url.as_str().trim_end_matches('/'),
            prefix.trim_matches('/')
        )
    }

    pub fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.url.as_str().trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }
}

#[derive(Clone)]
pub struct StorageConfig {
    pub raw: Arc<dyn ObjectStorage>,
    pub processed: Arc<dyn ObjectStorage>,
    pub processed_table: TableStore,
}

impl StorageConfig {
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let raw_bucket = &settings.buckets.raw_bucket;
        let processed_bucket = &settings.buckets.processed_bucket;

        debug!(backend = ?settings.storage.backend, %raw_bucket, %processed_bucket, "Configuring storage");

        match settings.storage.backend {
            StorageBackend::S3 => {
                let s3_manager = Arc::new(S3Manager::new(S3Config::from_settings(settings)));
                s3_manager.verify_bucket_exists(processed_bucket).await?;
                let store = s3_manager.get_object_store(processed_bucket).await?;
                let url = Url::parse(&format!("s3://{}", processed_bucket))?;

                Ok(Self {
                    raw: Arc::new(S3Storage::new(s3_manager.clone(), raw_bucket).await?),
                    processed: Arc::new(S3Storage::new(s3_manager.clone(), processed_bucket).await?),
                    processed_table: TableStore::new(url, store),
                })
            }
            StorageBackend::Local => {
                let root = Path::new(&settings.storage.local_root);
                let raw = ObjectStoreStorage::local(root, raw_bucket)?;
                let processed = ObjectStoreStorage::local(root, processed_bucket)?;
                let url = Url::parse(&format!("local://{}", processed_bucket))?;
                let table = TableStore::new(url, processed.store());

                Ok(Self {
                    raw: Arc::new(raw),
                    processed: Arc::new(processed),
                    processed_table: table,
                })
            }
            StorageBackend::Memory => {
                Self::in_memory(raw_bucket, processed_bucket)
            }
        }
    }

    pub fn in_memory(raw_bucket: &str, processed_bucket: &str) -> Result<Self> {
        let raw = ObjectStoreStorage::in_memory(raw_bucket);
        let processed = ObjectStoreStorage::in_memory(processed_bucket);
        let url = Url::parse(&format!("memory://{}", processed_bucket))?;
        let table = TableStore::new(url, processed.store());

        Ok(Self {
            raw: Arc::new(raw),
            processed: Arc::new(processed),
            processed_table: table,
        })
    }
}
