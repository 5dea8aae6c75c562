use super::ObjectStorage;
use async_trait::async_trait;
use common::Result;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use std::path::Path;
use std::sync::Arc;

/// `ObjectStorage` over any `object_store` backend (local disk, in-memory).
pub struct ObjectStoreStorage {
    bucket: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreStorage {
    pub fn new(bucket: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            bucket: bucket.to_string(),
            store,
        }
    }

    pub fn in_memory(bucket: &str) -> Self {
        Self::new(bucket, Arc::new(InMemory::new()))
    }

    /// Maps the bucket onto a directory below `root`, creating it if needed.
    pub fn local(root: &Path, bucket: &str) -> Result<Self> {
        let dir = root.join(bucket);
        std::fs::create_dir_all(&dir)?;
        let store = LocalFileSystem::new_with_prefix(&dir)?;
        Ok(Self::new(bucket, Arc::new(store)))
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreStorage {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        let payload = PutPayload::from(data.to_vec());
        self.store.put(&StorePath::from(key), payload).await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let result = self.store.get(&StorePath::from(key)).await?;
        Ok(result.bytes().await?.to_vec())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_matches('/');
        let prefix_path = (!prefix.is_empty()).then(|| StorePath::from(prefix));

        let objects: Vec<ObjectMeta> = self
            .store
            .list(prefix_path.as_ref())
            .try_collect()
            .await?;

        let mut keys: Vec<String> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn check_file_exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&StorePath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        match self.store.delete(&StorePath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
