use crate::storage::ObjectStorage;
use crate::utils::arrow::read_parquet;
use crate::utils::paths::{PartitionKey, parse_partition_key, partitions_from_keys};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use common::{Error, Result};
use futures::{Stream, StreamExt, stream};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// One decoded partition of the master table.
#[derive(Debug, Clone)]
pub struct Partition {
    pub key: PartitionKey,
    pub object_key: String,
    pub batches: Vec<RecordBatch>,
}

impl Partition {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

/// Walks the `year=/month=` layout under the master prefix.
#[derive(Clone)]
pub struct PartitionScanner {
    storage: Arc<dyn ObjectStorage>,
    prefix: String,
}

impl PartitionScanner {
    pub fn new(storage: Arc<dyn ObjectStorage>, prefix: &str) -> Self {
        Self {
            storage,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Partitions already materialized. Keys with malformed segments are skipped.
    pub async fn existing_partitions(&self) -> Result<BTreeSet<PartitionKey>> {
        let keys = self.storage.list_objects(&self.prefix).await?;
        let partitions = partitions_from_keys(&keys);
        debug!(prefix = %self.prefix, objects = keys.len(), partitions = partitions.len(), "Listed master table");
        Ok(partitions)
    }

    /// Parquet objects under the prefix paired with their partition, in key order.
    pub async fn partition_files(&self) -> Result<Vec<(PartitionKey, String)>> {
        let keys = self.storage.list_objects(&self.prefix).await?;
        Ok(keys
            .into_iter()
            .filter(|key| key.ends_with(".parquet"))
            .filter_map(|key| parse_partition_key(&key).map(|partition| (partition, key)))
            .collect())
    }

    /// Lazily reads partitions one at a time so a full-history scan never
    /// holds more than one partition in memory.
    pub async fn scan(&self) -> Result<impl Stream<Item = Result<Partition>> + Send + 'static> {
        let files = self.partition_files().await?;
        let storage = self.storage.clone();

        Ok(stream::iter(files).then(move |(key, object_key)| {
            let storage = storage.clone();
            async move {
                let data = storage.get_object(&object_key).await?;
                let (_, batches) = read_parquet(Bytes::from(data))?;
                Ok::<_, Error>(Partition {
                    key,
                    object_key,
                    batches,
                })
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::object::ObjectStoreStorage;
    use crate::utils::arrow::write_parquet;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    async fn seed(storage: &dyn ObjectStorage, key: &str, rows: i64) {
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from_iter_values(0..rows))],
        )
        .unwrap();
        let data = write_parquet(schema, &[batch], vec![]).unwrap();
        storage.put_object(key, &data).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_yields_partitions_in_order() {
        let storage: Arc<dyn ObjectStorage> = Arc::new(ObjectStoreStorage::in_memory("processed"));
        seed(storage.as_ref(), "master/trips/year=2019/month=02/part.parquet", 2).await;
        seed(storage.as_ref(), "master/trips/year=2018/month=11/part.parquet", 3).await;
        storage.put_object("master/trips/_SUCCESS", b"").await.unwrap();
        storage
            .put_object("master/trips/year=2019/month=xx/part.parquet", b"junk")
            .await
            .unwrap();

        let scanner = PartitionScanner::new(storage, "master/trips/");
        let partitions: Vec<Partition> = scanner
            .scan()
            .await
            .unwrap()
            .map(|p| p.unwrap())
            .collect()
            .await;

        let keys: Vec<PartitionKey> = partitions.iter().map(|p| p.key).collect();
        assert_eq!(keys, vec![PartitionKey::new(2018, 11), PartitionKey::new(2019, 2)]);
        assert_eq!(partitions[0].num_rows(), 3);
        assert_eq!(partitions[1].num_rows(), 2);
    }

    #[tokio::test]
    async fn test_existing_partitions_on_empty_store() {
        let storage: Arc<dyn ObjectStorage> = Arc::new(ObjectStoreStorage::in_memory("processed"));
        let scanner = PartitionScanner::new(storage, "master/trips");
        assert!(scanner.existing_partitions().await.unwrap().is_empty());
    }
}
