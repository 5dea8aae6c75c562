use super::{ObjectStorage, S3Manager};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use common::{Error, Result};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Maps SDK failures onto storage errors, keeping the service's error code when there is one.
fn storage_error<E, R>(action: &str, key: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + Debug,
    R: Debug,
{
    let detail = match &err {
        SdkError::ServiceError(service) => service
            .err()
            .message()
            .or(service.err().code())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", service.err())),
        other => format!("{:?}", other),
    };
    Error::Storage(format!("{} {} failed: {}", action, key, detail))
}

fn content_type(key: &str) -> &'static str {
    if key.ends_with(".parquet") {
        "application/vnd.apache.parquet"
    } else if key.ends_with(".csv") {
        "text/csv"
    } else {
        "application/octet-stream"
    }
}

/// `ObjectStorage` backed by one S3 (or S3-compatible) bucket.
pub struct S3Storage {
    bucket: String,
    client: Arc<S3Client>,
}

impl S3Storage {
    pub async fn new(s3_manager: Arc<S3Manager>, bucket: &str) -> Result<Self> {
        let client = s3_manager.get_client(bucket).await?;
        Ok(Self {
            bucket: bucket.to_string(),
            client,
        })
    }

    fn not_found(&self, key: &str) -> Error {
        Error::NotFound(format!("{} in bucket {}", key, self.bucket))
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type(key))
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| storage_error("PUT", key, e))?;

        debug!(bucket = %self.bucket, %key, bytes = data.len(), "Uploaded object");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => {
                return Err(self.not_found(key));
            }
            Err(e) => return Err(storage_error("GET", key, e)),
        };

        let body = response.body.collect().await?;
        Ok(body.into_bytes().to_vec())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut request = self.client.list_objects_v2().bucket(&self.bucket);
        // Directory semantics: `master/trips` must not match `master/trips_old/...`.
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            request = request.prefix(format!("{}/", prefix));
        }

        let mut keys = Vec::new();
        let mut pages = request.into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| storage_error("LIST", prefix, e))?;
            keys.extend(page.contents().iter().filter_map(|object| object.key().map(str::to_string)));
        }

        keys.sort();
        debug!(bucket = %self.bucket, %prefix, objects = keys.len(), "Listed objects");
        Ok(keys)
    }

    async fn check_file_exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => Ok(false),
            Err(e) => Err(storage_error("HEAD", key, e)),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("DELETE", key, e))?;

        debug!(bucket = %self.bucket, %key, "Deleted object");
        Ok(())
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
