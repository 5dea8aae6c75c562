use arrow::error::ArrowError;
use aws_sdk_s3::primitives::ByteStreamError;
use aws_smithy_runtime_api::client::result::CreateUnhandledError;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_runtime_api::http::Response;
use datafusion::error::DataFusionError;
use parquet::errors::ParquetError;
use thiserror::Error;
use url::ParseError;

pub mod config;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("S3 error: {0}")]
    S3(#[from] aws_sdk_s3::Error),

    #[error("AWS SDK error: {0}")]
    AwsSdk(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("ByteStream error: {0}")]
    ByteStream(#[from] ByteStreamError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("DataFusion error: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Schema validation error: {0}")]
    SchemaValidation(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Failed to process raw file {key}: {source}")]
    File {
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to write partition year={year:04}/month={month:02}: {source}")]
    Partition {
        year: i32,
        month: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Attaches the raw object key that was being processed.
    pub fn in_file(self, key: &str) -> Self {
        Error::File {
            key: key.to_string(),
            source: Box::new(self),
        }
    }

    pub fn in_partition(self, year: i32, month: u32) -> Self {
        Error::Partition {
            year,
            month,
            source: Box::new(self),
        }
    }

    /// True when the error is a missing-object condition rather than a transport failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

// Implement From for various SdkError types
impl<E: std::fmt::Debug + CreateUnhandledError> From<SdkError<E, Response>> for Error {
    fn from(err: SdkError<E, Response>) -> Self {
        Error::AwsSdk(format!("{:?}", err))
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            other => Error::Storage(format!("Object store error: {}", other)),
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::InvalidInput(format!("URL parse error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_context_wraps_source() {
        let err = Error::SchemaMismatch("no date columns".into()).in_file("raw/2015.csv");
        let msg = err.to_string();
        assert!(msg.contains("raw/2015.csv"));
        assert!(msg.contains("no date columns"));
    }

    #[test]
    fn test_not_found_detection() {
        let err: Error = object_store::Error::NotFound {
            path: "dimensions/stations.parquet".into(),
            source: "missing".into(),
        }
        .into();
        assert!(err.is_not_found());
        assert!(matches!(&err, Error::NotFound(path) if path == "dimensions/stations.parquet"));
        assert!(!Error::Storage("object not found upstream".into()).is_not_found());
    }
}
