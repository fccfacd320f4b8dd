//! Object-store gateway for the persistent corpus.
//!
//! The corpus lives in an S3-compatible bucket as a single ZIP archive.
//! Credentials come from the ambient AWS environment (default provider
//! chain); path-style addressing is enabled so non-AWS providers work.
//!
//! A missing corpus object is not an error: the first cycle of a fresh
//! project starts from an empty corpus.

pub mod archive;

use std::path::Path;

use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;
use tracing::info;

pub use archive::ArchiveError;

/// Errors from corpus download/upload.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Downloading the corpus object failed (other than a missing key).
    #[error("downloading s3://{bucket}/{key}: {source}")]
    Download {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Uploading the corpus object failed.
    #[error("uploading s3://{bucket}/{key}: {source}")]
    Upload {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Reading or writing the local archive file failed.
    #[error("local corpus archive {path}: {source}")]
    Io {
        /// Local file path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Zipping or unzipping the corpus failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Client for the corpus bucket.
#[derive(Debug, Clone)]
pub struct CorpusStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl CorpusStore {
    /// Connects using the ambient AWS configuration, with path-style
    /// addressing enabled for non-AWS S3 providers.
    pub async fn connect(bucket: String) -> Self {
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let conf = aws_sdk_s3::config::Builder::from(&base)
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(conf),
            bucket,
        }
    }

    /// Builds a store around an already-configured S3 client.
    #[must_use]
    pub fn with_client(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Downloads the corpus object `key` to `dest`.
    ///
    /// Returns `true` when the object does not exist, in which case nothing
    /// is written and the caller proceeds with an empty corpus.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Download`] for any transport failure other
    /// than a missing key, and [`StorageError::Io`] when the local file
    /// cannot be written.
    pub async fn download(&self, key: &str, dest: &Path) -> Result<bool, StorageError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::get_object::GetObjectError::is_no_such_key)
                {
                    info!(
                        bucket = %self.bucket,
                        key,
                        "corpus object not found, starting with empty corpus"
                    );
                    return Ok(true);
                }
                return Err(StorageError::Download {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    source: Box::new(err),
                });
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Download {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                source: Box::new(err),
            })?
            .into_bytes();

        tokio::fs::write(dest, &data)
            .await
            .map_err(|source| StorageError::Io {
                path: dest.display().to_string(),
                source,
            })?;

        info!(
            bytes = data.len(),
            bucket = %self.bucket,
            key,
            dest = %dest.display(),
            "downloaded corpus object"
        );
        Ok(false)
    }

    /// Uploads `data` under `key` with the `application/zip` content type.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Upload`] when the PUT fails.
    pub async fn upload(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let bytes = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/zip")
            .content_length(bytes as i64)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|err| StorageError::Upload {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                source: Box::new(err),
            })?;

        info!(bucket = %self.bucket, key, bytes, "uploaded corpus object");
        Ok(())
    }
}
