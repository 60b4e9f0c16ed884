//! Object storage access, addressed by bucket and key.
use core::fmt;
use std::{ops::Range, path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{TryStreamExt, stream::BoxStream};
use thiserror::Error;

use crate::{
    config::{S3Options, StorageConfig},
    error::{ErrorCategory, HsdsError},
};

#[cfg(test)]
pub mod logging;

pub mod object_store;

pub use object_store::ObjectStorage;

#[derive(Debug, Error)]
pub enum StorageErrorKind {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("access denied to object `{key}` in bucket `{bucket}`")]
    AccessDenied { bucket: String, key: String },
    #[error("invalid bucket name `{0}`")]
    BadBucket(String),
    #[error("object store error {0}")]
    ObjectStore(#[from] Box<::object_store::Error>),
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StorageErrorKind::NotFound { .. } => ErrorCategory::NotFound,
            StorageErrorKind::AccessDenied { .. } => ErrorCategory::AccessDenied,
            StorageErrorKind::BadBucket(_) => ErrorCategory::InvalidIdentifier,
            StorageErrorKind::ObjectStore(_)
            | StorageErrorKind::IOError(_)
            | StorageErrorKind::Other(_) => ErrorCategory::Internal,
        }
    }
}

pub type StorageError = HsdsError<StorageErrorKind>;

// it would be great to define this impl in error.rs, but it conflicts with the blanket
// `impl From<T> for T`
impl<E> From<E> for StorageError
where
    E: Into<StorageErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type StorageResult<A> = Result<A, StorageError>;

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, StorageErrorKind::NotFound { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// Read and write opaque objects in buckets.
///
/// Missing objects are reported as [`StorageErrorKind::NotFound`] and permission failures as
/// [`StorageErrorKind::AccessDenied`], whatever the backend.
#[async_trait]
pub trait Storage: fmt::Debug + fmt::Display + Sync + Send {
    /// The whole object, or the bytes in `range`. A range running past the end of the
    /// object returns the bytes that exist.
    async fn get_bytes(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&Range<u64>>,
    ) -> StorageResult<Bytes>;

    async fn put_bytes(&self, bucket: &str, key: &str, bytes: Bytes) -> StorageResult<()>;

    async fn stat_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo>;

    /// Objects whose key starts with `prefix`.
    async fn list_objects<'a>(
        &'a self,
        bucket: &str,
        prefix: &str,
    ) -> StorageResult<BoxStream<'a, StorageResult<ObjectInfo>>>;

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()>;

    async fn list_keys(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        self.list_objects(bucket, prefix).await?.map_ok(|info| info.key).try_collect().await
    }
}

pub fn new_in_memory_storage() -> StorageResult<Arc<dyn Storage>> {
    Ok(Arc::new(ObjectStorage::new_in_memory()))
}

pub fn new_local_filesystem_storage(root: &Path) -> StorageResult<Arc<dyn Storage>> {
    Ok(Arc::new(ObjectStorage::new_local_filesystem(root)?))
}

pub fn new_s3_storage(options: S3Options) -> StorageResult<Arc<dyn Storage>> {
    Ok(Arc::new(ObjectStorage::new_s3(options)))
}

pub fn storage_from_config(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match config {
        StorageConfig::InMemory => new_in_memory_storage(),
        StorageConfig::LocalFileSystem(root) => new_local_filesystem_storage(root),
        StorageConfig::S3(options) => new_s3_storage(options.clone()),
    }
}
