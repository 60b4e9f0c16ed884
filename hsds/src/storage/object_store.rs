use core::fmt;
use std::{fs::create_dir_all, ops::Range, path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use object_store::{
    GetOptions, ObjectMeta, ObjectStore, PutPayload, aws::AmazonS3Builder,
    local::LocalFileSystem, memory::InMemory, path::Path as ObjectPath,
};
use quick_cache::sync::Cache;
use tracing::{debug, instrument};

use super::{ObjectInfo, Storage, StorageError, StorageErrorKind, StorageResult};
use crate::config::S3Options;

type BucketName = String;

#[derive(Debug)]
enum Backend {
    /// A single store holding every bucket as a top level directory.
    Shared { store: Arc<dyn ObjectStore>, description: String },
    /// One S3 client per bucket, created on first use.
    S3 { options: S3Options, clients: Cache<BucketName, Arc<dyn ObjectStore>> },
}

#[derive(Debug)]
pub struct ObjectStorage {
    backend: Backend,
}

fn new_client_cache() -> Cache<BucketName, Arc<dyn ObjectStore>> {
    // TODO: configurable
    Cache::new(50)
}

fn check_bucket(bucket: &str) -> StorageResult<()> {
    if bucket.is_empty() || bucket.contains('/') {
        return Err(StorageErrorKind::BadBucket(bucket.to_string()).into());
    }
    Ok(())
}

fn translate_error(err: object_store::Error, bucket: &str, key: &str) -> StorageError {
    let (bucket, key) = (bucket.to_string(), key.to_string());
    match err {
        object_store::Error::NotFound { .. } => StorageErrorKind::NotFound { bucket, key }.into(),
        object_store::Error::PermissionDenied { .. }
        | object_store::Error::Unauthenticated { .. } => {
            StorageErrorKind::AccessDenied { bucket, key }.into()
        }
        other => StorageErrorKind::ObjectStore(Box::new(other)).into(),
    }
}

impl ObjectStorage {
    pub fn new_in_memory() -> ObjectStorage {
        let backend =
            Backend::Shared { store: Arc::new(InMemory::new()), description: "memory".into() };
        ObjectStorage { backend }
    }

    /// Buckets are directories under `root`, which is created if missing.
    pub fn new_local_filesystem(root: &Path) -> StorageResult<ObjectStorage> {
        create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| StorageErrorKind::ObjectStore(Box::new(e)))?;
        let backend = Backend::Shared {
            store: Arc::new(store),
            description: format!("file://{}", root.display()),
        };
        Ok(ObjectStorage { backend })
    }

    pub fn new_s3(options: S3Options) -> ObjectStorage {
        ObjectStorage { backend: Backend::S3 { options, clients: new_client_cache() } }
    }

    fn mk_s3_client(options: &S3Options, bucket: &str) -> StorageResult<Arc<dyn ObjectStore>> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_allow_http(options.allow_http)
            .with_skip_signature(options.anonymous);
        if let Some(region) = options.region.as_ref() {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = options.endpoint_url.as_ref() {
            builder = builder.with_endpoint(endpoint);
        }
        let store = builder.build().map_err(|e| StorageErrorKind::ObjectStore(Box::new(e)))?;
        Ok(Arc::new(store))
    }

    /// The store holding `bucket` and the path of `key` inside it.
    async fn locate(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Arc<dyn ObjectStore>, ObjectPath)> {
        check_bucket(bucket)?;
        match &self.backend {
            Backend::Shared { store, .. } => {
                Ok((Arc::clone(store), ObjectPath::from(format!("{bucket}/{key}"))))
            }
            Backend::S3 { options, clients } => {
                let client = match clients.get_value_or_guard_async(bucket).await {
                    Ok(client) => client,
                    Err(guard) => {
                        debug!(bucket, "creating s3 client");
                        let client = Self::mk_s3_client(options, bucket)?;
                        let _fail_is_ok = guard.insert(Arc::clone(&client));
                        client
                    }
                };
                Ok((client, ObjectPath::from(key)))
            }
        }
    }

    /// Key of `location` relative to its bucket.
    fn key_of(&self, location: &ObjectPath) -> String {
        match &self.backend {
            Backend::Shared { .. } => {
                let full = location.as_ref();
                full.split_once('/').map(|(_, key)| key.to_string()).unwrap_or_default()
            }
            Backend::S3 { .. } => location.to_string(),
        }
    }

    fn object_info(&self, meta: ObjectMeta) -> ObjectInfo {
        ObjectInfo {
            key: self.key_of(&meta.location),
            size: meta.size,
            etag: meta.e_tag,
            last_modified: meta.last_modified,
        }
    }
}

impl fmt::Display for ObjectStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backend {
            Backend::Shared { description, .. } => {
                write!(f, "ObjectStorage(backend={description})")
            }
            Backend::S3 { options, .. } => write!(
                f,
                "ObjectStorage(backend=s3, endpoint={})",
                options.endpoint_url.as_deref().unwrap_or("default")
            ),
        }
    }
}

#[async_trait]
impl Storage for ObjectStorage {
    #[instrument(skip(self))]
    async fn get_bytes(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&Range<u64>>,
    ) -> StorageResult<Bytes> {
        let (store, path) = self.locate(bucket, key).await?;
        let options = GetOptions { range: range.cloned().map(Into::into), ..Default::default() };
        let result =
            store.get_opts(&path, options).await.map_err(|e| translate_error(e, bucket, key))?;
        result.bytes().await.map_err(|e| translate_error(e, bucket, key))
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn put_bytes(&self, bucket: &str, key: &str, bytes: Bytes) -> StorageResult<()> {
        let (store, path) = self.locate(bucket, key).await?;
        store
            .put(&path, PutPayload::from_bytes(bytes))
            .await
            .map_err(|e| translate_error(e, bucket, key))?;
        Ok(())
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        let (store, path) = self.locate(bucket, key).await?;
        let meta = store.head(&path).await.map_err(|e| translate_error(e, bucket, key))?;
        Ok(self.object_info(meta))
    }

    async fn list_objects<'a>(
        &'a self,
        bucket: &str,
        prefix: &str,
    ) -> StorageResult<BoxStream<'a, StorageResult<ObjectInfo>>> {
        // object_store lists whole path segments, so list the enclosing directory and
        // filter on the full prefix
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let (store, dir_path) = self.locate(bucket, dir).await?;
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();
        let stream = store
            .list(Some(&dir_path))
            .map_err(move |e| translate_error(e, &bucket, ""))
            .map_ok(|meta| self.object_info(meta))
            .try_filter(move |info| futures::future::ready(info.key.starts_with(&prefix)))
            .boxed();
        Ok(stream)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let (store, path) = self.locate(bucket, key).await?;
        store.delete(&path).await.map_err(|e| translate_error(e, bucket, key))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::ErrorCategory;

    async fn exercise(storage: &ObjectStorage) {
        let key = "db/1e3ffc6a-21d14d4c/d/96b7-4e94c2-a1d65e/0_0";
        storage.put_bytes("hsdstest", key, Bytes::from_static(b"0123456789")).await.unwrap();
        storage.put_bytes("hsdstest", "db/1e3ffc6a-21d14d4c/.group.json", Bytes::new()).await.unwrap();
        storage.put_bytes("other", key, Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(storage.get_bytes("hsdstest", key, None).await.unwrap(), &b"0123456789"[..]);
        assert_eq!(storage.get_bytes("hsdstest", key, Some(&(2..5))).await.unwrap(), &b"234"[..]);
        // ranges past the end are truncated
        assert_eq!(storage.get_bytes("hsdstest", key, Some(&(8..20))).await.unwrap(), &b"89"[..]);

        let info = storage.stat_object("hsdstest", key).await.unwrap();
        assert_eq!(info.size, 10);
        assert_eq!(info.key, key);

        let mut keys = storage.list_keys("hsdstest", "db/1e3ffc6a-21d1").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["db/1e3ffc6a-21d14d4c/.group.json".to_string(), key.to_string()]);
        assert_eq!(storage.list_keys("hsdstest", "db/1e3ffc6a-21d14d4c/d/").await.unwrap(), vec![key.to_string()]);

        storage.delete_object("hsdstest", key).await.unwrap();
        let err = storage.get_bytes("hsdstest", key, None).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.kind.category(), ErrorCategory::NotFound);
        // buckets are isolated from each other
        assert_eq!(storage.get_bytes("other", key, None).await.unwrap(), &b"x"[..]);

        let err = storage.get_bytes("bad/bucket", key, None).await.unwrap_err();
        assert!(matches!(err.kind, StorageErrorKind::BadBucket(_)));
    }

    #[tokio::test]
    async fn test_in_memory_storage() {
        exercise(&ObjectStorage::new_in_memory()).await;
    }

    #[tokio::test]
    async fn test_local_filesystem_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ObjectStorage::new_local_filesystem(dir.path()).unwrap();
        exercise(&storage).await;
        assert!(storage.to_string().starts_with("ObjectStorage(backend=file://"));
    }
}
