use std::{
    fmt,
    ops::Range,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use super::{ObjectInfo, Storage, StorageResult};

/// Records every call made to the wrapped storage, optionally slowing down reads.
#[derive(Debug)]
pub struct LoggingStorage {
    backend: Arc<dyn Storage>,
    fetch_log: Mutex<Vec<(String, String)>>,
    read_delay: Option<Duration>,
}

impl LoggingStorage {
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        Self { backend, fetch_log: Mutex::new(Vec::new()), read_delay: None }
    }

    pub fn with_read_delay(backend: Arc<dyn Storage>, delay: Duration) -> Self {
        Self { read_delay: Some(delay), ..Self::new(backend) }
    }

    #[allow(clippy::expect_used)] // this implementation is intended for tests only
    pub fn fetch_operations(&self) -> Vec<(String, String)> {
        self.fetch_log.lock().expect("poison lock").clone()
    }

    /// Operations named `op`, by key.
    pub fn operations(&self, op: &str) -> Vec<String> {
        self.fetch_operations()
            .into_iter()
            .filter(|(name, _)| name == op)
            .map(|(_, key)| key)
            .collect()
    }

    #[allow(clippy::expect_used)] // this implementation is intended for tests only
    pub fn clear(&self) {
        self.fetch_log.lock().expect("poison lock").clear();
    }

    #[allow(clippy::expect_used)]
    fn log(&self, op: &str, bucket: &str, key: &str) {
        self.fetch_log.lock().expect("poison lock").push((op.to_string(), format!("{bucket}/{key}")));
    }
}

impl fmt::Display for LoggingStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoggingStorage(backend={})", self.backend)
    }
}

#[async_trait]
impl Storage for LoggingStorage {
    async fn get_bytes(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&Range<u64>>,
    ) -> StorageResult<Bytes> {
        self.log("get_bytes", bucket, key);
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        self.backend.get_bytes(bucket, key, range).await
    }

    async fn put_bytes(&self, bucket: &str, key: &str, bytes: Bytes) -> StorageResult<()> {
        self.log("put_bytes", bucket, key);
        self.backend.put_bytes(bucket, key, bytes).await
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        self.log("stat_object", bucket, key);
        self.backend.stat_object(bucket, key).await
    }

    async fn list_objects<'a>(
        &'a self,
        bucket: &str,
        prefix: &str,
    ) -> StorageResult<BoxStream<'a, StorageResult<ObjectInfo>>> {
        self.log("list_objects", bucket, prefix);
        self.backend.list_objects(bucket, prefix).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.log("delete_object", bucket, key);
        self.backend.delete_object(bucket, key).await
    }
}
