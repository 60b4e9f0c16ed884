#![allow(dead_code)]
use std::sync::Arc;

use bytes::Bytes;
use hsds::{
    ChunkStore, ChunkStoreConfig, ObjectId, Storage,
    array::DataType,
    config::S3Options,
    dataset::{DatasetDescriptor, Layout},
    new_s3_storage,
};
use tempfile::TempDir;

pub const BUCKET: &str = "hsdstest";

pub(crate) fn make_minio_integration_storage() -> Result<Arc<dyn Storage>, Box<dyn std::error::Error>>
{
    let storage = new_s3_storage(S3Options {
        region: Some("us-east-1".to_string()),
        endpoint_url: Some("http://localhost:9000".to_string()),
        allow_http: true,
        anonymous: false,
    })?;
    Ok(storage)
}

/// A chunk store over a fresh local file system root. Keep the `TempDir` alive.
pub(crate) fn local_store(config: ChunkStoreConfig) -> (ChunkStore, TempDir) {
    let dir = tempfile::tempdir().expect("cannot create temp dir");
    let storage = hsds::new_local_filesystem_storage(dir.path()).expect("cannot create storage");
    (ChunkStore::new(storage, config), dir)
}

pub(crate) async fn put(store: &ChunkStore, bucket: &str, key: &str, data: Vec<u8>) {
    store.storage().put_bytes(bucket, key, Bytes::from(data)).await.expect("cannot write object");
}

pub(crate) fn dataset_id() -> ObjectId {
    ObjectId::new_v1(hsds::ObjectKind::Dataset)
}

pub(crate) fn reference_dataset(dtype: DataType, shape: Vec<u64>, layout: Layout) -> DatasetDescriptor {
    let mut desc = DatasetDescriptor::chunked(dataset_id(), dtype, shape, layout.dims().to_vec());
    desc.layout = layout;
    desc
}

pub(crate) fn u32_bytes(values: impl IntoIterator<Item = u32>) -> Vec<u8> {
    values.into_iter().flat_map(|v| v.to_le_bytes()).collect()
}
