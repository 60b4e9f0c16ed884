#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
use std::collections::BTreeMap;

use hsds::{
    ChunkStoreConfig, DatasetDescriptor, ErrorCategory, Selection,
    array::{DataType, Field},
    codec::{Filter, compress},
    dataset::Layout,
};
use hsds_macros::tokio_test;
use pretty_assertions::assert_eq;

mod common;
use common::*;

#[tokio_test]
async fn test_contiguous_reference() {
    let (store, _dir) = local_store(ChunkStoreConfig::default());
    let mut file = vec![0xAAu8; 100];
    file.extend(u32_bytes(0..60));
    put(&store, "files", "data.bin", file).await;

    let layout = Layout::ContiguousRef {
        file_uri: "s3://files/data.bin".to_string(),
        offset: 100,
        size: 240,
        dims: vec![4, 6],
    };
    let desc = reference_dataset(DataType::UInt32, vec![10, 6], layout);
    let all = Selection::all(&desc.shape);
    // the last chunk runs past the data and is zero filled
    assert_eq!(store.read_hyperslab(&desc, BUCKET, &all).await.unwrap(), u32_bytes(0..60));

    let rows = Selection::parse("[3:9:5, 1:3]", &desc.shape).unwrap();
    assert_eq!(store.read_hyperslab(&desc, BUCKET, &rows).await.unwrap(), u32_bytes([19, 20, 49, 50]));

    let err = store.write_hyperslab(&desc, BUCKET, &rows, &u32_bytes([0; 4])).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::UnsupportedOperation);
}

#[tokio_test]
async fn test_unallocated_contiguous_reference_reads_fill() {
    let (store, _dir) = local_store(ChunkStoreConfig::default());
    let layout = Layout::ContiguousRef {
        file_uri: "files/empty.h5".to_string(),
        offset: 0,
        size: 0,
        dims: vec![5],
    };
    let desc = reference_dataset(DataType::UInt32, vec![10], layout).with_fill_value(u32_bytes([3]));
    let data = store.read_hyperslab(&desc, BUCKET, &Selection::all(&[10])).await.unwrap();
    assert_eq!(data, u32_bytes([3; 10]));
}

#[tokio_test]
async fn test_chunked_reference() {
    let (store, _dir) = local_store(ChunkStoreConfig::default());
    let compressed = compress(&u32_bytes([5, 6, 7, 8]), 9).unwrap();
    let mut file = vec![0u8; 64];
    file.extend(&compressed);
    put(&store, "files", "chunked.h5", file).await;

    let chunks = BTreeMap::from([
        ("0".to_string(), (64, compressed.len() as u64)),
        ("1".to_string(), (0, 0)),
    ]);
    let layout = Layout::ChunkedRef { file_uri: "s3://files/chunked.h5".to_string(), dims: vec![4], chunks };
    let desc = reference_dataset(DataType::UInt32, vec![12], layout)
        .with_filters(vec![Filter::Deflate { level: 9 }])
        .with_fill_value(u32_bytes([7]));

    // chunk 1 has a zero size entry and chunk 2 none at all
    let data = store.read_hyperslab(&desc, BUCKET, &Selection::all(&[12])).await.unwrap();
    assert_eq!(data, u32_bytes([5, 6, 7, 8, 7, 7, 7, 7, 7, 7, 7, 7]));

    let err = store.read_hyperslab(&desc, BUCKET, &Selection::all(&[12, 1])).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidSelection);
}

#[tokio_test]
async fn test_missing_referenced_file() {
    let (store, _dir) = local_store(ChunkStoreConfig::default());
    let chunks = BTreeMap::from([("0".to_string(), (0, 16))]);
    let layout = Layout::ChunkedRef { file_uri: "files/gone.h5".to_string(), dims: vec![4], chunks };
    let desc = reference_dataset(DataType::UInt32, vec![4], layout);
    let err = store.read_hyperslab(&desc, BUCKET, &Selection::all(&[4])).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);
}

const URI_LEN: usize = 24;

fn table_dtype() -> DataType {
    DataType::Compound(vec![
        Field { name: "offset".to_string(), dtype: DataType::UInt64 },
        Field { name: "size".to_string(), dtype: DataType::UInt32 },
        Field { name: "file_uri".to_string(), dtype: DataType::FixedString(URI_LEN) },
    ])
}

fn table_entry(offset: u64, size: u32, uri: &str) -> Vec<u8> {
    let mut entry = offset.to_le_bytes().to_vec();
    entry.extend(size.to_le_bytes());
    let mut uri = uri.as_bytes().to_vec();
    uri.resize(URI_LEN, 0);
    entry.extend(uri);
    entry
}

fn indirect_dataset(table: DatasetDescriptor) -> DatasetDescriptor {
    let layout = Layout::ChunkedRefIndirect {
        file_uri: Some("s3://files/refs.h5".to_string()),
        dims: vec![2],
        chunk_table: Box::new(table),
    };
    reference_dataset(DataType::UInt32, vec![8], layout).with_fill_value(u32_bytes([99]))
}

#[tokio_test]
async fn test_indirect_reference() {
    let (store, _dir) = local_store(ChunkStoreConfig::default());
    put(&store, "files", "refs.h5", u32_bytes([0, 1, 2, 3])).await;
    let mut other = vec![0u8; 16];
    other.extend(u32_bytes([10, 11]));
    put(&store, "other", "part.h5", other).await;

    // one element per chunk of the dataset
    let table = DatasetDescriptor::chunked(dataset_id(), table_dtype(), vec![4], vec![4]);
    let entries: Vec<u8> = [
        table_entry(0, 8, ""),
        table_entry(8, 8, ""),
        table_entry(0, 0, ""),
        table_entry(16, 8, "s3://other/part.h5"),
    ]
    .concat();
    store.write_hyperslab(&table, BUCKET, &Selection::all(&[4]), &entries).await.unwrap();
    assert_eq!(store.flush_all().await.unwrap(), 1);

    let desc = indirect_dataset(table);
    let data = store.read_hyperslab(&desc, BUCKET, &Selection::all(&[8])).await.unwrap();
    assert_eq!(data, u32_bytes([0, 1, 2, 3, 99, 99, 10, 11]));
    let points = store.read_point_selection(&desc, BUCKET, &[vec![7], vec![2]]).await.unwrap();
    assert_eq!(points, u32_bytes([11, 2]));
}

#[tokio_test]
async fn test_indirect_reference_without_table_entries() {
    let (store, _dir) = local_store(ChunkStoreConfig::default());
    // the index table was never written, so no chunk has a location
    let table = DatasetDescriptor::chunked(dataset_id(), table_dtype(), vec![4], vec![2]);
    let desc = indirect_dataset(table);
    let data = store.read_hyperslab(&desc, BUCKET, &Selection::all(&[8])).await.unwrap();
    assert_eq!(data, u32_bytes([99; 8]));
}

#[tokio_test]
async fn test_nested_chunk_table_is_rejected() {
    let (store, _dir) = local_store(ChunkStoreConfig::default());
    let table = DatasetDescriptor::chunked(dataset_id(), table_dtype(), vec![4], vec![4]);
    // the chunk table is itself a reference dataset
    let nested = indirect_dataset(indirect_dataset(table));
    let err = store.read_hyperslab(&nested, BUCKET, &Selection::all(&[8])).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::UnsupportedOperation);
}

#[tokio_test]
#[ignore = "needs a minio server on localhost:9000"]
async fn test_reference_on_minio() {
    let storage = make_minio_integration_storage().unwrap();
    let store = hsds::ChunkStore::new(storage, ChunkStoreConfig::default());
    put(&store, "testbucket", "refs/contiguous.bin", u32_bytes(0..8)).await;
    let layout = Layout::ContiguousRef {
        file_uri: "s3://testbucket/refs/contiguous.bin".to_string(),
        offset: 0,
        size: 32,
        dims: vec![8],
    };
    let desc = reference_dataset(DataType::UInt32, vec![8], layout);
    let data = store.read_hyperslab(&desc, "testbucket", &Selection::all(&[8])).await.unwrap();
    assert_eq!(data, u32_bytes(0..8));
}
