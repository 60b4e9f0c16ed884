//! Dataset level reads and writes, split into chunk operations on a [`ChunkStore`].
//!
//! Selections here are in dataset coordinates. Every chunk a selection touches is read or
//! written concurrently, and the per-chunk bytes are scattered into (or gathered from) the
//! row-major buffer of the whole selection.
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use tracing::{debug, instrument};

use crate::{
    array::{ArrayErrorKind, Row, RowPredicate, buffer_len},
    chunk_store::{ChunkStore, ChunkStoreErrorKind, ChunkStoreResult, QueryResult, UpdateResult},
    dataset::DatasetDescriptor,
    format::{ChunkIndices, ObjectId},
    layout::{chunk_indices, chunk_local_selection, chunks_for_points, data_coverage},
    selection::{Selection, check_points, flat_index},
};

const CHUNK_CONCURRENCY: usize = 16;

/// One chunk's share of a hyperslab.
#[derive(Debug)]
struct ChunkPart {
    id: ObjectId,
    /// Selected elements, in chunk coordinates
    local: Selection,
    /// Where those elements go in the selection-shaped buffer
    coverage: Selection,
}

fn item_size(desc: &DatasetDescriptor) -> ChunkStoreResult<usize> {
    desc.item_size().ok_or_else(|| ChunkStoreErrorKind::Array(ArrayErrorKind::VariableLength).into())
}

/// Bytes of `selection`'s elements.
fn selection_len(selection: &Selection, item_size: usize) -> ChunkStoreResult<usize> {
    let shape = selection.shape();
    buffer_len(&shape, item_size)
        .ok_or_else(|| ChunkStoreErrorKind::Array(ArrayErrorKind::TooLarge(shape)).into())
}

fn check_len(expected: usize, data: &[u8]) -> ChunkStoreResult<()> {
    if data.len() != expected {
        return Err(ChunkStoreErrorKind::Array(ArrayErrorKind::BufferSize {
            expected,
            actual: data.len(),
        })
        .into());
    }
    Ok(())
}

fn hyperslab_parts(
    desc: &DatasetDescriptor,
    selection: &Selection,
) -> ChunkStoreResult<Vec<ChunkPart>> {
    selection.check_within(&desc.shape)?;
    let chunk_shape = desc.chunk_shape();
    let mut parts = Vec::new();
    for coord in chunk_indices(selection, chunk_shape)? {
        let (Some(local), Some(coverage)) = (
            chunk_local_selection(&coord, selection, chunk_shape),
            data_coverage(&coord, selection, chunk_shape),
        ) else {
            continue;
        };
        parts.push(ChunkPart { id: desc.chunk_id(coord)?, local, coverage });
    }
    Ok(parts)
}

/// Byte offsets in the selection-shaped buffer of every element `coverage` selects.
fn coverage_offsets<'a>(
    coverage: &'a Selection,
    selection_shape: &'a [u64],
    item_size: usize,
) -> impl Iterator<Item = usize> + 'a {
    coverage
        .positions()
        .map(move |position| flat_index(selection_shape, &position) as usize * item_size)
}

fn local_points(
    coord: &ChunkIndices,
    chunk_shape: &[u64],
    points: &[Vec<u64>],
    members: &[usize],
) -> Vec<Vec<u64>> {
    let origin = coord.origin(chunk_shape);
    members
        .iter()
        .map(|i| points[*i].iter().zip(&origin).map(|(p, o)| p - o).collect())
        .collect()
}

impl ChunkStore {
    /// Row-major bytes of `selection` over the whole dataset.
    #[instrument(skip(self, desc), fields(dataset = %desc.id, %selection))]
    pub async fn read_hyperslab(
        &self,
        desc: &DatasetDescriptor,
        bucket: &str,
        selection: &Selection,
    ) -> ChunkStoreResult<Bytes> {
        let item_size = item_size(desc)?;
        let parts = hyperslab_parts(desc, selection)?;
        debug!(chunks = parts.len(), "reading hyperslab");
        let chunks: Vec<(Selection, Bytes)> = stream::iter(parts)
            .map(|part| async move {
                let data = self.read_selection(&part.id, desc, bucket, &part.local).await?;
                ChunkStoreResult::Ok((part.coverage, data))
            })
            .buffer_unordered(CHUNK_CONCURRENCY)
            .try_collect()
            .await?;

        let shape = selection.shape();
        let mut out = vec![0u8; selection_len(selection, item_size)?];
        for (coverage, data) in chunks {
            for (offset, element) in
                coverage_offsets(&coverage, &shape, item_size).zip(data.chunks_exact(item_size))
            {
                out[offset..offset + item_size].copy_from_slice(element);
            }
        }
        Ok(Bytes::from(out))
    }

    /// Write row-major `data` to `selection` over the whole dataset.
    #[instrument(skip(self, desc, data), fields(dataset = %desc.id, %selection, len = data.len()))]
    pub async fn write_hyperslab(
        &self,
        desc: &DatasetDescriptor,
        bucket: &str,
        selection: &Selection,
        data: &[u8],
    ) -> ChunkStoreResult<()> {
        let item_size = item_size(desc)?;
        check_len(selection_len(selection, item_size)?, data)?;
        let parts = hyperslab_parts(desc, selection)?;
        debug!(chunks = parts.len(), "writing hyperslab");
        let shape = selection.shape();
        stream::iter(parts)
            .map(|part| {
                let chunk_data: Vec<u8> = coverage_offsets(&part.coverage, &shape, item_size)
                    .flat_map(|offset| &data[offset..offset + item_size])
                    .copied()
                    .collect();
                async move {
                    self.write_selection(&part.id, desc, bucket, &part.local, &chunk_data).await
                }
            })
            .buffer_unordered(CHUNK_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    /// Bytes of each point, in the order given.
    #[instrument(skip(self, desc, points), fields(dataset = %desc.id, count = points.len()))]
    pub async fn read_point_selection(
        &self,
        desc: &DatasetDescriptor,
        bucket: &str,
        points: &[Vec<u64>],
    ) -> ChunkStoreResult<Bytes> {
        let item_size = item_size(desc)?;
        check_points(points, &desc.shape)?;
        let chunk_shape = desc.chunk_shape();
        let groups = chunks_for_points(points, chunk_shape);
        let chunks: Vec<(Vec<usize>, Bytes)> = stream::iter(groups)
            .map(|(coord, members)| async move {
                let local = local_points(&coord, chunk_shape, points, &members);
                let id = desc.chunk_id(coord)?;
                let data = self.read_points(&id, desc, bucket, &local).await?;
                ChunkStoreResult::Ok((members, data))
            })
            .buffer_unordered(CHUNK_CONCURRENCY)
            .try_collect()
            .await?;

        let mut out = vec![0u8; points.len() * item_size];
        for (members, data) in chunks {
            for (i, element) in members.into_iter().zip(data.chunks_exact(item_size)) {
                out[i * item_size..(i + 1) * item_size].copy_from_slice(element);
            }
        }
        Ok(Bytes::from(out))
    }

    /// Write one element per point. A point listed twice gets its last value.
    #[instrument(skip(self, desc, points, data), fields(dataset = %desc.id, count = points.len()))]
    pub async fn write_point_selection(
        &self,
        desc: &DatasetDescriptor,
        bucket: &str,
        points: &[Vec<u64>],
        data: &[u8],
    ) -> ChunkStoreResult<()> {
        let item_size = item_size(desc)?;
        check_points(points, &desc.shape)?;
        check_len(points.len() * item_size, data)?;
        let chunk_shape = desc.chunk_shape();
        stream::iter(chunks_for_points(points, chunk_shape))
            .map(|(coord, members)| async move {
                let local = local_points(&coord, chunk_shape, points, &members);
                let chunk_data: Vec<u8> = members
                    .iter()
                    .flat_map(|i| &data[i * item_size..(i + 1) * item_size])
                    .copied()
                    .collect();
                let id = desc.chunk_id(coord)?;
                self.write_points(&id, desc, bucket, &local, &chunk_data).await
            })
            .buffer_unordered(CHUNK_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    /// Rows of a one dimensional dataset passing `predicate`, in index order.
    #[instrument(skip(self, desc, predicate), fields(dataset = %desc.id, %selection))]
    pub async fn query_dataset(
        &self,
        desc: &DatasetDescriptor,
        bucket: &str,
        selection: &Selection,
        predicate: &dyn RowPredicate,
        limit: Option<usize>,
    ) -> ChunkStoreResult<QueryResult> {
        if desc.rank() != 1 {
            return Err(ChunkStoreErrorKind::QueryRank(desc.rank()).into());
        }
        let mut result = QueryResult::default();
        // chunk by chunk, so the limit applies in index order
        for part in hyperslab_parts(desc, selection)? {
            let remaining = limit.map(|limit| limit - result.indices.len());
            if remaining == Some(0) {
                break;
            }
            let found = self.query(&part.id, desc, bucket, &part.local, predicate, remaining).await?;
            result.indices.extend(found.indices);
            result.rows.extend(found.rows);
        }
        Ok(result)
    }

    /// Apply `values` to the rows of a one dimensional dataset passing `predicate`.
    #[instrument(skip(self, desc, predicate, values), fields(dataset = %desc.id, %selection))]
    pub async fn update_dataset(
        &self,
        desc: &DatasetDescriptor,
        bucket: &str,
        selection: &Selection,
        predicate: &dyn RowPredicate,
        values: &Row,
        limit: Option<usize>,
    ) -> ChunkStoreResult<UpdateResult> {
        if desc.rank() != 1 {
            return Err(ChunkStoreErrorKind::QueryRank(desc.rank()).into());
        }
        let mut result = UpdateResult::default();
        for part in hyperslab_parts(desc, selection)? {
            let remaining = limit.map(|limit| limit - result.indices.len());
            if remaining == Some(0) {
                break;
            }
            let updated = self
                .update_where(&part.id, desc, bucket, &part.local, predicate, values, remaining)
                .await?;
            result.indices.extend(updated.indices);
            result.before.extend(updated.before);
            result.after.extend(updated.after);
        }
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_strategy::proptest;

    use super::*;
    use crate::{
        array::{DataType, Scalar, VALUE_FIELD},
        config::ChunkStoreConfig,
        dataset::ChunkInitializer,
        error::ErrorCategory,
        selection::SliceDim,
        storage::new_in_memory_storage,
        strategies::selections_with_chunks,
    };

    const BUCKET: &str = "hsdstest";

    fn store() -> ChunkStore {
        ChunkStore::new(new_in_memory_storage().unwrap(), ChunkStoreConfig::default())
    }

    fn dataset(shape: Vec<u64>, chunks: Vec<u64>) -> DatasetDescriptor {
        DatasetDescriptor::chunked(
            "d-7e1e5a6c-8c4e-11e8-a1d4-0242ac120006".parse().unwrap(),
            DataType::UInt16,
            shape,
            chunks,
        )
    }

    fn u16_bytes(values: impl IntoIterator<Item = u16>) -> Vec<u8> {
        values.into_iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[tokio::test]
    async fn test_hyperslab_across_chunks() {
        let store = store();
        let desc = dataset(vec![10, 10], vec![4, 3]);
        let all = Selection::all(&desc.shape);
        store.write_hyperslab(&desc, BUCKET, &all, &u16_bytes(0..100)).await.unwrap();
        // 3 x 4 chunks
        assert_eq!(store.stats().entries, 12);
        assert_eq!(store.read_hyperslab(&desc, BUCKET, &all).await.unwrap(), u16_bytes(0..100));

        let sel = Selection(vec![SliceDim::new(1, 9, 3), SliceDim::new(2, 10, 4)]);
        let expected: Vec<u16> =
            [1u16, 4, 7].iter().flat_map(|r| [2u16, 6].map(|c| r * 10 + c)).collect();
        assert_eq!(store.read_hyperslab(&desc, BUCKET, &sel).await.unwrap(), u16_bytes(expected));

        // persisted chunks read back through a fresh cache
        assert_eq!(store.flush_all().await.unwrap(), 12);
        let fresh = ChunkStore::new(Arc::clone(store.storage()), ChunkStoreConfig::default());
        assert_eq!(fresh.read_hyperslab(&desc, BUCKET, &all).await.unwrap(), u16_bytes(0..100));
    }

    #[tokio::test]
    async fn test_unwritten_regions_read_fill_value() {
        let store = store();
        let desc = dataset(vec![20], vec![5]).with_fill_value(u16_bytes([9]));
        let sel = Selection(vec![SliceDim::new(3, 8, 1)]);
        store.write_hyperslab(&desc, BUCKET, &sel, &u16_bytes(3..8)).await.unwrap();
        let read = store.read_hyperslab(&desc, BUCKET, &Selection::all(&[20])).await.unwrap();
        let mut expected = vec![9u16; 20];
        expected[3..8].copy_from_slice(&[3, 4, 5, 6, 7]);
        assert_eq!(read, u16_bytes(expected));
    }

    #[tokio::test]
    async fn test_initializer_across_chunks() {
        let store = store();
        let desc = dataset(vec![20], vec![6])
            .with_initializer(ChunkInitializer::Arange { start: 100.0, step: 3.0 });
        let all = Selection::all(&[20]);
        let read = store.read_hyperslab(&desc, BUCKET, &all).await.unwrap();
        assert_eq!(read, u16_bytes((0..20).map(|i| 100 + 3 * i)));
        assert!(store.dirty_ids().is_empty());
    }

    #[tokio::test]
    async fn test_point_selection() {
        let store = store();
        let desc = dataset(vec![6, 6], vec![4, 4]);
        let points = vec![vec![5, 5], vec![0, 1], vec![4, 0], vec![0, 2]];
        store.write_point_selection(&desc, BUCKET, &points, &u16_bytes([1, 2, 3, 4])).await.unwrap();
        assert_eq!(store.dirty_ids().len(), 3);
        let read =
            store.read_point_selection(&desc, BUCKET, &[vec![0, 2], vec![5, 5], vec![3, 3]]).await.unwrap();
        assert_eq!(read, u16_bytes([4, 1, 0]));

        let err = store.read_point_selection(&desc, BUCKET, &[vec![6, 0]]).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidSelection);
        let err = store.write_point_selection(&desc, BUCKET, &points, &[0u8; 3]).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidSelection);
    }

    #[tokio::test]
    async fn test_query_dataset_in_index_order() {
        let store = store();
        let desc = dataset(vec![30], vec![7]);
        let all = Selection::all(&desc.shape);
        store.write_hyperslab(&desc, BUCKET, &all, &u16_bytes((0..30).map(|v| v % 10))).await.unwrap();

        let is_three = |row: &Row| row.get(VALUE_FIELD) == Some(&Scalar::UInt(3));
        let found = store.query_dataset(&desc, BUCKET, &all, &is_three, None).await.unwrap();
        assert_eq!(found.indices, vec![3, 13, 23]);
        let found = store.query_dataset(&desc, BUCKET, &all, &is_three, Some(2)).await.unwrap();
        assert_eq!(found.indices, vec![3, 13]);

        let values = Row::from([(VALUE_FIELD.to_string(), Scalar::UInt(300))]);
        let updated =
            store.update_dataset(&desc, BUCKET, &all, &is_three, &values, None).await.unwrap();
        assert_eq!(updated.indices, vec![3, 13, 23]);
        let read = store.read_point_selection(&desc, BUCKET, &[vec![13]]).await.unwrap();
        assert_eq!(read, u16_bytes([300]));
    }

    #[proptest(async = "tokio", cases = 32)]
    async fn test_write_then_read_hyperslab(
        #[strategy(selections_with_chunks())] case: (Vec<u64>, Selection, Vec<u64>),
    ) {
        let (shape, selection, chunks) = case;
        let store = store();
        let desc = dataset(shape, chunks);
        let count = selection.num_elements() as usize;
        let data = u16_bytes((0..count).map(|i| i as u16));
        store.write_hyperslab(&desc, BUCKET, &selection, &data).await.unwrap();
        prop_assert_eq!(store.read_hyperslab(&desc, BUCKET, &selection).await.unwrap(), data);
    }
}
