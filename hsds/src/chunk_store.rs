//! The per-process cache of chunk arrays.
//!
//! Every read and write of chunk data goes through a [`ChunkStore`]. A chunk is fetched from
//! storage at most once at a time: concurrent requests for a chunk that is being fetched wait
//! for that fetch instead of issuing their own. Modified chunks stay pinned in memory until
//! [`ChunkStore::flush`] persists them; when dirty chunks fill the memory budget, new chunks
//! wait for flushes to free space and eventually fail with
//! [`ChunkStoreErrorKind::CacheExhausted`].
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_recursion::async_recursion;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use lru::LruCache;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::Notify,
    task::JoinError,
    time::{Instant, timeout_at},
};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    array::{ArrayError, ArrayErrorKind, ChunkArray, Row, RowPredicate, bytes_to_array},
    codec::{CodecError, CodecErrorKind, FilterPipeline},
    config::{ChunkStoreConfig, HsdsConfig},
    dataset::{DatasetDescriptor, DescriptorError, DescriptorErrorKind},
    error::{ErrorCategory, HsdsError},
    format::{ChunkIndices, IdError, IdErrorKind, ObjectId},
    reference::{
        ChunkLocation, ReferenceError, ReferenceErrorKind, ReferenceResolver, Resolution,
        location_from_table_entry,
    },
    selection::{
        Selection, SelectionError, SelectionErrorKind, check_points, flat_index,
    },
    storage::{Storage, StorageError, StorageErrorKind, storage_from_config},
};

const FLUSH_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum ChunkStoreErrorKind {
    #[error(transparent)]
    Id(IdErrorKind),
    #[error(transparent)]
    Selection(SelectionErrorKind),
    #[error(transparent)]
    Array(ArrayErrorKind),
    #[error(transparent)]
    Codec(CodecErrorKind),
    #[error(transparent)]
    Storage(StorageErrorKind),
    #[error(transparent)]
    Reference(ReferenceErrorKind),
    #[error(transparent)]
    Descriptor(DescriptorErrorKind),
    #[error("chunk `{chunk}` does not belong to dataset `{dataset}`")]
    ForeignChunk { chunk: ObjectId, dataset: ObjectId },
    #[error("dataset `{0}` has a reference layout and cannot be modified")]
    ReadOnlyLayout(ObjectId),
    #[error("queries require a one dimensional dataset, got rank {0}")]
    QueryRank(usize),
    #[error(
        "no room in the chunk cache for {needed} bytes, {dirty} of {budget} bytes are waiting to be flushed"
    )]
    CacheExhausted { needed: u64, dirty: u64, budget: u64 },
    #[error("chunk of {size} bytes does not fit a chunk cache of {budget} bytes")]
    ChunkTooLarge { size: u64, budget: u64 },
    #[error("a concurrent task failed")]
    ConcurrencyError(#[from] JoinError),
}

impl ChunkStoreErrorKind {
    /// The one failure category an HTTP layer reports for this error.
    pub fn category(&self) -> ErrorCategory {
        use ErrorCategory as C;
        match self {
            ChunkStoreErrorKind::Id(IdErrorKind::InvalidIdentifier { .. }) => C::InvalidIdentifier,
            ChunkStoreErrorKind::Id(IdErrorKind::UnsupportedOperation { .. }) => {
                C::UnsupportedOperation
            }
            ChunkStoreErrorKind::Selection(_) | ChunkStoreErrorKind::QueryRank(_) => {
                C::InvalidSelection
            }
            ChunkStoreErrorKind::Array(kind) => match kind {
                ArrayErrorKind::Selection(_)
                | ArrayErrorKind::BufferSize { .. }
                | ArrayErrorKind::UnknownField(_)
                | ArrayErrorKind::TypeMismatch { .. } => C::InvalidSelection,
                ArrayErrorKind::VariableLength => C::UnsupportedOperation,
                ArrayErrorKind::ElementTooLarge(_) | ArrayErrorKind::TruncatedVarLen => C::Codec,
                ArrayErrorKind::FillValue { .. } | ArrayErrorKind::TooLarge(_) => C::Internal,
            },
            ChunkStoreErrorKind::Codec(_) => C::Codec,
            ChunkStoreErrorKind::Storage(kind) => kind.category(),
            ChunkStoreErrorKind::Reference(kind) => match kind {
                ReferenceErrorKind::InvalidFileUri(_) => C::InvalidIdentifier,
                ReferenceErrorKind::CoordinateRank { .. } => C::InvalidSelection,
                ReferenceErrorKind::VariableLength | ReferenceErrorKind::NestedChunkTable => {
                    C::UnsupportedOperation
                }
                ReferenceErrorKind::MissingFileUri | ReferenceErrorKind::BadTableEntry(_) => {
                    C::Internal
                }
            },
            ChunkStoreErrorKind::Descriptor(kind) => match kind {
                DescriptorErrorKind::NotADataset(_) => C::InvalidIdentifier,
                DescriptorErrorKind::LayoutRank { .. }
                | DescriptorErrorKind::EmptyChunkDimension(_)
                | DescriptorErrorKind::ChunkTableRank => C::InvalidSelection,
                DescriptorErrorKind::VariableLengthReference
                | DescriptorErrorKind::NestedChunkTable
                | DescriptorErrorKind::ChunkTooLarge(_)
                | DescriptorErrorKind::Initializer(_) => C::UnsupportedOperation,
            },
            ChunkStoreErrorKind::ForeignChunk { .. } => C::InvalidIdentifier,
            ChunkStoreErrorKind::ReadOnlyLayout(_) => C::UnsupportedOperation,
            ChunkStoreErrorKind::CacheExhausted { .. }
            | ChunkStoreErrorKind::ChunkTooLarge { .. } => C::CacheExhausted,
            ChunkStoreErrorKind::ConcurrencyError(_) => C::Internal,
        }
    }
}

pub type ChunkStoreError = HsdsError<ChunkStoreErrorKind>;

impl ChunkStoreError {
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

// it would be great to define this impl in error.rs, but it conflicts with the blanket
// `impl From<T> for T`
impl<E> From<E> for ChunkStoreError
where
    E: Into<ChunkStoreErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<IdError> for ChunkStoreError {
    fn from(value: IdError) -> Self {
        Self::with_context(ChunkStoreErrorKind::Id(value.kind), value.context)
    }
}

impl From<SelectionError> for ChunkStoreError {
    fn from(value: SelectionError) -> Self {
        Self::with_context(ChunkStoreErrorKind::Selection(value.kind), value.context)
    }
}

impl From<ArrayError> for ChunkStoreError {
    fn from(value: ArrayError) -> Self {
        Self::with_context(ChunkStoreErrorKind::Array(value.kind), value.context)
    }
}

impl From<CodecError> for ChunkStoreError {
    fn from(value: CodecError) -> Self {
        Self::with_context(ChunkStoreErrorKind::Codec(value.kind), value.context)
    }
}

impl From<StorageError> for ChunkStoreError {
    fn from(value: StorageError) -> Self {
        Self::with_context(ChunkStoreErrorKind::Storage(value.kind), value.context)
    }
}

impl From<ReferenceError> for ChunkStoreError {
    fn from(value: ReferenceError) -> Self {
        Self::with_context(ChunkStoreErrorKind::Reference(value.kind), value.context)
    }
}

impl From<DescriptorError> for ChunkStoreError {
    fn from(value: DescriptorError) -> Self {
        Self::with_context(ChunkStoreErrorKind::Descriptor(value.kind), value.context)
    }
}

pub type ChunkStoreResult<A> = Result<A, ChunkStoreError>;

/// Matches of a query, `indices` are dataset coordinates.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub indices: Vec<u64>,
    pub rows: Vec<Row>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UpdateResult {
    pub indices: Vec<u64>,
    pub before: Vec<Row>,
    pub after: Vec<Row>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyChunk {
    pub id: ObjectId,
    pub bucket: String,
    pub last_write: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub dirty_entries: usize,
    pub pending_reads: usize,
    pub mem_used: u64,
    pub mem_dirty: u64,
    pub budget: u64,
}

impl CacheStats {
    pub fn utilization_percent(&self) -> u64 {
        if self.budget == 0 { 0 } else { self.mem_used * 100 / self.budget }
    }
}

#[derive(Debug)]
struct CacheEntry {
    array: Arc<ChunkArray>,
    dirty: bool,
}

impl CacheEntry {
    fn size(&self) -> u64 {
        self.array.nbytes() as u64
    }
}

#[derive(Debug, Clone)]
struct DirtyRecord {
    last_write: DateTime<Utc>,
    bucket: String,
    key: String,
    pipeline: FilterPipeline,
    /// Increases with every write, so a flush can tell whether it persisted the last one.
    version: u64,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<ObjectId, CacheEntry>,
    mem_used: u64,
    mem_dirty: u64,
    /// In flight reads, with the fetch number that owns the marker.
    pending: HashMap<ObjectId, (u64, Instant)>,
    dirty: HashMap<ObjectId, DirtyRecord>,
    writes: u64,
    fetches: u64,
}

impl CacheState {
    fn new() -> Self {
        CacheState {
            entries: LruCache::unbounded(),
            mem_used: 0,
            mem_dirty: 0,
            pending: HashMap::new(),
            dirty: HashMap::new(),
            writes: 0,
            fetches: 0,
        }
    }

    fn start_fetch(&mut self, id: &ObjectId) -> u64 {
        self.fetches += 1;
        self.pending.insert(id.clone(), (self.fetches, Instant::now()));
        self.fetches
    }

    /// Clear the pending marker of a fetch, unless a newer fetch of the chunk replaced it.
    fn end_fetch(&mut self, id: &ObjectId, fetch: u64) {
        if self.pending.get(id).is_some_and(|(owner, _)| *owner == fetch) {
            self.pending.remove(id);
        }
    }

    fn get(&mut self, id: &ObjectId) -> Option<Arc<ChunkArray>> {
        self.entries.get(id).map(|entry| Arc::clone(&entry.array))
    }

    fn insert(&mut self, id: ObjectId, array: Arc<ChunkArray>) {
        if self.entries.contains(&id) {
            return;
        }
        self.mem_used += array.nbytes() as u64;
        self.entries.put(id, CacheEntry { array, dirty: false });
    }

    fn remove(&mut self, id: &ObjectId) -> Option<CacheEntry> {
        let entry = self.entries.pop(id)?;
        self.mem_used -= entry.size();
        if entry.dirty {
            self.mem_dirty -= entry.size();
        }
        Some(entry)
    }

    /// Evict clean entries, least recently used first, until `size` more bytes fit.
    fn make_room(&mut self, size: u64, budget: u64) -> bool {
        if self.mem_dirty + size > budget {
            return false;
        }
        while self.mem_used + size > budget {
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| !entry.dirty)
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    trace!(chunk = %id, "evicting chunk");
                    self.remove(&id);
                }
                None => return false,
            }
        }
        true
    }

    fn mark_clean(&mut self, id: &ObjectId) {
        if let Some(entry) = self.entries.peek_mut(id) {
            if entry.dirty {
                entry.dirty = false;
                self.mem_dirty -= entry.array.nbytes() as u64;
            }
        }
    }
}

#[derive(Debug)]
struct StoreInner {
    storage: Arc<dyn Storage>,
    config: ChunkStoreConfig,
    state: Mutex<CacheState>,
    fetch_done: Notify,
    space_freed: Notify,
}

/// Shared handle to the chunk cache of one process. Clones share the same cache.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    inner: Arc<StoreInner>,
}

impl ChunkStore {
    pub fn new(storage: Arc<dyn Storage>, config: ChunkStoreConfig) -> Self {
        let inner = StoreInner {
            storage,
            config,
            state: Mutex::new(CacheState::new()),
            fetch_done: Notify::new(),
            space_freed: Notify::new(),
        };
        ChunkStore { inner: Arc::new(inner) }
    }

    pub fn from_config(config: &HsdsConfig) -> Result<Self, StorageError> {
        Ok(Self::new(storage_from_config(&config.storage)?, config.chunk_store.clone()))
    }

    pub fn config(&self) -> &ChunkStoreConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        // the state is consistent between statements, a panicking holder cannot corrupt it
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, chunk_id: &ObjectId) -> bool {
        self.state().entries.contains(chunk_id)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            entries: state.entries.len(),
            dirty_entries: state.dirty.len(),
            pending_reads: state.pending.len(),
            mem_used: state.mem_used,
            mem_dirty: state.mem_dirty,
            budget: self.config().max_cache_bytes,
        }
    }

    /// Chunks modified since they were last persisted, oldest write first.
    pub fn dirty_ids(&self) -> Vec<DirtyChunk> {
        let mut dirty: Vec<DirtyChunk> = self
            .state()
            .dirty
            .iter()
            .map(|(id, record)| DirtyChunk {
                id: id.clone(),
                bucket: record.bucket.clone(),
                last_write: record.last_write,
            })
            .collect();
        dirty.sort_by_key(|chunk| chunk.last_write);
        dirty
    }

    fn check_chunk(&self, chunk_id: &ObjectId, desc: &DatasetDescriptor) -> ChunkStoreResult<()> {
        desc.validate()?;
        if chunk_id.dataset_id()? != desc.id {
            return Err(ChunkStoreErrorKind::ForeignChunk {
                chunk: chunk_id.clone(),
                dataset: desc.id.clone(),
            }
            .into());
        }
        let coord = chunk_id.chunk_coordinate()?;
        if coord.rank() != desc.rank() {
            return Err(ChunkStoreErrorKind::Selection(SelectionErrorKind::RankMismatch {
                expected: desc.rank(),
                actual: coord.rank(),
            })
            .into());
        }
        Ok(())
    }

    fn check_writable(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
    ) -> ChunkStoreResult<()> {
        self.check_chunk(chunk_id, desc)?;
        if desc.is_reference() {
            return Err(ChunkStoreErrorKind::ReadOnlyLayout(desc.id.clone()).into());
        }
        Ok(())
    }

    fn check_buffer(desc: &DatasetDescriptor, count: u64, data: &[u8]) -> ChunkStoreResult<()> {
        let item_size = desc
            .item_size()
            .ok_or(ChunkStoreErrorKind::Array(ArrayErrorKind::VariableLength))?;
        let expected = usize::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(item_size))
            .unwrap_or(usize::MAX);
        if data.len() != expected {
            return Err(ChunkStoreErrorKind::Array(ArrayErrorKind::BufferSize {
                expected,
                actual: data.len(),
            })
            .into());
        }
        Ok(())
    }

    /// The cached array of a chunk, fetching it if needed.
    ///
    /// Returns `None` when the chunk has no stored bytes, unless `init` is set, in which case
    /// the chunk's initial contents (its initializer's values, else the fill value) are
    /// cached and returned.
    #[instrument(skip(self, desc), fields(chunk = %chunk_id))]
    pub async fn get(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
        init: bool,
    ) -> ChunkStoreResult<Option<Arc<ChunkArray>>> {
        self.check_chunk(chunk_id, desc)?;
        let fetch_wait = self.config().fetch_wait;
        let mut timed_out = false;
        let fetch = loop {
            let fetch_done = self.inner.fetch_done.notified();
            let deadline = {
                let mut state = self.state();
                if let Some(array) = state.get(chunk_id) {
                    trace!("chunk cache hit");
                    return Ok(Some(array));
                }
                let in_flight = state
                    .pending
                    .get(chunk_id)
                    .map(|(_, started)| *started)
                    .filter(|started| !timed_out && started.elapsed() < fetch_wait);
                match in_flight {
                    Some(started) => Ok(started + fetch_wait),
                    None => Err(state.start_fetch(chunk_id)),
                }
            };
            let deadline = match deadline {
                Ok(deadline) => deadline,
                Err(fetch) => break fetch,
            };
            debug!("waiting for pending read of chunk");
            if timeout_at(deadline, fetch_done).await.is_err() {
                warn!(?fetch_wait, "pending read of chunk timed out, issuing a new read");
                timed_out = true;
            }
        };

        // the fetch outlives callers that give up on it, so waiters still get the chunk
        let store = self.clone();
        let (id, desc, bucket) = (chunk_id.clone(), desc.clone(), bucket.to_string());
        let task = tokio::spawn(async move { store.load(id, desc, bucket, init, fetch).await });
        task.await?
    }

    async fn load(
        &self,
        chunk_id: ObjectId,
        desc: DatasetDescriptor,
        bucket: String,
        init: bool,
        fetch: u64,
    ) -> ChunkStoreResult<Option<Arc<ChunkArray>>> {
        let started = Instant::now();
        let result = self.load_and_admit(&chunk_id, &desc, &bucket, init).await;
        self.state().end_fetch(&chunk_id, fetch);
        self.inner.fetch_done.notify_waiters();
        debug!(chunk = %chunk_id, elapsed = ?started.elapsed(), "chunk read done");
        result
    }

    async fn load_and_admit(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
        init: bool,
    ) -> ChunkStoreResult<Option<Arc<ChunkArray>>> {
        let array = match self.fetch(chunk_id, desc, bucket).await? {
            Some(array) => array,
            None if init => {
                debug!(chunk = %chunk_id, "initializing chunk");
                desc.initial_chunk(chunk_id.chunk_coordinate()?)?
            }
            None => return Ok(None),
        };
        Ok(Some(self.admit(chunk_id, Arc::new(array)).await?))
    }

    /// Read and decode the stored bytes of a chunk, `None` if it has none.
    #[async_recursion]
    async fn fetch(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
    ) -> ChunkStoreResult<Option<ChunkArray>> {
        let coord = chunk_id.chunk_coordinate()?;
        if !desc.is_reference() {
            let key = chunk_id.key();
            return match self.storage().get_bytes(bucket, &key, None).await {
                Ok(bytes) => Ok(Some(self.decode(desc, &bytes, None)?)),
                Err(err) if err.is_not_found() => {
                    debug!(key, "chunk has not been written");
                    Ok(None)
                }
                Err(err) => Err(err.into()),
            };
        }

        let location = match ReferenceResolver::new(desc).resolve(coord)? {
            Resolution::Absent => return Ok(None),
            Resolution::Located(location) => location,
            Resolution::Indirect { table, point, default_uri } => {
                match self.table_entry(table, &point, bucket, default_uri).await? {
                    Some(location) => location,
                    None => return Ok(None),
                }
            }
        };
        debug!(
            file = %location.file,
            offset = location.offset,
            length = location.length,
            "reading referenced chunk"
        );
        let bytes = self
            .storage()
            .get_bytes(&location.file.bucket, &location.file.key, Some(&location.range()))
            .await?;
        Ok(Some(self.decode(desc, &bytes, location.pad_to)?))
    }

    /// The location stored at `point` of an indirect layout's chunk table.
    async fn table_entry(
        &self,
        table: &DatasetDescriptor,
        point: &[u64],
        bucket: &str,
        default_uri: Option<&str>,
    ) -> ChunkStoreResult<Option<ChunkLocation>> {
        if point.iter().zip(&table.shape).any(|(p, extent)| p >= extent) {
            debug!(?point, "chunk is outside of the chunk table");
            return Ok(None);
        }
        let table_chunks = table.chunk_shape();
        let coord = ChunkIndices(point.iter().zip(table_chunks).map(|(p, c)| p / c).collect());
        let local: Vec<u64> = point.iter().zip(table_chunks).map(|(p, c)| p % c).collect();
        let table_chunk = table.chunk_id(coord.clone())?;
        let array = match self.get(&table_chunk, table, bucket, false).await? {
            Some(array) => array,
            None => Arc::new(table.initial_chunk(&coord)?),
        };
        let row = array.row(flat_index(table_chunks, &local) as usize)?;
        Ok(location_from_table_entry(&row, default_uri)?)
    }

    fn decode(
        &self,
        desc: &DatasetDescriptor,
        stored: &[u8],
        pad_to: Option<u64>,
    ) -> ChunkStoreResult<ChunkArray> {
        let mut data = desc.pipeline(self.config().strict_decompression).decode(stored)?;
        if let Some(pad_to) = pad_to.map(|len| len as usize) {
            if data.len() < pad_to {
                debug!(read = data.len(), expected = pad_to, "zero filling short read");
                data.resize(pad_to, 0);
            }
        }
        let expected = desc
            .chunk_nbytes()
            .ok_or(ChunkStoreErrorKind::Array(ArrayErrorKind::VariableLength))?;
        if data.len() != expected {
            return Err(ChunkStoreErrorKind::Codec(CodecErrorKind::PayloadSize {
                expected,
                actual: data.len(),
            })
            .into());
        }
        Ok(bytes_to_array(&data, desc.dtype.clone(), desc.chunk_shape().to_vec())?)
    }

    /// Put a freshly loaded array in the cache, waiting for flushes if dirty chunks fill it.
    async fn admit(
        &self,
        chunk_id: &ObjectId,
        array: Arc<ChunkArray>,
    ) -> ChunkStoreResult<Arc<ChunkArray>> {
        let size = array.nbytes() as u64;
        let budget = self.config().max_cache_bytes;
        if size > budget {
            return Err(ChunkStoreErrorKind::ChunkTooLarge { size, budget }.into());
        }
        let deadline = Instant::now() + self.config().backpressure_wait;
        loop {
            let space_freed = self.inner.space_freed.notified();
            {
                let mut state = self.state();
                if let Some(cached) = state.get(chunk_id) {
                    return Ok(cached);
                }
                if state.make_room(size, budget) {
                    state.insert(chunk_id.clone(), Arc::clone(&array));
                    return Ok(array);
                }
                debug!(
                    chunk = %chunk_id,
                    mem_dirty = state.mem_dirty,
                    budget,
                    "chunk cache is full of dirty chunks, waiting for a flush"
                );
            }
            if timeout_at(deadline, space_freed).await.is_err() {
                let dirty = self.state().mem_dirty;
                warn!(chunk = %chunk_id, dirty, budget, "gave up waiting for chunk cache space");
                return Err(ChunkStoreErrorKind::CacheExhausted { needed: size, dirty, budget }
                    .into());
            }
        }
    }

    async fn get_for_write(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
    ) -> ChunkStoreResult<Arc<ChunkArray>> {
        match self.get(chunk_id, desc, bucket, true).await? {
            Some(array) => Ok(array),
            None => Ok(Arc::new(desc.initial_chunk(chunk_id.chunk_coordinate()?)?)),
        }
    }

    /// Apply `update` to the cached array of a chunk.
    ///
    /// `update` returns whether the chunk must be persisted, the chunk is then marked dirty
    /// even if no byte changed.
    fn modify<T>(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
        array: Arc<ChunkArray>,
        update: impl FnOnce(&mut ChunkArray) -> Result<(T, bool), ArrayError>,
    ) -> ChunkStoreResult<T> {
        let size = array.nbytes() as u64;
        let budget = self.config().max_cache_bytes;
        let mut state = self.state();
        let mut entry = match state.entries.pop(chunk_id) {
            Some(entry) => {
                // the cached copy is only cloned if a reader still holds it
                drop(array);
                entry
            }
            None => {
                // evicted while we were loading it, modifications cannot be dropped
                if !state.make_room(size, budget) {
                    warn!(chunk = %chunk_id, "chunk cache over budget");
                }
                state.mem_used += size;
                CacheEntry { array, dirty: false }
            }
        };
        let result = update(Arc::make_mut(&mut entry.array));
        let written = matches!(result, Ok((_, true)));
        if written && !entry.dirty {
            entry.dirty = true;
            state.mem_dirty += size;
        }
        state.entries.put(chunk_id.clone(), entry);
        let (result, _) = result?;
        if written {
            state.writes += 1;
            let record = DirtyRecord {
                last_write: Utc::now(),
                bucket: bucket.to_string(),
                key: chunk_id.key(),
                pipeline: desc.pipeline(self.config().strict_decompression),
                version: state.writes,
            };
            state.dirty.insert(chunk_id.clone(), record);
        } else {
            trace!(chunk = %chunk_id, "no rows matched, chunk left as is");
        }
        Ok(result)
    }

    /// Bytes of the selected elements of a chunk. `selection` is in chunk coordinates.
    #[instrument(skip(self, desc), fields(chunk = %chunk_id, %selection))]
    pub async fn read_selection(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
        selection: &Selection,
    ) -> ChunkStoreResult<Bytes> {
        self.check_chunk(chunk_id, desc)?;
        selection.check_within(desc.chunk_shape())?;
        let data = match self.get(chunk_id, desc, bucket, false).await? {
            Some(array) => array.read_selection(selection)?,
            None => desc.initial_chunk(chunk_id.chunk_coordinate()?)?.read_selection(selection)?,
        };
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, desc, data), fields(chunk = %chunk_id, %selection, len = data.len()))]
    pub async fn write_selection(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
        selection: &Selection,
        data: &[u8],
    ) -> ChunkStoreResult<()> {
        self.check_writable(chunk_id, desc)?;
        selection.check_within(desc.chunk_shape())?;
        Self::check_buffer(desc, selection.num_elements(), data)?;
        let array = self.get_for_write(chunk_id, desc, bucket).await?;
        self.modify(chunk_id, desc, bucket, array, |array| {
            array.write_selection(selection, data)?;
            Ok(((), true))
        })
    }

    #[instrument(skip(self, desc, points), fields(chunk = %chunk_id, count = points.len()))]
    pub async fn read_points(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
        points: &[Vec<u64>],
    ) -> ChunkStoreResult<Bytes> {
        self.check_chunk(chunk_id, desc)?;
        check_points(points, desc.chunk_shape())?;
        let data = match self.get(chunk_id, desc, bucket, false).await? {
            Some(array) => array.read_points(points)?,
            None => desc.initial_chunk(chunk_id.chunk_coordinate()?)?.read_points(points)?,
        };
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, desc, points, data), fields(chunk = %chunk_id, count = points.len()))]
    pub async fn write_points(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
        points: &[Vec<u64>],
        data: &[u8],
    ) -> ChunkStoreResult<()> {
        self.check_writable(chunk_id, desc)?;
        check_points(points, desc.chunk_shape())?;
        Self::check_buffer(desc, points.len() as u64, data)?;
        let array = self.get_for_write(chunk_id, desc, bucket).await?;
        self.modify(chunk_id, desc, bucket, array, |array| {
            array.write_points(points, data)?;
            Ok(((), true))
        })
    }

    fn query_origin(
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        selection: &Selection,
    ) -> ChunkStoreResult<u64> {
        if desc.rank() != 1 {
            return Err(ChunkStoreErrorKind::QueryRank(desc.rank()).into());
        }
        selection.check_within(desc.chunk_shape())?;
        let origin = chunk_id.chunk_coordinate()?.origin(desc.chunk_shape());
        Ok(origin.first().copied().unwrap_or(0))
    }

    /// Rows of the selected elements that pass `predicate`, at most `limit` of them.
    ///
    /// Chunks that were never written have no rows.
    #[instrument(skip(self, desc, predicate), fields(chunk = %chunk_id, %selection))]
    pub async fn query(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
        selection: &Selection,
        predicate: &dyn RowPredicate,
        limit: Option<usize>,
    ) -> ChunkStoreResult<QueryResult> {
        self.check_chunk(chunk_id, desc)?;
        let origin = Self::query_origin(chunk_id, desc, selection)?;
        let Some(array) = self.get(chunk_id, desc, bucket, false).await? else {
            return Ok(QueryResult::default());
        };
        let (positions, rows) = array
            .query_rows(selection, predicate, limit)?
            .into_iter()
            .map(|(position, row)| (origin + position[0], row))
            .unzip();
        Ok(QueryResult { indices: positions, rows })
    }

    /// Replace the fields in `values` of every selected row passing `predicate`.
    #[instrument(skip(self, desc, predicate, values), fields(chunk = %chunk_id, %selection))]
    #[allow(clippy::too_many_arguments)]
    pub async fn update_where(
        &self,
        chunk_id: &ObjectId,
        desc: &DatasetDescriptor,
        bucket: &str,
        selection: &Selection,
        predicate: &dyn RowPredicate,
        values: &Row,
        limit: Option<usize>,
    ) -> ChunkStoreResult<UpdateResult> {
        self.check_writable(chunk_id, desc)?;
        let origin = Self::query_origin(chunk_id, desc, selection)?;
        let array = self.get_for_write(chunk_id, desc, bucket).await?;
        self.modify(chunk_id, desc, bucket, array, |array| {
            let mut result = UpdateResult::default();
            for (position, before) in array.query_rows(selection, predicate, limit)? {
                let flat = flat_index(array.shape(), &position) as usize;
                array.update_row(flat, values)?;
                result.after.push(array.row(flat)?);
                result.before.push(before);
                result.indices.push(origin + position[0]);
            }
            let matched = !result.indices.is_empty();
            Ok((result, matched))
        })
    }

    /// Persist a dirty chunk. Returns whether anything was written.
    ///
    /// The chunk stays dirty if it was modified again while being written.
    #[instrument(skip(self), fields(chunk = %chunk_id))]
    pub async fn flush(&self, chunk_id: &ObjectId) -> ChunkStoreResult<bool> {
        let (array, record) = {
            let mut state = self.state();
            let Some(record) = state.dirty.get(chunk_id).cloned() else {
                return Ok(false);
            };
            match state.entries.peek(chunk_id) {
                Some(entry) => (Arc::clone(&entry.array), record),
                None => {
                    warn!("dirty chunk is no longer cached");
                    state.dirty.remove(chunk_id);
                    return Ok(false);
                }
            }
        };
        let payload = record.pipeline.encode(array.as_bytes())?;
        debug!(key = record.key, len = payload.len(), "writing chunk");
        self.storage().put_bytes(&record.bucket, &record.key, Bytes::from(payload)).await?;
        {
            let mut state = self.state();
            if state.dirty.get(chunk_id).is_some_and(|r| r.version == record.version) {
                state.dirty.remove(chunk_id);
                state.mark_clean(chunk_id);
            } else {
                debug!("chunk was modified during flush, keeping it dirty");
            }
        }
        self.inner.space_freed.notify_waiters();
        Ok(true)
    }

    /// Flush every dirty chunk. Returns how many were written.
    pub async fn flush_all(&self) -> ChunkStoreResult<usize> {
        let ids: Vec<ObjectId> = self.state().dirty.keys().cloned().collect();
        let flushed: Vec<bool> = stream::iter(ids)
            .map(|id| async move { self.flush(&id).await })
            .buffer_unordered(FLUSH_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(flushed.into_iter().filter(|written| *written).count())
    }

    /// Drop every cached chunk and pending write of a deleted dataset.
    pub fn evict_dataset(&self, dataset_id: &ObjectId) -> usize {
        let evicted = {
            let mut state = self.state();
            let ids: Vec<ObjectId> = state
                .entries
                .iter()
                .map(|(id, _)| id)
                .chain(state.dirty.keys())
                .filter(|id| id.dataset_id().is_ok_and(|dset| &dset == dataset_id))
                .cloned()
                .collect();
            let mut evicted = 0;
            for id in ids {
                state.dirty.remove(&id);
                if state.remove(&id).is_some() {
                    evicted += 1;
                }
            }
            evicted
        };
        info!(dataset = %dataset_id, evicted, "evicted dataset chunks");
        self.inner.space_freed.notify_waiters();
        evicted
    }

    /// Flush everything, then empty the cache.
    pub async fn shutdown(&self) -> ChunkStoreResult<()> {
        let flushed = self.flush_all().await?;
        let mut state = self.state();
        let remaining = state.dirty.len();
        if remaining > 0 {
            warn!(remaining, "chunks were modified during shutdown");
        }
        *state = CacheState::new();
        info!(flushed, "chunk store shut down");
        Ok(())
    }
}
