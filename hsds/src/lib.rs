//! Chunk engine of an HDF5 data service backed by object storage.
//!
//! General design:
//! - Every object of a domain (groups, datasets, datatypes and the chunks of datasets) has an
//!   id, and ids map one to one to object storage keys. The [`mod@format`] module owns that
//!   mapping, for both the flat v1 key schema and the hierarchical v2 one.
//! - Chunks are stored as the row-major bytes of a [`array::ChunkArray`], optionally
//!   shuffled and deflate compressed by the dataset's [`codec::FilterPipeline`].
//! - Selections over a dataset are decomposed into per-chunk selections by the [`layout`]
//!   module, which also proposes chunk shapes for new datasets.
//! - The [`ChunkStore`] caches chunk arrays in memory, deduplicates concurrent fetches and
//!   holds modified chunks until they are flushed. It is the only code reading or writing
//!   chunk bytes.
//! - Datasets can also point at chunks inside existing HDF5 files instead of owning them.
//!   The [`reference`] module finds the byte range of such chunks.
//! - Object storage is abstracted by the [`Storage`] trait, implemented on top of
//!   `object_store` for memory, the local file system and S3.
pub mod array;
pub mod chunk_store;
#[cfg(feature = "cli")]
pub mod cli;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod dataset_io;
pub mod error;
pub mod format;
pub mod layout;
pub mod reference;
pub mod selection;
pub mod storage;
#[cfg(test)]
pub mod strategies;

pub use chunk_store::{ChunkStore, ChunkStoreError};
pub use config::{ChunkStoreConfig, HsdsConfig, LayoutConfig, StorageConfig};
pub use dataset::{ChunkInitializer, DatasetDescriptor};
pub use error::ErrorCategory;
pub use format::{ObjectId, ObjectKind};
pub use layout::LayoutPlanner;
pub use selection::Selection;
pub use storage::{
    ObjectStorage, Storage, StorageError, new_in_memory_storage, new_local_filesystem_storage,
    new_s3_storage,
};

/// Install a global subscriber printing spans and events selected by the `HSDS_LOG`
/// environment variable (`RUST_LOG` syntax), capturing span traces for errors.
#[cfg(feature = "logs")]
pub fn initialize_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

    let filter = EnvFilter::try_from_env("HSDS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = Registry::default()
        .with(tracing_subscriber::fmt::layer().pretty().with_filter(filter))
        .with(ErrorLayer::default());
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("⚠️ Failed to set global tracing subscriber: {err}");
    }
}
