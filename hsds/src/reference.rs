//! Locating chunks of datasets whose bytes live inside pre-existing HDF5 files.
use core::fmt;
use std::{ops::Range, str::FromStr};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    array::{Row, Scalar},
    dataset::{DatasetDescriptor, Layout},
    error::HsdsError,
    format::ChunkIndices,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceErrorKind {
    #[error("invalid file uri `{0}`")]
    InvalidFileUri(String),
    #[error("chunk table entry has no file uri and the dataset declares none")]
    MissingFileUri,
    #[error("chunk table entry has an invalid `{0}` field")]
    BadTableEntry(&'static str),
    #[error("chunk {coord} has rank {actual}, dataset has rank {expected}")]
    CoordinateRank { coord: ChunkIndices, expected: usize, actual: usize },
    #[error("reference layouts require a fixed size element type")]
    VariableLength,
    #[error("chunk table of an indirect layout cannot itself be indirect")]
    NestedChunkTable,
}

pub type ReferenceError = HsdsError<ReferenceErrorKind>;

impl<E> From<E> for ReferenceError
where
    E: Into<ReferenceErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type ReferenceResult<A> = Result<A, ReferenceError>;

/// `s3://bucket/path/to/file.h5` or `bucket/path/to/file.h5`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileUri {
    pub bucket: String,
    pub key: String,
}

impl FromStr for FileUri {
    type Err = ReferenceError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let invalid = || ReferenceError::from(ReferenceErrorKind::InvalidFileUri(uri.to_string()));
        let rest = uri.strip_prefix("s3://").unwrap_or(uri);
        if rest.starts_with('/') {
            return Err(invalid());
        }
        let (bucket, key) = rest.split_once('/').ok_or_else(invalid)?;
        let key = key.trim_start_matches('/');
        if bucket.is_empty() || key.is_empty() {
            return Err(invalid());
        }
        Ok(FileUri { bucket: bucket.to_string(), key: key.to_string() })
    }
}

impl fmt::Display for FileUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Where the bytes of one chunk are.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkLocation {
    pub file: FileUri,
    pub offset: u64,
    pub length: u64,
    /// Reads shorter than this are zero filled up to it.
    pub pad_to: Option<u64>,
}

impl ChunkLocation {
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// Outcome of looking a chunk up in a reference layout.
#[derive(Debug, PartialEq)]
pub enum Resolution<'a> {
    /// The chunk has no stored bytes and reads as the fill value.
    Absent,
    Located(ChunkLocation),
    /// The location is the element at `point` of the `table` dataset.
    Indirect { table: &'a DatasetDescriptor, point: Vec<u64>, default_uri: Option<&'a str> },
}

/// Maps chunk coordinates of a reference dataset to byte ranges in its file.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceResolver<'a> {
    descriptor: &'a DatasetDescriptor,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(descriptor: &'a DatasetDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn resolve(&self, coord: &ChunkIndices) -> ReferenceResult<Resolution<'a>> {
        let desc = self.descriptor;
        if coord.rank() != desc.rank() {
            return Err(ReferenceErrorKind::CoordinateRank {
                coord: coord.clone(),
                expected: desc.rank(),
                actual: coord.rank(),
            }
            .into());
        }
        match &desc.layout {
            Layout::Chunked { .. } => Ok(Resolution::Absent),
            Layout::ContiguousRef { file_uri, offset, size, dims } => {
                self.resolve_contiguous(coord, file_uri, *offset, *size, dims)
            }
            Layout::ChunkedRef { file_uri, chunks, .. } => {
                match chunks.get(&coord.to_string()) {
                    Some((offset, size)) if *size > 0 => Ok(Resolution::Located(ChunkLocation {
                        file: file_uri.parse()?,
                        offset: *offset,
                        length: *size,
                        pad_to: None,
                    })),
                    _ => {
                        debug!(%coord, "no chunk table entry");
                        Ok(Resolution::Absent)
                    }
                }
            }
            Layout::ChunkedRefIndirect { file_uri, chunk_table, .. } => {
                if matches!(chunk_table.layout, Layout::ChunkedRefIndirect { .. }) {
                    return Err(ReferenceErrorKind::NestedChunkTable.into());
                }
                Ok(Resolution::Indirect {
                    table: chunk_table,
                    point: coord.0.clone(),
                    default_uri: file_uri.as_deref(),
                })
            }
        }
    }

    fn resolve_contiguous(
        &self,
        coord: &ChunkIndices,
        file_uri: &str,
        offset: u64,
        size: u64,
        dims: &[u64],
    ) -> ReferenceResult<Resolution<'a>> {
        if size == 0 {
            debug!("contiguous dataset has no allocated storage");
            return Ok(Resolution::Absent);
        }
        let item_size =
            self.descriptor.item_size().ok_or(ReferenceErrorKind::VariableLength)? as u64;
        let chunk_bytes = item_size * dims.iter().product::<u64>();
        // walk from the fastest varying dimension, growing the stride by the dataset extent
        let mut stride = item_size;
        let mut chunk_offset = offset;
        for dim in (0..dims.len()).rev() {
            chunk_offset += coord.0[dim] * dims[dim] * stride;
            stride *= self.descriptor.shape[dim];
        }
        let end = offset + size;
        if chunk_offset >= end {
            warn!(%coord, chunk_offset, end, "chunk starts beyond the end of the contiguous data");
            return Ok(Resolution::Absent);
        }
        Ok(Resolution::Located(ChunkLocation {
            file: file_uri.parse()?,
            offset: chunk_offset,
            length: chunk_bytes.min(end - chunk_offset),
            pad_to: Some(chunk_bytes),
        }))
    }
}

fn unsigned_field(row: &Row, name: &'static str) -> ReferenceResult<u64> {
    match row.get(name) {
        Some(Scalar::UInt(value)) => Ok(*value),
        Some(Scalar::Int(value)) => {
            u64::try_from(*value).map_err(|_| ReferenceErrorKind::BadTableEntry(name).into())
        }
        _ => Err(ReferenceErrorKind::BadTableEntry(name).into()),
    }
}

/// Read a chunk table element: `offset`, `size` and an optional `file_uri` overriding the
/// dataset's. A zero size means the chunk was never allocated.
pub fn location_from_table_entry(
    row: &Row,
    default_uri: Option<&str>,
) -> ReferenceResult<Option<ChunkLocation>> {
    let offset = unsigned_field(row, "offset")?;
    let size = unsigned_field(row, "size")?;
    if size == 0 {
        return Ok(None);
    }
    let uri = match row.get("file_uri") {
        Some(Scalar::Str(uri)) if !uri.is_empty() => uri.as_str(),
        Some(Scalar::Str(_)) | None => default_uri.ok_or(ReferenceErrorKind::MissingFileUri)?,
        Some(_) => return Err(ReferenceErrorKind::BadTableEntry("file_uri").into()),
    };
    Ok(Some(ChunkLocation { file: uri.parse()?, offset, length: size, pad_to: None }))
}
