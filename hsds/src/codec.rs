//! Byte-level transforms applied to chunk payloads.
//!
//! Writes run shuffle then deflate, reads run inflate then unshuffle.
use std::io::{Read, Write};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::HsdsError;

pub const DEFAULT_DEFLATE_LEVEL: u32 = 5;

#[derive(Debug, Error)]
pub enum CodecErrorKind {
    #[error("buffer of {len} bytes is not a multiple of item size {item_size}")]
    InvalidChunkSize { len: usize, item_size: usize },
    #[error("deflate compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("zlib decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("chunk payload of {actual} bytes does not match the expected {expected} bytes")]
    PayloadSize { expected: usize, actual: usize },
}

pub type CodecError = HsdsError<CodecErrorKind>;

impl<E> From<E> for CodecError
where
    E: Into<CodecErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type CodecResult<A> = Result<A, CodecError>;

/// Filter as declared in a dataset's creation properties.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FilterSpec", into = "FilterSpec")]
pub enum Filter {
    Shuffle,
    Deflate { level: u32 },
    /// Filters this engine does not apply, kept so descriptors round trip.
    Other { class: String, id: Option<u32>, name: Option<String> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FilterSpec {
    class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    level: Option<u32>,
}

impl From<FilterSpec> for Filter {
    fn from(spec: FilterSpec) -> Self {
        let name = spec.name.as_deref().map(str::to_ascii_lowercase);
        match (spec.class.as_str(), spec.id, name.as_deref()) {
            ("H5Z_FILTER_DEFLATE", ..)
            | (_, Some(1), _)
            | (_, _, Some("deflate" | "gzip" | "zlib")) => {
                Filter::Deflate { level: spec.level.unwrap_or(DEFAULT_DEFLATE_LEVEL) }
            }
            ("H5Z_FILTER_SHUFFLE", ..) | (_, Some(2), _) | (_, _, Some("shuffle")) => {
                Filter::Shuffle
            }
            _ => Filter::Other { class: spec.class, id: spec.id, name: spec.name },
        }
    }
}

impl From<Filter> for FilterSpec {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::Shuffle => FilterSpec {
                class: "H5Z_FILTER_SHUFFLE".to_string(),
                id: Some(2),
                name: Some("shuffle".to_string()),
                level: None,
            },
            Filter::Deflate { level } => FilterSpec {
                class: "H5Z_FILTER_DEFLATE".to_string(),
                id: Some(1),
                name: Some("deflate".to_string()),
                level: Some(level),
            },
            Filter::Other { class, id, name } => FilterSpec { class, id, name, level: None },
        }
    }
}

/// Result of a (un)shuffle. Item sizes of one byte or less leave the input untouched.
#[derive(Debug, PartialEq, Eq)]
pub enum ShuffleOutcome<'a> {
    Unchanged(&'a [u8]),
    Shuffled(Vec<u8>),
}

impl ShuffleOutcome<'_> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ShuffleOutcome::Unchanged(data) => data,
            ShuffleOutcome::Shuffled(data) => data.as_slice(),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            ShuffleOutcome::Unchanged(data) => data.to_vec(),
            ShuffleOutcome::Shuffled(data) => data,
        }
    }
}

fn check_item_size(item_size: usize, data: &[u8]) -> CodecResult<usize> {
    if data.len() % item_size != 0 {
        return Err(CodecErrorKind::InvalidChunkSize { len: data.len(), item_size }.into());
    }
    Ok(data.len() / item_size)
}

/// Group byte `j` of every element together: `out[j * count + i] = data[i * item_size + j]`.
pub fn shuffle(item_size: usize, data: &[u8]) -> CodecResult<ShuffleOutcome<'_>> {
    if item_size <= 1 {
        return Ok(ShuffleOutcome::Unchanged(data));
    }
    let count = check_item_size(item_size, data)?;
    let mut out = vec![0u8; data.len()];
    for (i, element) in data.chunks_exact(item_size).enumerate() {
        for (j, byte) in element.iter().enumerate() {
            out[j * count + i] = *byte;
        }
    }
    Ok(ShuffleOutcome::Shuffled(out))
}

pub fn unshuffle(item_size: usize, data: &[u8]) -> CodecResult<ShuffleOutcome<'_>> {
    if item_size <= 1 {
        return Ok(ShuffleOutcome::Unchanged(data));
    }
    let count = check_item_size(item_size, data)?;
    let mut out = vec![0u8; data.len()];
    for (j, plane) in data.chunks_exact(count.max(1)).enumerate().take(item_size) {
        for (i, byte) in plane.iter().enumerate() {
            out[i * item_size + j] = *byte;
        }
    }
    Ok(ShuffleOutcome::Shuffled(out))
}

pub fn compress(data: &[u8], level: u32) -> CodecResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(data).map_err(CodecErrorKind::Compress)?;
    Ok(encoder.finish().map_err(CodecErrorKind::Compress)?)
}

pub fn decompress(data: &[u8]) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    ZlibDecoder::new(data).read_to_end(&mut out).map_err(CodecErrorKind::Decompress)?;
    Ok(out)
}

/// The filters of one dataset, resolved into the transforms this engine applies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterPipeline {
    shuffle_item_size: Option<usize>,
    deflate_level: Option<u32>,
    strict: bool,
}

impl FilterPipeline {
    /// `item_size` is `None` for variable length types, which are never shuffled.
    pub fn new(filters: &[Filter], item_size: Option<usize>, strict: bool) -> Self {
        let mut pipeline = FilterPipeline { strict, ..Default::default() };
        for filter in filters {
            match filter {
                Filter::Shuffle => match item_size {
                    Some(size) => pipeline.shuffle_item_size = Some(size),
                    None => warn!("shuffle filter ignored for variable length data"),
                },
                Filter::Deflate { level } => pipeline.deflate_level = Some(*level),
                Filter::Other { class, .. } => {
                    warn!(filter = class.as_str(), "ignoring unsupported filter")
                }
            }
        }
        pipeline
    }

    pub fn is_identity(&self) -> bool {
        self.shuffle_item_size.is_none() && self.deflate_level.is_none()
    }

    pub fn encode(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let shuffled = match self.shuffle_item_size {
            Some(size) => shuffle(size, data)?,
            None => ShuffleOutcome::Unchanged(data),
        };
        match self.deflate_level {
            Some(level) => compress(shuffled.as_slice(), level),
            None => Ok(shuffled.into_vec()),
        }
    }

    /// Undo [`Self::encode`].
    ///
    /// Unless the pipeline is strict, a payload that fails to inflate is assumed to have
    /// been stored uncompressed and is passed on as is.
    pub fn decode(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let inflated = match self.deflate_level {
            Some(_) => match decompress(data) {
                Ok(inflated) => {
                    debug!(stored = data.len(), inflated = inflated.len(), "decompressed chunk");
                    inflated
                }
                Err(err) if !self.strict => {
                    warn!(error = %err.kind, "unable to decompress chunk, using stored bytes");
                    data.to_vec()
                }
                Err(err) => return Err(err),
            },
            None => data.to_vec(),
        };
        match self.shuffle_item_size {
            Some(size) => Ok(unshuffle(size, &inflated)?.into_vec()),
            None => Ok(inflated),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_strategy::proptest;

    use super::*;

    #[test]
    fn test_shuffle_layout() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let out = shuffle(4, &data).unwrap();
        assert_eq!(out.as_slice(), &[1, 5, 2, 6, 3, 7, 4, 8]);
        assert_eq!(unshuffle(4, out.as_slice()).unwrap().as_slice(), &data);
    }

    #[test]
    fn test_shuffle_noop_is_distinct() {
        assert_eq!(shuffle(1, &[1, 2, 3]).unwrap(), ShuffleOutcome::Unchanged(&[1, 2, 3]));
        assert_eq!(shuffle(0, &[]).unwrap(), ShuffleOutcome::Unchanged(&[]));
        assert_eq!(shuffle(8, &[]).unwrap(), ShuffleOutcome::Shuffled(vec![]));
    }

    #[test]
    fn test_shuffle_rejects_partial_elements() {
        let err = shuffle(4, &[1, 2, 3, 4, 5]).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::InvalidChunkSize { len: 5, item_size: 4 }));
        assert!(unshuffle(3, &[1, 2]).is_err());
    }

    #[proptest]
    fn test_shuffle_involution(
        #[strategy(2usize..16)] item_size: usize,
        #[strategy(0usize..64)] count: usize,
        #[strategy(proptest::collection::vec(any::<u8>(), #count * #item_size))] data: Vec<u8>,
    ) {
        let shuffled = shuffle(item_size, &data).unwrap().into_vec();
        prop_assert_eq!(unshuffle(item_size, &shuffled).unwrap().into_vec(), data);
    }

    #[test]
    fn test_pipeline_order() {
        let data: Vec<u8> = (0..4000u32).flat_map(|i| i.to_le_bytes()).collect();
        let pipeline =
            FilterPipeline::new(&[Filter::Shuffle, Filter::Deflate { level: 9 }], Some(4), true);
        let encoded = pipeline.encode(&data).unwrap();
        assert!(encoded.len() < data.len());
        // the stored payload is the deflated shuffle
        assert_eq!(decompress(&encoded).unwrap(), shuffle(4, &data).unwrap().into_vec());
        assert_eq!(pipeline.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_decompress_fallback() {
        let raw = vec![7u8; 32];
        let lenient = FilterPipeline::new(&[Filter::Deflate { level: 5 }], Some(4), false);
        assert_eq!(lenient.decode(&raw).unwrap(), raw);

        let strict = FilterPipeline::new(&[Filter::Deflate { level: 5 }], Some(4), true);
        let err = strict.decode(&raw).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::Decompress(_)));
    }

    #[test]
    fn test_variable_length_is_never_shuffled() {
        let pipeline = FilterPipeline::new(&[Filter::Shuffle], None, false);
        assert!(pipeline.is_identity());
    }

    #[test]
    fn test_filter_descriptors() {
        let filters: Vec<Filter> = serde_json::from_str(
            r#"[{"class": "H5Z_FILTER_SHUFFLE", "id": 2, "name": "shuffle"},
                {"class": "H5Z_FILTER_DEFLATE", "id": 1, "level": 9},
                {"class": "H5Z_FILTER_USER", "name": "gzip"},
                {"class": "H5Z_FILTER_LZF", "id": 32000, "name": "lzf"}]"#,
        )
        .unwrap();
        assert_eq!(filters[0], Filter::Shuffle);
        assert_eq!(filters[1], Filter::Deflate { level: 9 });
        assert_eq!(filters[2], Filter::Deflate { level: DEFAULT_DEFLATE_LEVEL });
        assert!(matches!(&filters[3], Filter::Other { id: Some(32000), .. }));
    }
}
