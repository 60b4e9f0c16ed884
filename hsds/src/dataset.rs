//! What the chunk engine needs to know about a dataset.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use thiserror::Error;
use tracing::warn;

use crate::{
    array::{ArrayResult, ChunkArray, DataType, buffer_len},
    codec::{Filter, FilterPipeline},
    error::HsdsError,
    format::{ChunkIndices, IdResult, ObjectId},
};

/// How a dataset's chunks are stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Layout {
    /// Chunks written by this service under their own keys.
    #[serde(rename = "H5D_CHUNKED")]
    Chunked { dims: Vec<u64> },
    /// The whole dataset is one byte range of a foreign file, read in row-aligned chunks.
    #[serde(rename = "H5D_CONTIGUOUS_REF")]
    ContiguousRef { file_uri: String, offset: u64, size: u64, dims: Vec<u64> },
    /// Each chunk is an explicit byte range of a foreign file, keyed by its `i_j` suffix.
    #[serde(rename = "H5D_CHUNKED_REF")]
    ChunkedRef { file_uri: String, dims: Vec<u64>, chunks: BTreeMap<String, (u64, u64)> },
    /// Byte ranges are stored in an index dataset with one element per chunk.
    #[serde(rename = "H5D_CHUNKED_REF_INDIRECT")]
    ChunkedRefIndirect {
        file_uri: Option<String>,
        dims: Vec<u64>,
        chunk_table: Box<DatasetDescriptor>,
    },
}

impl Layout {
    pub fn dims(&self) -> &[u64] {
        match self {
            Layout::Chunked { dims }
            | Layout::ContiguousRef { dims, .. }
            | Layout::ChunkedRef { dims, .. }
            | Layout::ChunkedRefIndirect { dims, .. } => dims,
        }
    }

    /// Reference layouts are read-only views over files this service did not write.
    pub fn is_reference(&self) -> bool {
        !matches!(self, Layout::Chunked { .. })
    }
}

/// Computes the chunks of a dataset that were never written, in place of the fill value.
///
/// Serialized as a command line, e.g. `["arange", "--start=10", "--step=0.5"]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub enum ChunkInitializer {
    /// Element `i` of a one dimensional numeric dataset holds `start + i * step`.
    Arange { start: f64, step: f64 },
    /// A program run outside of the data node, such as `chunklocator`. Never run here,
    /// chunks fall back to the fill value.
    External(Vec<String>),
}

impl TryFrom<Vec<String>> for ChunkInitializer {
    type Error = DescriptorErrorKind;

    fn try_from(args: Vec<String>) -> Result<Self, Self::Error> {
        let Some((command, options)) = args.split_first() else {
            return Err(DescriptorErrorKind::Initializer("empty command".to_string()));
        };
        if command != "arange" {
            return Ok(ChunkInitializer::External(args));
        }
        let (mut start, mut step) = (0.0, 1.0);
        for option in options {
            let parsed = match option.split_once('=') {
                Some(("--start", value)) => value.parse::<f64>().map(|v| start = v),
                Some(("--step", value)) => value.parse::<f64>().map(|v| step = v),
                _ => {
                    warn!(option, "ignoring unknown arange option");
                    Ok(())
                }
            };
            parsed.map_err(|_| DescriptorErrorKind::Initializer(format!("invalid option {option}")))?;
        }
        Ok(ChunkInitializer::Arange { start, step })
    }
}

impl From<ChunkInitializer> for Vec<String> {
    fn from(initializer: ChunkInitializer) -> Self {
        match initializer {
            ChunkInitializer::Arange { start, step } => {
                vec!["arange".to_string(), format!("--start={start}"), format!("--step={step}")]
            }
            ChunkInitializer::External(args) => args,
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: ObjectId,
    pub dtype: DataType,
    pub shape: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_shape: Option<Vec<u64>>,
    pub layout: Layout,
    #[serde(default)]
    pub filters: Vec<Filter>,
    /// One encoded element; chunks that were never written read as this value.
    #[serde_as(as = "Option<Hex>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<ChunkInitializer>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorErrorKind {
    #[error("dataset {0} is not a dataset id")]
    NotADataset(String),
    #[error("chunk layout {dims:?} does not match dataset shape {shape:?}")]
    LayoutRank { dims: Vec<u64>, shape: Vec<u64> },
    #[error("chunk layout {0:?} has an empty dimension")]
    EmptyChunkDimension(Vec<u64>),
    #[error("reference layouts require a fixed size element type")]
    VariableLengthReference,
    #[error("chunk table must have the same rank as the dataset")]
    ChunkTableRank,
    #[error("chunk table of an indirect layout cannot itself be a reference")]
    NestedChunkTable,
    #[error("chunk layout {0:?} does not fit in memory")]
    ChunkTooLarge(Vec<u64>),
    #[error("invalid chunk initializer: {0}")]
    Initializer(String),
}

pub type DescriptorError = HsdsError<DescriptorErrorKind>;

impl<E> From<E> for DescriptorError
where
    E: Into<DescriptorErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl DatasetDescriptor {
    /// A dataset chunked the usual way, with no filters and zero fill.
    pub fn chunked(id: ObjectId, dtype: DataType, shape: Vec<u64>, chunks: Vec<u64>) -> Self {
        DatasetDescriptor {
            id,
            dtype,
            shape,
            max_shape: None,
            layout: Layout::Chunked { dims: chunks },
            filters: vec![],
            fill_value: None,
            partition_count: None,
            initializer: None,
        }
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_fill_value(mut self, fill_value: Vec<u8>) -> Self {
        self.fill_value = Some(fill_value);
        self
    }

    pub fn with_initializer(mut self, initializer: ChunkInitializer) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn chunk_shape(&self) -> &[u64] {
        self.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn item_size(&self) -> Option<usize> {
        self.dtype.item_size()
    }

    pub fn is_reference(&self) -> bool {
        self.layout.is_reference()
    }

    /// Number of bytes a materialized chunk of this dataset takes, `None` for variable
    /// length types or chunks too large to address.
    pub fn chunk_nbytes(&self) -> Option<usize> {
        buffer_len(self.chunk_shape(), self.item_size()?)
    }

    pub fn pipeline(&self, strict: bool) -> FilterPipeline {
        FilterPipeline::new(&self.filters, self.item_size(), strict)
    }

    /// Id of the chunk at `coord`, partitioned when the dataset is.
    pub fn chunk_id(&self, coord: ChunkIndices) -> IdResult<ObjectId> {
        let id = ObjectId::chunk(&self.id, coord)?;
        match self.partition_count {
            Some(count) => id.partitioned(count),
            None => Ok(id),
        }
    }

    pub fn fill_chunk(&self) -> ArrayResult<ChunkArray> {
        ChunkArray::filled(
            self.dtype.clone(),
            self.chunk_shape().to_vec(),
            self.fill_value.as_deref(),
        )
    }

    /// Contents of the chunk at `coord` before anything was written to it.
    pub fn initial_chunk(&self, coord: &ChunkIndices) -> ArrayResult<ChunkArray> {
        match &self.initializer {
            Some(ChunkInitializer::Arange { start, step }) => {
                // one dimensional, checked by validate
                let len = self.chunk_shape().first().copied().unwrap_or(1);
                let offset = coord.0.first().map(|index| index.saturating_mul(len)).unwrap_or(0);
                ChunkArray::arange(self.dtype.clone(), offset, len, *start, *step)
            }
            Some(ChunkInitializer::External(args)) => {
                warn!(dataset = %self.id, ?args, "external chunk initializer not supported, using the fill value");
                self.fill_chunk()
            }
            None => self.fill_chunk(),
        }
    }

    /// Check the descriptor is consistent before any chunk of it is touched.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if !matches!(self.id, ObjectId::Dataset(_)) {
            return Err(DescriptorErrorKind::NotADataset(self.id.to_string()).into());
        }
        let dims = self.chunk_shape();
        if dims.len() != self.shape.len() {
            return Err(DescriptorErrorKind::LayoutRank {
                dims: dims.to_vec(),
                shape: self.shape.clone(),
            }
            .into());
        }
        if dims.contains(&0) {
            return Err(DescriptorErrorKind::EmptyChunkDimension(dims.to_vec()).into());
        }
        if self.is_reference() && self.dtype.is_variable_length() {
            return Err(DescriptorErrorKind::VariableLengthReference.into());
        }
        if self.item_size().is_some() && self.chunk_nbytes().is_none() {
            return Err(DescriptorErrorKind::ChunkTooLarge(dims.to_vec()).into());
        }
        match &self.initializer {
            Some(_) if self.is_reference() => {
                return Err(DescriptorErrorKind::Initializer(
                    "reference layouts cannot be initialized".to_string(),
                )
                .into());
            }
            Some(ChunkInitializer::Arange { .. }) if self.rank() != 1 => {
                return Err(DescriptorErrorKind::Initializer(
                    "arange needs a one dimensional dataset".to_string(),
                )
                .into());
            }
            Some(ChunkInitializer::Arange { .. }) if !self.dtype.is_numeric() => {
                return Err(DescriptorErrorKind::Initializer(format!(
                    "arange needs an integer or float type, not {:?}",
                    self.dtype
                ))
                .into());
            }
            _ => {}
        }
        if let Layout::ChunkedRefIndirect { chunk_table, .. } = &self.layout {
            if chunk_table.rank() != self.rank() {
                return Err(DescriptorErrorKind::ChunkTableRank.into());
            }
            if chunk_table.is_reference() {
                return Err(DescriptorErrorKind::NestedChunkTable.into());
            }
            chunk_table.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::array::Field;

    fn dataset_id() -> ObjectId {
        "d-be5e2b34-7f5a-11e8-aa3f-0242ac120004".parse().unwrap()
    }

    #[test]
    fn test_descriptor_json() {
        let json = serde_json::json!({
            "id": "d-be5e2b34-7f5a-11e8-aa3f-0242ac120004",
            "dtype": "Int32",
            "shape": [100, 100],
            "layout": {
                "class": "H5D_CHUNKED_REF",
                "file_uri": "s3://hdf5-data/sample.h5",
                "dims": [50, 50],
                "chunks": {"0_0": [2048, 10000], "1_1": [12048, 10000]}
            },
            "filters": [{"class": "H5Z_FILTER_DEFLATE", "id": 1, "level": 9}],
            "fill_value": "ffffffff"
        });
        let desc: DatasetDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(desc.chunk_shape(), &[50, 50]);
        assert!(desc.is_reference());
        assert_eq!(desc.filters, vec![Filter::Deflate { level: 9 }]);
        assert_eq!(desc.fill_value, Some(vec![0xff; 4]));
        assert_eq!(desc.chunk_nbytes(), Some(10000));
        desc.validate().unwrap();

        let back: DatasetDescriptor =
            serde_json::from_str(&serde_json::to_string(&desc).unwrap()).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_chunk_initializer() {
        let json = serde_json::json!({
            "id": "d-be5e2b34-7f5a-11e8-aa3f-0242ac120004",
            "dtype": "Float64",
            "shape": [40],
            "layout": {"class": "H5D_CHUNKED", "dims": [8]},
            "initializer": ["arange", "--start=1.5", "--step=0.25"]
        });
        let desc: DatasetDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(desc.initializer, Some(ChunkInitializer::Arange { start: 1.5, step: 0.25 }));
        desc.validate().unwrap();
        let back: DatasetDescriptor =
            serde_json::from_str(&serde_json::to_string(&desc).unwrap()).unwrap();
        assert_eq!(back, desc);

        // element 16 of the dataset is the first of chunk 2
        let chunk = desc.initial_chunk(&ChunkIndices(vec![2])).unwrap();
        assert_eq!(chunk.row(0).unwrap()["value"], crate::array::Scalar::Float(5.5));

        let locator: ChunkInitializer =
            serde_json::from_value(serde_json::json!(["chunklocator", "--h5path=/dset"])).unwrap();
        assert!(matches!(locator, ChunkInitializer::External(args) if args.len() == 2));
        assert!(serde_json::from_value::<ChunkInitializer>(serde_json::json!([])).is_err());
        assert!(
            serde_json::from_value::<ChunkInitializer>(serde_json::json!(["arange", "--step=x"]))
                .is_err()
        );

        let compound = DatasetDescriptor::chunked(
            dataset_id(),
            DataType::Compound(vec![Field { name: "a".to_string(), dtype: DataType::Int8 }]),
            vec![10],
            vec![10],
        )
        .with_initializer(ChunkInitializer::Arange { start: 0.0, step: 1.0 });
        assert!(matches!(compound.validate().unwrap_err().kind, DescriptorErrorKind::Initializer(_)));
    }

    #[test]
    fn test_oversized_chunk_layout() {
        let desc = DatasetDescriptor::chunked(
            dataset_id(),
            DataType::Int64,
            vec![u64::MAX, u64::MAX],
            vec![u64::MAX, 4],
        );
        assert_eq!(desc.chunk_nbytes(), None);
        assert!(matches!(desc.validate().unwrap_err().kind, DescriptorErrorKind::ChunkTooLarge(_)));
    }

    #[test]
    fn test_partitioned_chunk_id() {
        let mut desc =
            DatasetDescriptor::chunked(dataset_id(), DataType::Int8, vec![100], vec![10]);
        assert_eq!(
            desc.chunk_id(ChunkIndices(vec![3])).unwrap().to_string(),
            "c-be5e2b34-7f5a-11e8-aa3f-0242ac120004_3"
        );
        desc.partition_count = Some(4);
        // 3 * 29 = 87, 87 % 4 = 3
        assert_eq!(desc.chunk_id(ChunkIndices(vec![3])).unwrap().partition(), Some(3));
    }

    #[test]
    fn test_validate() {
        let desc = DatasetDescriptor::chunked(dataset_id(), DataType::Int8, vec![100], vec![10]);
        desc.validate().unwrap();

        let bad = DatasetDescriptor::chunked(dataset_id(), DataType::Int8, vec![100], vec![0]);
        assert!(matches!(
            bad.validate().unwrap_err().kind,
            DescriptorErrorKind::EmptyChunkDimension(_)
        ));

        let bad =
            DatasetDescriptor::chunked(dataset_id(), DataType::Int8, vec![100, 4], vec![10]);
        assert!(matches!(bad.validate().unwrap_err().kind, DescriptorErrorKind::LayoutRank { .. }));

        let group = "g-be5e2b34-7f5a-11e8-aa3f-0242ac120004".parse().unwrap();
        let bad = DatasetDescriptor::chunked(group, DataType::Int8, vec![100], vec![10]);
        assert!(matches!(bad.validate().unwrap_err().kind, DescriptorErrorKind::NotADataset(_)));

        let table_dtype = DataType::Compound(vec![
            Field { name: "offset".to_string(), dtype: DataType::UInt64 },
            Field { name: "size".to_string(), dtype: DataType::UInt32 },
        ]);
        let table = DatasetDescriptor::chunked(dataset_id(), table_dtype, vec![10], vec![10]);
        let mut nested = table.clone();
        nested.layout = Layout::ChunkedRefIndirect {
            file_uri: None,
            dims: vec![10],
            chunk_table: Box::new(table.clone()),
        };
        let indirect = DatasetDescriptor {
            layout: Layout::ChunkedRefIndirect {
                file_uri: Some("bucket/file.h5".to_string()),
                dims: vec![10],
                chunk_table: Box::new(nested),
            },
            ..DatasetDescriptor::chunked(dataset_id(), DataType::Int8, vec![100], vec![10])
        };
        assert!(matches!(
            indirect.validate().unwrap_err().kind,
            DescriptorErrorKind::NestedChunkTable
        ));
    }
}
