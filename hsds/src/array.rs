//! In-memory chunk arrays and their flat byte representation.
//!
//! A chunk is stored row-major, little endian, one fixed-width element after the other
//! with no padding. Variable length element types cannot be materialized here; their
//! payloads use the length-prefixed encoding of [`encode_vlen`].
use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::HsdsError,
    selection::{Selection, SelectionErrorKind, check_points, flat_index},
};

#[derive(Debug, Error)]
pub enum ArrayErrorKind {
    #[error("buffer of {actual} bytes does not match the expected {expected} bytes")]
    BufferSize { expected: usize, actual: usize },
    #[error("variable length types have no fixed item size")]
    VariableLength,
    #[error("fill value of {actual} bytes does not match item size {expected}")]
    FillValue { expected: usize, actual: usize },
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("cannot convert {value:?} to {dtype:?}")]
    TypeMismatch { value: Scalar, dtype: DataType },
    #[error("variable length element of {0} bytes does not fit a 32 bit length header")]
    ElementTooLarge(usize),
    #[error("truncated variable length buffer")]
    TruncatedVarLen,
    #[error("array of shape {0:?} does not fit in memory")]
    TooLarge(Vec<u64>),
    #[error("invalid selection: {0}")]
    Selection(SelectionErrorKind),
}

pub type ArrayError = HsdsError<ArrayErrorKind>;

impl<E> From<E> for ArrayError
where
    E: Into<ArrayErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type ArrayResult<A> = Result<A, ArrayError>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub dtype: DataType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    FixedString(usize),
    Compound(Vec<Field>),
    VarLen,
}

impl DataType {
    /// Bytes per element, `None` for variable length types.
    pub fn item_size(&self) -> Option<usize> {
        match self {
            DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => Some(8),
            DataType::FixedString(n) => Some(*n),
            DataType::Compound(fields) => {
                fields.iter().map(|f| f.dtype.item_size()).sum::<Option<usize>>()
            }
            DataType::VarLen => None,
        }
    }

    pub fn is_variable_length(&self) -> bool {
        self.item_size().is_none()
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
        )
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, DataType::Float32 | DataType::Float64)
    }
}

/// Bytes taken by an array of `shape`, `None` if that does not fit in a `usize`.
pub fn buffer_len(shape: &[u64], item_size: usize) -> Option<usize> {
    shape
        .iter()
        .try_fold(item_size, |len, extent| len.checked_mul(usize::try_from(*extent).ok()?))
}

/// One field value of one element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Field name to value. Non compound elements expose their value as [`VALUE_FIELD`].
pub type Row = BTreeMap<String, Scalar>;

pub const VALUE_FIELD: &str = "value";

/// Boolean test over one row, supplied by the query language layer.
pub trait RowPredicate: Send + Sync {
    fn evaluate(&self, row: &Row) -> bool;
}

impl<F> RowPredicate for F
where
    F: Fn(&Row) -> bool + Send + Sync,
{
    fn evaluate(&self, row: &Row) -> bool {
        self(row)
    }
}

macro_rules! le_bytes {
    ($ty:ty, $bytes:expr) => {{
        let mut buf = [0u8; std::mem::size_of::<$ty>()];
        buf.copy_from_slice($bytes);
        <$ty>::from_le_bytes(buf)
    }};
}

impl Scalar {
    pub fn decode(dtype: &DataType, bytes: &[u8]) -> ArrayResult<Scalar> {
        let scalar = match dtype {
            DataType::Int8 => Scalar::Int(le_bytes!(i8, bytes) as i64),
            DataType::Int16 => Scalar::Int(le_bytes!(i16, bytes) as i64),
            DataType::Int32 => Scalar::Int(le_bytes!(i32, bytes) as i64),
            DataType::Int64 => Scalar::Int(le_bytes!(i64, bytes)),
            DataType::UInt8 => Scalar::UInt(le_bytes!(u8, bytes) as u64),
            DataType::UInt16 => Scalar::UInt(le_bytes!(u16, bytes) as u64),
            DataType::UInt32 => Scalar::UInt(le_bytes!(u32, bytes) as u64),
            DataType::UInt64 => Scalar::UInt(le_bytes!(u64, bytes)),
            DataType::Float32 => Scalar::Float(le_bytes!(f32, bytes) as f64),
            DataType::Float64 => Scalar::Float(le_bytes!(f64, bytes)),
            DataType::FixedString(_) => {
                let end = bytes.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(0);
                Scalar::Str(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            DataType::Compound(_) | DataType::VarLen => {
                return Err(ArrayErrorKind::VariableLength.into());
            }
        };
        Ok(scalar)
    }

    /// Write this value into `out`, which must be exactly one element of `dtype` wide.
    pub fn encode(&self, dtype: &DataType, out: &mut [u8]) -> ArrayResult<()> {
        let mismatch =
            || ArrayError::from(ArrayErrorKind::TypeMismatch { value: self.clone(), dtype: dtype.clone() });
        let as_i64 = || match self {
            Scalar::Int(v) => Some(*v),
            Scalar::UInt(v) => i64::try_from(*v).ok(),
            Scalar::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        };
        let as_u64 = || match self {
            Scalar::UInt(v) => Some(*v),
            Scalar::Int(v) => u64::try_from(*v).ok(),
            Scalar::Float(v) if v.fract() == 0.0 && *v >= 0.0 => Some(*v as u64),
            _ => None,
        };
        let as_f64 = || match self {
            Scalar::Float(v) => Some(*v),
            Scalar::Int(v) => Some(*v as f64),
            Scalar::UInt(v) => Some(*v as f64),
            Scalar::Str(_) => None,
        };
        macro_rules! put {
            ($value:expr) => {
                out.copy_from_slice(&$value.to_le_bytes())
            };
        }
        match dtype {
            DataType::Int8 => put!(as_i64().and_then(|v| i8::try_from(v).ok()).ok_or_else(mismatch)?),
            DataType::Int16 => put!(as_i64().and_then(|v| i16::try_from(v).ok()).ok_or_else(mismatch)?),
            DataType::Int32 => put!(as_i64().and_then(|v| i32::try_from(v).ok()).ok_or_else(mismatch)?),
            DataType::Int64 => put!(as_i64().ok_or_else(mismatch)?),
            DataType::UInt8 => put!(as_u64().and_then(|v| u8::try_from(v).ok()).ok_or_else(mismatch)?),
            DataType::UInt16 => put!(as_u64().and_then(|v| u16::try_from(v).ok()).ok_or_else(mismatch)?),
            DataType::UInt32 => put!(as_u64().and_then(|v| u32::try_from(v).ok()).ok_or_else(mismatch)?),
            DataType::UInt64 => put!(as_u64().ok_or_else(mismatch)?),
            DataType::Float32 => put!((as_f64().ok_or_else(mismatch)?) as f32),
            DataType::Float64 => put!(as_f64().ok_or_else(mismatch)?),
            DataType::FixedString(n) => {
                let Scalar::Str(s) = self else { return Err(mismatch()) };
                if s.len() > *n {
                    return Err(mismatch());
                }
                out.fill(0);
                out[..s.len()].copy_from_slice(s.as_bytes());
            }
            DataType::Compound(_) | DataType::VarLen => return Err(mismatch()),
        }
        Ok(())
    }
}

/// Byte range of each field inside one element.
fn field_layout(dtype: &DataType) -> Vec<(String, DataType, std::ops::Range<usize>)> {
    match dtype {
        DataType::Compound(fields) => {
            let mut offset = 0;
            fields
                .iter()
                .map(|f| {
                    let size = f.dtype.item_size().unwrap_or(0);
                    let range = offset..offset + size;
                    offset += size;
                    (f.name.clone(), f.dtype.clone(), range)
                })
                .collect()
        }
        other => {
            vec![(VALUE_FIELD.to_string(), other.clone(), 0..other.item_size().unwrap_or(0))]
        }
    }
}

/// The materialized contents of one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkArray {
    dtype: DataType,
    shape: Vec<u64>,
    item_size: usize,
    data: Vec<u8>,
}

impl ChunkArray {
    /// An array where every element is `fill`, or zero when no fill value is declared.
    pub fn filled(dtype: DataType, shape: Vec<u64>, fill: Option<&[u8]>) -> ArrayResult<Self> {
        let item_size = dtype.item_size().ok_or(ArrayErrorKind::VariableLength)?;
        let len = buffer_len(&shape, item_size).ok_or_else(|| ArrayErrorKind::TooLarge(shape.clone()))?;
        let count = len / item_size.max(1);
        let data = match fill {
            Some(fill) if fill.len() != item_size => {
                return Err(ArrayErrorKind::FillValue {
                    expected: item_size,
                    actual: fill.len(),
                }
                .into());
            }
            Some(fill) if fill.iter().any(|b| *b != 0) => fill.repeat(count),
            _ => vec![0u8; len],
        };
        Ok(ChunkArray { dtype, shape, item_size, data })
    }

    /// A one dimensional array of `len` numbers where position `i` holds
    /// `start + (offset + i) * step`.
    ///
    /// For integer types the first value and `step` are truncated to integers before the
    /// sequence is built.
    pub fn arange(dtype: DataType, offset: u64, len: u64, start: f64, step: f64) -> ArrayResult<Self> {
        let item_size = dtype.item_size().ok_or(ArrayErrorKind::VariableLength)?;
        let shape = vec![len];
        let size = buffer_len(&shape, item_size).ok_or_else(|| ArrayErrorKind::TooLarge(shape.clone()))?;
        let mut data = vec![0u8; size];
        let first = start + offset as f64 * step;
        for (i, out) in data.chunks_exact_mut(item_size.max(1)).enumerate() {
            let value = if dtype.is_integer() {
                Scalar::Int((first as i64).saturating_add((i as i64).saturating_mul(step as i64)))
            } else {
                Scalar::Float(first + i as f64 * step)
            };
            value.encode(&dtype, out)?;
        }
        Ok(ChunkArray { dtype, shape, item_size, data })
    }

    pub fn dtype(&self) -> &DataType {
        &self.dtype
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn element(&self, flat: usize) -> &[u8] {
        &self.data[flat * self.item_size..(flat + 1) * self.item_size]
    }

    fn element_mut(&mut self, flat: usize) -> &mut [u8] {
        &mut self.data[flat * self.item_size..(flat + 1) * self.item_size]
    }

    fn offsets(&self, selection: &Selection) -> ArrayResult<impl Iterator<Item = usize> + use<>> {
        selection
            .check_within(&self.shape)
            .map_err(|e| e.inject(ArrayErrorKind::Selection))?;
        let shape = self.shape.clone();
        Ok(selection.positions().map(move |p| flat_index(&shape, &p) as usize))
    }

    fn point_offsets(&self, points: &[Vec<u64>]) -> ArrayResult<Vec<usize>> {
        check_points(points, &self.shape).map_err(|e| e.inject(ArrayErrorKind::Selection))?;
        Ok(points.iter().map(|p| flat_index(&self.shape, p) as usize).collect())
    }

    fn check_len(&self, count: usize, data: &[u8]) -> ArrayResult<()> {
        let expected = count * self.item_size;
        if data.len() != expected {
            return Err(ArrayErrorKind::BufferSize { expected, actual: data.len() }.into());
        }
        Ok(())
    }

    /// Bytes of the selected elements, in selection order. The selection is chunk-local.
    pub fn read_selection(&self, selection: &Selection) -> ArrayResult<Vec<u8>> {
        let mut out = Vec::with_capacity(selection.num_elements() as usize * self.item_size);
        for flat in self.offsets(selection)? {
            out.extend_from_slice(self.element(flat));
        }
        Ok(out)
    }

    /// Overwrite the selected elements. Returns whether any byte changed.
    pub fn write_selection(&mut self, selection: &Selection, data: &[u8]) -> ArrayResult<bool> {
        self.check_len(selection.num_elements() as usize, data)?;
        let offsets: Vec<usize> = self.offsets(selection)?.collect();
        Ok(self.write_elements(&offsets, data))
    }

    pub fn read_points(&self, points: &[Vec<u64>]) -> ArrayResult<Vec<u8>> {
        let mut out = Vec::with_capacity(points.len() * self.item_size);
        for flat in self.point_offsets(points)? {
            out.extend_from_slice(self.element(flat));
        }
        Ok(out)
    }

    pub fn write_points(&mut self, points: &[Vec<u64>], data: &[u8]) -> ArrayResult<bool> {
        self.check_len(points.len(), data)?;
        let offsets = self.point_offsets(points)?;
        Ok(self.write_elements(&offsets, data))
    }

    fn write_elements(&mut self, offsets: &[usize], data: &[u8]) -> bool {
        let item_size = self.item_size;
        let mut changed = false;
        for (flat, value) in offsets.iter().zip(data.chunks_exact(item_size)) {
            let element = self.element_mut(*flat);
            if element != value {
                element.copy_from_slice(value);
                changed = true;
            }
        }
        changed
    }

    pub fn row(&self, flat: usize) -> ArrayResult<Row> {
        let element = self.element(flat);
        field_layout(&self.dtype)
            .into_iter()
            .map(|(name, dtype, range)| Ok((name, Scalar::decode(&dtype, &element[range])?)))
            .collect()
    }

    /// Replace the named fields of one element. Returns whether the element changed.
    pub fn update_row(&mut self, flat: usize, values: &Row) -> ArrayResult<bool> {
        let layout = field_layout(&self.dtype);
        let mut updated = self.element(flat).to_vec();
        for (name, value) in values {
            let (_, dtype, range) = layout
                .iter()
                .find(|(field, ..)| field == name)
                .ok_or_else(|| ArrayErrorKind::UnknownField(name.clone()))?;
            value.encode(dtype, &mut updated[range.clone()])?;
        }
        let element = self.element_mut(flat);
        let changed = element != updated.as_slice();
        element.copy_from_slice(&updated);
        Ok(changed)
    }

    /// Chunk-local coordinates and rows of the selected elements passing `predicate`.
    pub fn query_rows(
        &self,
        selection: &Selection,
        predicate: &dyn RowPredicate,
        limit: Option<usize>,
    ) -> ArrayResult<Vec<(Vec<u64>, Row)>> {
        self.offsets(selection)?;
        let mut matches = Vec::new();
        for position in selection.positions() {
            if limit.is_some_and(|limit| matches.len() >= limit) {
                break;
            }
            let row = self.row(flat_index(&self.shape, &position) as usize)?;
            if predicate.evaluate(&row) {
                matches.push((position, row));
            }
        }
        Ok(matches)
    }
}

pub fn array_to_bytes(array: &ChunkArray) -> Bytes {
    Bytes::copy_from_slice(&array.data)
}

pub fn bytes_to_array(bytes: &[u8], dtype: DataType, shape: Vec<u64>) -> ArrayResult<ChunkArray> {
    let item_size = dtype.item_size().ok_or(ArrayErrorKind::VariableLength)?;
    let expected = buffer_len(&shape, item_size).ok_or_else(|| ArrayErrorKind::TooLarge(shape.clone()))?;
    if bytes.len() != expected {
        return Err(ArrayErrorKind::BufferSize { expected, actual: bytes.len() }.into());
    }
    Ok(ChunkArray { dtype, shape, item_size, data: bytes.to_vec() })
}

/// Concatenate elements, each preceded by its length as a little endian `u32`.
pub fn encode_vlen<I: AsRef<[u8]>>(items: &[I]) -> ArrayResult<Vec<u8>> {
    let total = items.iter().map(|i| i.as_ref().len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for item in items {
        let item = item.as_ref();
        let len = u32::try_from(item.len()).map_err(|_| ArrayErrorKind::ElementTooLarge(item.len()))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(item);
    }
    Ok(out)
}

pub fn decode_vlen(data: &Bytes, count: usize) -> ArrayResult<Vec<Bytes>> {
    let mut items = Vec::with_capacity(count);
    let mut pos = 0;
    for _ in 0..count {
        let header = data.get(pos..pos + 4).ok_or(ArrayErrorKind::TruncatedVarLen)?;
        let len = le_bytes!(u32, header) as usize;
        pos += 4;
        if pos + len > data.len() {
            return Err(ArrayErrorKind::TruncatedVarLen.into());
        }
        items.push(data.slice(pos..pos + len));
        pos += len;
    }
    Ok(items)
}
