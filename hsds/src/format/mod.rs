//! Object identifiers and the storage keys they are persisted under.
//!
//! Two generations of ids coexist in the same buckets. Schema v1 ids are a type prefix and a
//! standard UUID; their keys get a hash prefix to spread objects across the keyspace. Schema
//! v2 ids carry a 32 hex digit token whose first half is shared by every object under the
//! same root, so all objects of a domain live under one `db/<root>` folder.
use core::fmt;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::HsdsError;

pub mod keys;
pub mod object_id;

pub use keys::{id_to_key, key_to_id};
pub use object_id::{ObjectId, ObjectKind, Schema, Token};

/// Zero based position of a chunk in the dataset's chunk grid, one entry per dimension.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkIndices(pub Vec<u64>);

impl ChunkIndices {
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Dataset coordinate of the chunk's first element.
    pub fn origin(&self, chunk_shape: &[u64]) -> Vec<u64> {
        self.0.iter().zip(chunk_shape).map(|(i, c)| i * c).collect()
    }
}

impl fmt::Display for ChunkIndices {
    /// The `i_j_k` suffix used both in chunk ids and in chunk keys.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().format("_"))
    }
}

impl FromStr for ChunkIndices {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let indices = s
            .split('_')
            .map(|part| parse_decimal(part).ok_or_else(|| invalid(s, "bad chunk coordinate")))
            .collect::<IdResult<Vec<_>>>()?;
        Ok(ChunkIndices(indices))
    }
}

impl From<Vec<u64>> for ChunkIndices {
    fn from(value: Vec<u64>) -> Self {
        ChunkIndices(value)
    }
}

/// Parse a canonical decimal: no sign, no leading zeros, so that it renders back identically.
pub(crate) fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdErrorKind {
    #[error("invalid identifier `{value}`: {reason}")]
    InvalidIdentifier { value: String, reason: &'static str },
    #[error("operation not supported for `{value}`: {reason}")]
    UnsupportedOperation { value: String, reason: &'static str },
}

pub type IdError = HsdsError<IdErrorKind>;

impl<E> From<E> for IdError
where
    E: Into<IdErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type IdResult<A> = Result<A, IdError>;

pub(crate) fn invalid(value: &str, reason: &'static str) -> IdError {
    IdErrorKind::InvalidIdentifier { value: value.to_string(), reason }.into()
}

pub(crate) fn unsupported(value: &str, reason: &'static str) -> IdError {
    IdErrorKind::UnsupportedOperation { value: value.to_string(), reason }.into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_indices_suffix() {
        let idx = ChunkIndices(vec![6, 0, 12]);
        assert_eq!(idx.to_string(), "6_0_12");
        assert_eq!("6_0_12".parse::<ChunkIndices>().unwrap(), idx);
        assert_eq!(idx.origin(&[10, 10, 5]), vec![60, 0, 60]);
    }

    #[test]
    fn test_chunk_indices_reject_non_canonical() {
        for bad in ["", "1__2", "01", "1_-2", "a", "1_2_"] {
            assert!(bad.parse::<ChunkIndices>().is_err(), "{bad} should not parse");
        }
    }
}
