//! Hyperslab and point selections over N-dimensional datasets.
use core::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::HsdsError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionErrorKind {
    #[error("selection has rank {actual}, dataset has rank {expected}")]
    RankMismatch { expected: usize, actual: usize },
    #[error("invalid {field} {value} for dimension {dim} with extent {extent}")]
    OutOfBounds { dim: usize, field: &'static str, value: u64, extent: u64 },
    #[error("invalid step {step} for dimension {dim}")]
    InvalidStep { dim: usize, step: u64 },
    #[error("point {point:?} is outside of shape {shape:?}")]
    PointOutOfBounds { point: Vec<u64>, shape: Vec<u64> },
    #[error("cannot parse selection `{0}`")]
    Malformed(String),
    #[error("invalid chunk shape {0:?}")]
    InvalidChunkShape(Vec<u64>),
}

pub type SelectionError = HsdsError<SelectionErrorKind>;

impl<E> From<E> for SelectionError
where
    E: Into<SelectionErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type SelectionResult<A> = Result<A, SelectionError>;

/// `start..stop` every `step` along one axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceDim {
    pub start: u64,
    pub stop: u64,
    pub step: u64,
}

impl SliceDim {
    pub fn new(start: u64, stop: u64, step: u64) -> Self {
        Self { start, stop, step }
    }

    pub fn full(extent: u64) -> Self {
        Self { start: 0, stop: extent, step: 1 }
    }

    pub fn count(&self) -> u64 {
        if self.stop <= self.start || self.step == 0 {
            0
        } else {
            (self.stop - self.start).div_ceil(self.step)
        }
    }

    /// The last selected coordinate.
    pub fn last(&self) -> Option<u64> {
        match self.count() {
            0 => None,
            n => Some(self.start + (n - 1) * self.step),
        }
    }

    pub fn points(&self) -> impl Iterator<Item = u64> + use<> {
        let step = self.step.max(1) as usize;
        (self.start..self.stop).step_by(step)
    }
}

impl fmt::Display for SliceDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.step == 1 {
            write!(f, "{}:{}", self.start, self.stop)
        } else {
            write!(f, "{}:{}:{}", self.start, self.stop, self.step)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection(pub Vec<SliceDim>);

impl Selection {
    pub fn all(shape: &[u64]) -> Self {
        Selection(shape.iter().map(|extent| SliceDim::full(*extent)).collect())
    }

    /// Build and validate a selection from optional per-dimension start, stop and step.
    ///
    /// Missing lists default to the whole extent with unit step. Explicit values must satisfy
    /// `start < extent`, `start < stop <= extent` and `1 <= step <= extent`.
    pub fn hyperslab(
        shape: &[u64],
        start: Option<&[u64]>,
        stop: Option<&[u64]>,
        step: Option<&[u64]>,
    ) -> SelectionResult<Self> {
        let rank = shape.len();
        for list in [start, stop, step].into_iter().flatten() {
            if list.len() != rank {
                return Err(SelectionErrorKind::RankMismatch {
                    expected: rank,
                    actual: list.len(),
                }
                .into());
            }
        }
        let mut dims = Vec::with_capacity(rank);
        for (dim, extent) in shape.iter().copied().enumerate() {
            let begin = start.map(|s| s[dim]).unwrap_or(0);
            if start.is_some() && begin >= extent {
                return Err(out_of_bounds(dim, "start", begin, extent));
            }
            let end = stop.map(|s| s[dim]).unwrap_or(extent);
            if stop.is_some() && (end <= begin || end > extent) {
                return Err(out_of_bounds(dim, "stop", end, extent));
            }
            let stride = step.map(|s| s[dim]).unwrap_or(1);
            if stride == 0 || (step.is_some() && stride > extent) {
                return Err(SelectionErrorKind::InvalidStep { dim, step: stride }.into());
            }
            dims.push(SliceDim::new(begin, end, stride));
        }
        Ok(Selection(dims))
    }

    /// Parse the `[start:stop:step, index, :]` query form, one entry per dimension.
    pub fn parse(expr: &str, shape: &[u64]) -> SelectionResult<Self> {
        let malformed = || SelectionError::from(SelectionErrorKind::Malformed(expr.to_string()));
        let body = expr
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(malformed)?;
        let entries: Vec<&str> = body.split(',').map(str::trim).collect();
        if entries.len() != shape.len() {
            return Err(SelectionErrorKind::RankMismatch {
                expected: shape.len(),
                actual: entries.len(),
            }
            .into());
        }

        let parse_num = |s: &str, default: u64| -> SelectionResult<u64> {
            if s.is_empty() { Ok(default) } else { s.parse().map_err(|_| malformed()) }
        };
        let mut dims = Vec::with_capacity(shape.len());
        for (dim, (entry, extent)) in entries.iter().zip(shape).enumerate() {
            let parts: Vec<&str> = entry.split(':').collect();
            let slice = match parts.as_slice() {
                [index] => {
                    let index = parse_num(index, 0)?;
                    SliceDim::new(index, index + 1, 1)
                }
                [start, stop] => SliceDim::new(parse_num(start, 0)?, parse_num(stop, *extent)?, 1),
                [start, stop, step] => SliceDim::new(
                    parse_num(start, 0)?,
                    parse_num(stop, *extent)?,
                    parse_num(step, 1)?,
                ),
                _ => return Err(malformed()),
            };
            if slice.start >= *extent && *extent > 0 {
                return Err(out_of_bounds(dim, "start", slice.start, *extent));
            }
            if slice.stop > *extent || slice.stop < slice.start {
                return Err(out_of_bounds(dim, "stop", slice.stop, *extent));
            }
            if slice.step == 0 {
                return Err(SelectionErrorKind::InvalidStep { dim, step: 0 }.into());
            }
            dims.push(slice);
        }
        Ok(Selection(dims))
    }

    /// Fails unless the selection has the dataset's rank and stays within its extents.
    pub fn check_within(&self, shape: &[u64]) -> SelectionResult<()> {
        if self.rank() != shape.len() {
            return Err(SelectionErrorKind::RankMismatch {
                expected: shape.len(),
                actual: self.rank(),
            }
            .into());
        }
        for (dim, (slice, extent)) in self.0.iter().zip(shape).enumerate() {
            if slice.step == 0 {
                return Err(SelectionErrorKind::InvalidStep { dim, step: 0 }.into());
            }
            if slice.stop > *extent || slice.start > slice.stop {
                return Err(out_of_bounds(dim, "stop", slice.stop, *extent));
            }
        }
        Ok(())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[SliceDim] {
        &self.0
    }

    /// Shape of the array the selection reads into.
    pub fn shape(&self) -> Vec<u64> {
        self.0.iter().map(SliceDim::count).collect()
    }

    pub fn num_elements(&self) -> u64 {
        self.0.iter().map(SliceDim::count).product()
    }

    pub fn is_empty(&self) -> bool {
        self.num_elements() == 0
    }

    /// Selected coordinates in row-major order.
    pub fn positions(&self) -> Positions {
        let current = if self.rank() == 0 || self.is_empty() {
            None
        } else {
            Some(self.0.iter().map(|s| s.start).collect())
        };
        Positions { dims: self.0.clone(), current }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.iter().format(","))
    }
}

fn out_of_bounds(dim: usize, field: &'static str, value: u64, extent: u64) -> SelectionError {
    SelectionErrorKind::OutOfBounds { dim, field, value, extent }.into()
}

/// Row-major odometer over the coordinates of a selection.
#[derive(Debug, Clone)]
pub struct Positions {
    dims: Vec<SliceDim>,
    current: Option<Vec<u64>>,
}

impl Iterator for Positions {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.current.clone()?;
        let mut finished = true;
        if let Some(current) = self.current.as_mut() {
            for (pos, slice) in current.iter_mut().zip(&self.dims).rev() {
                let next = *pos + slice.step;
                if next < slice.stop {
                    *pos = next;
                    finished = false;
                    break;
                }
                *pos = slice.start;
            }
        }
        if finished {
            self.current = None;
        }
        Some(result)
    }
}

/// Offset of `point` in a row-major array of `shape`.
pub fn flat_index(shape: &[u64], point: &[u64]) -> u64 {
    point.iter().zip(shape).fold(0, |acc, (p, extent)| acc * extent + p)
}

pub fn check_points(points: &[Vec<u64>], shape: &[u64]) -> SelectionResult<()> {
    for point in points {
        if point.len() != shape.len() {
            return Err(SelectionErrorKind::RankMismatch {
                expected: shape.len(),
                actual: point.len(),
            }
            .into());
        }
        if point.iter().zip(shape).any(|(p, extent)| p >= extent) {
            return Err(SelectionErrorKind::PointOutOfBounds {
                point: point.clone(),
                shape: shape.to_vec(),
            }
            .into());
        }
    }
    Ok(())
}
