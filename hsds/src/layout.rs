//! Chunk shape heuristics and the decomposition of selections into chunks.
use std::collections::HashMap;

use itertools::Itertools;
use tracing::warn;

use crate::{
    config::LayoutConfig,
    format::{ChunkIndices, IdResult, ObjectId},
    selection::{Selection, SelectionErrorKind, SelectionResult, SliceDim},
};

/// Item size assumed for variable length types when sizing chunks.
pub const VARLEN_ITEM_SIZE_GUESS: usize = 128;

/// Proposes and adjusts chunk shapes so chunk payloads stay inside the configured byte band.
#[derive(Clone, Debug, Default)]
pub struct LayoutPlanner {
    config: LayoutConfig,
}

/// Payload size of a chunk, saturating at `u64::MAX`.
fn chunk_bytes(layout: &[u64], item_size: usize) -> u64 {
    layout
        .iter()
        .try_fold(item_size as u64, |bytes, extent| bytes.checked_mul(*extent))
        .unwrap_or(u64::MAX)
}

/// `max_shape` if it has one entry per dimension of `shape`.
fn usable_max_shape<'a>(shape: &[u64], max_shape: Option<&'a [u64]>) -> Option<&'a [u64]> {
    match max_shape {
        Some(max) if max.len() != shape.len() => {
            warn!(?shape, ?max, "ignoring max shape of a different rank");
            None
        }
        max => max,
    }
}

impl LayoutPlanner {
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Default chunk shape for a dataset.
    ///
    /// `shape` entries of zero are unbounded. `max_shape` bounds how far chunks may grow
    /// along extensible dimensions (zero meaning unlimited). `item_size` is `None` for
    /// variable length types.
    pub fn guess_chunk_shape(
        &self,
        shape: &[u64],
        max_shape: Option<&[u64]>,
        item_size: Option<usize>,
    ) -> Vec<u64> {
        if shape.is_empty() {
            return vec![1];
        }
        let item_size = item_size.unwrap_or(VARLEN_ITEM_SIZE_GUESS);
        let max_shape = usable_max_shape(shape, max_shape);
        let declared = max_shape.unwrap_or(shape);
        let layout: Vec<u64> = declared
            .iter()
            .map(|extent| if *extent == 0 { self.config.unlimited_extent_guess } else { *extent })
            .collect();
        let layout = self.shrink_chunk_shape(&layout, item_size);
        self.expand_chunk_shape(&layout, item_size, shape, max_shape)
    }

    /// Grow a chunk shape until it holds at least `min_chunk_bytes`.
    ///
    /// Dimensions are doubled in turn starting from the last one. A dataset smaller than the
    /// minimum with no room to grow becomes a single chunk.
    pub fn expand_chunk_shape(
        &self,
        layout: &[u64],
        item_size: usize,
        shape: &[u64],
        max_shape: Option<&[u64]>,
    ) -> Vec<u64> {
        let min = self.config.min_chunk_bytes;
        if layout.len() != shape.len() {
            warn!(?layout, ?shape, "chunk shape rank does not match the dataset");
            return layout.to_vec();
        }
        let max_shape = usable_max_shape(shape, max_shape);
        let bounds: Vec<Option<u64>> = shape
            .iter()
            .enumerate()
            .map(|(dim, extent)| match max_shape.map(|m| m[dim]) {
                Some(0) => None,
                Some(max) => Some(max.max(*extent)),
                None if *extent == 0 => None,
                None => Some(*extent),
            })
            .collect();
        let extensible = bounds
            .iter()
            .zip(shape)
            .any(|(bound, extent)| bound.is_none_or(|b| b > *extent));

        let dataset_bytes = chunk_bytes(
            &shape.iter().map(|e| (*e).max(1)).collect::<Vec<_>>(),
            item_size,
        );
        if dataset_bytes <= min && !extensible {
            return shape.to_vec();
        }

        let mut layout = layout.to_vec();
        let mut size = chunk_bytes(&layout, item_size);
        while size < min {
            let before = size;
            for dim in (0..layout.len()).rev() {
                let grown = match bounds[dim] {
                    None => layout[dim].saturating_mul(2),
                    Some(bound) if layout[dim] < bound => layout[dim].saturating_mul(2).min(bound),
                    Some(_) => continue,
                };
                layout[dim] = grown;
                size = chunk_bytes(&layout, item_size);
                if size >= min {
                    break;
                }
            }
            if size <= before {
                warn!(?layout, size, min, "unable to grow chunk shape to the minimum size");
                break;
            }
        }
        layout
    }

    /// Halve dimensions, first dimension first and rounding up, until the chunk holds at
    /// most `max_chunk_bytes`.
    pub fn shrink_chunk_shape(&self, layout: &[u64], item_size: usize) -> Vec<u64> {
        let max = self.config.max_chunk_bytes;
        let mut layout = layout.to_vec();
        let mut size = chunk_bytes(&layout, item_size);
        while size > max {
            let mut shrunk = false;
            for dim in 0..layout.len() {
                if layout[dim] > 1 {
                    layout[dim] = layout[dim].div_ceil(2);
                    shrunk = true;
                    size = chunk_bytes(&layout, item_size);
                    if size <= max {
                        break;
                    }
                }
            }
            if !shrunk {
                warn!(?layout, size, max, "unable to shrink chunk shape to the maximum size");
                break;
            }
        }
        layout
    }

    /// Chunk shape used to read a contiguous dataset inside a foreign file.
    ///
    /// Keeps full rows along trailing dimensions so every chunk is one contiguous byte range.
    pub fn contiguous_chunk_shape(&self, shape: &[u64], item_size: usize) -> Vec<u64> {
        let max = self.config.contiguous_max_bytes.max(self.config.contiguous_min_bytes);
        if shape.is_empty() {
            return vec![1];
        }
        if shape.contains(&0) {
            return shape.to_vec();
        }
        let mut layout = vec![1u64; shape.len()];
        let mut nsize = item_size as u64;
        for dim in (0..shape.len()).rev() {
            let extent = shape[dim];
            if extent.checked_mul(nsize).is_some_and(|bytes| bytes < max) {
                layout[dim] = extent;
                nsize *= extent;
            } else {
                let mut n = extent;
                while n > 1 {
                    n = n.div_ceil(2);
                    if n.checked_mul(nsize).is_some_and(|bytes| bytes < max) {
                        break;
                    }
                }
                layout[dim] = n;
                break;
            }
        }
        layout
    }
}

fn check_layout(selection: &Selection, chunk_shape: &[u64]) -> SelectionResult<()> {
    if selection.rank() != chunk_shape.len() {
        return Err(SelectionErrorKind::RankMismatch {
            expected: chunk_shape.len(),
            actual: selection.rank(),
        }
        .into());
    }
    if chunk_shape.contains(&0) {
        return Err(SelectionErrorKind::InvalidChunkShape(chunk_shape.to_vec()).into());
    }
    Ok(())
}

/// Chunk indices touched by one axis of a selection, ascending.
fn axis_chunks(slice: &SliceDim, chunk: u64) -> Vec<u64> {
    match slice.last() {
        None => vec![],
        Some(_) if slice.step > chunk => slice.points().map(|p| p / chunk).dedup().collect(),
        Some(last) => (slice.start / chunk..=last / chunk).collect(),
    }
}

pub fn num_chunks(selection: &Selection, chunk_shape: &[u64]) -> SelectionResult<u64> {
    check_layout(selection, chunk_shape)?;
    if selection.rank() == 0 {
        return Ok(0);
    }
    Ok(selection
        .dims()
        .iter()
        .zip(chunk_shape)
        .map(|(slice, chunk)| match slice.last() {
            None => 0,
            Some(_) if slice.step > *chunk => axis_chunks(slice, *chunk).len() as u64,
            Some(last) => last / chunk - slice.start / chunk + 1,
        })
        .product())
}

/// Coordinates of every chunk the selection intersects, last dimension varying fastest.
pub fn chunk_indices(
    selection: &Selection,
    chunk_shape: &[u64],
) -> SelectionResult<Vec<ChunkIndices>> {
    check_layout(selection, chunk_shape)?;
    if selection.rank() == 0 || selection.is_empty() {
        return Ok(vec![]);
    }
    Ok(selection
        .dims()
        .iter()
        .zip(chunk_shape)
        .map(|(slice, chunk)| axis_chunks(slice, *chunk))
        .multi_cartesian_product()
        .map(ChunkIndices)
        .collect())
}

/// Ids of every chunk of `dataset_id` the selection intersects, in [`chunk_indices`] order.
pub fn chunk_ids(
    dataset_id: &ObjectId,
    selection: &Selection,
    chunk_shape: &[u64],
) -> Result<Vec<ObjectId>, LayoutError> {
    let indices = chunk_indices(selection, chunk_shape).map_err(LayoutError::Selection)?;
    indices
        .into_iter()
        .map(|coord| ObjectId::chunk(dataset_id, coord))
        .collect::<IdResult<Vec<_>>>()
        .map_err(LayoutError::Id)
}

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error(transparent)]
    Selection(crate::selection::SelectionError),
    #[error(transparent)]
    Id(crate::format::IdError),
}

/// The part of `selection` inside the chunk at `coord`, in dataset coordinates.
pub fn chunk_selection(
    coord: &ChunkIndices,
    selection: &Selection,
    chunk_shape: &[u64],
) -> Option<Selection> {
    let mut dims = Vec::with_capacity(selection.rank());
    for ((slice, chunk), index) in selection.dims().iter().zip(chunk_shape).zip(&coord.0) {
        let lo = index * chunk;
        let hi = lo + chunk;
        let first = if slice.start < lo {
            slice.start + (lo - slice.start).div_ceil(slice.step) * slice.step
        } else {
            slice.start
        };
        let stop = slice.stop.min(hi);
        if first >= stop {
            return None;
        }
        let last = first + (stop - 1 - first) / slice.step * slice.step;
        dims.push(SliceDim::new(first, last + 1, slice.step));
    }
    Some(Selection(dims))
}

/// [`chunk_selection`] re-based to coordinates inside the chunk.
pub fn chunk_local_selection(
    coord: &ChunkIndices,
    selection: &Selection,
    chunk_shape: &[u64],
) -> Option<Selection> {
    let global = chunk_selection(coord, selection, chunk_shape)?;
    let origin = coord.origin(chunk_shape);
    Some(Selection(
        global
            .dims()
            .iter()
            .zip(origin)
            .map(|(s, o)| SliceDim::new(s.start - o, s.stop - o, s.step))
            .collect(),
    ))
}

/// Positions in the selection-shaped result array that the chunk at `coord` provides.
pub fn data_coverage(
    coord: &ChunkIndices,
    selection: &Selection,
    chunk_shape: &[u64],
) -> Option<Selection> {
    let global = chunk_selection(coord, selection, chunk_shape)?;
    Some(Selection(
        global
            .dims()
            .iter()
            .zip(selection.dims())
            .map(|(c, s)| {
                SliceDim::new(
                    (c.start - s.start) / s.step,
                    (c.stop - s.start).div_ceil(s.step),
                    1,
                )
            })
            .collect(),
    ))
}

/// Group points by the chunk holding them, in order of first appearance.
///
/// Each group lists the positions of its points in `points`.
pub fn chunks_for_points(
    points: &[Vec<u64>],
    chunk_shape: &[u64],
) -> Vec<(ChunkIndices, Vec<usize>)> {
    let mut groups: Vec<(ChunkIndices, Vec<usize>)> = Vec::new();
    let mut lookup: HashMap<ChunkIndices, usize> = HashMap::new();
    for (i, point) in points.iter().enumerate() {
        let coord = ChunkIndices(point.iter().zip(chunk_shape).map(|(p, c)| p / c).collect());
        match lookup.get(&coord) {
            Some(group) => groups[*group].1.push(i),
            None => {
                lookup.insert(coord.clone(), groups.len());
                groups.push((coord, vec![i]));
            }
        }
    }
    groups
}

/// Shape of the grid of chunks covering `shape`.
pub fn chunk_grid_shape(shape: &[u64], chunk_shape: &[u64]) -> Vec<u64> {
    shape.iter().zip(chunk_shape).map(|(e, c)| e.div_ceil((*c).max(1))).collect()
}
