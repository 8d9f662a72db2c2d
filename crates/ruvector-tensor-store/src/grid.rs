//! Chunk grid addressing.
//!
//! Pure translation between logical element coordinates and the fixed
//! chunk grid: which chunks a hyper-rectangle touches, the overlap inside
//! each of them, and the contiguous element runs to copy.
//!
//! # Example
//!
//! ```rust
//! use ruvector_tensor_store::grid::ChunkGrid;
//! use ruvector_tensor_store::index::DimRange;
//!
//! let grid = ChunkGrid::new(vec![2, 4, 4], 1).unwrap();
//! let ranges = [
//!     DimRange { start: 3, stop: 4, squeeze: true, open_start: false, open_stop: false },
//!     DimRange::full(4),
//!     DimRange::full(4),
//! ];
//! let overlaps = grid.overlaps(&ranges);
//! assert_eq!(overlaps.len(), 1);
//! assert_eq!(overlaps[0].coord.key(), "0000000001.0000000000.0000000000");
//! ```

use crate::error::{Result, TensorStoreError};
use crate::index::DimRange;
use std::fmt;
use std::ops::Range;

/// Width of one zero-padded coordinate in a chunk key.
pub const CHUNK_KEY_WIDTH: usize = 10;

/// Separator between coordinates in a chunk key.
pub const CHUNK_KEY_SEPARATOR: char = '.';

/// Position of a chunk in the grid, one coordinate per dimension.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ChunkCoord(pub Vec<usize>);

impl ChunkCoord {
    /// Storage key; lexicographic key order equals row-major grid order.
    pub fn key(&self) -> String {
        let mut key = String::with_capacity(self.0.len() * (CHUNK_KEY_WIDTH + 1));
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                key.push(CHUNK_KEY_SEPARATOR);
            }
            key.push_str(&format!("{:0width$}", c, width = CHUNK_KEY_WIDTH));
        }
        key
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Inverse of [`ChunkCoord::key`].
pub fn parse_chunk_key(key: &str) -> Option<ChunkCoord> {
    key.split(CHUNK_KEY_SEPARATOR)
        .map(|part| {
            if part.len() == CHUNK_KEY_WIDTH {
                part.parse::<usize>().ok()
            } else {
                None
            }
        })
        .collect::<Option<Vec<_>>>()
        .map(ChunkCoord)
}

/// Row-major strides (in elements) for `shape`.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Visit every multi-index of the hyper-rectangle `ranges` in row-major order.
pub(crate) fn walk(ranges: &[Range<usize>], mut f: impl FnMut(&[usize])) {
    if ranges.iter().any(|r| r.start >= r.end) {
        return;
    }
    let mut idx: Vec<usize> = ranges.iter().map(|r| r.start).collect();
    loop {
        f(&idx);
        let mut d = ranges.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < ranges[d].end {
                break;
            }
            idx[d] = ranges[d].start;
        }
    }
}

/// Intersection of a request with one chunk.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChunkOverlap {
    pub coord: ChunkCoord,
    /// Element ranges inside the chunk, per dimension.
    pub chunk_ranges: Vec<Range<usize>>,
    /// Element ranges inside the request buffer, per dimension.
    pub request_ranges: Vec<Range<usize>>,
}

impl ChunkOverlap {
    /// Number of elements in the overlap.
    pub fn len(&self) -> usize {
        self.chunk_ranges.iter().map(|r| r.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous element runs `(chunk_offset, request_offset, len)`.
    ///
    /// Runs follow the innermost dimension; runs adjacent in both buffers
    /// are merged, so a fully covered chunk yields a single run.
    pub fn runs(&self, chunk_shape: &[usize], request_shape: &[usize]) -> Vec<(usize, usize, usize)> {
        let rank = self.chunk_ranges.len();
        if rank == 0 || self.is_empty() {
            return Vec::new();
        }
        let chunk_strides = contiguous_strides(chunk_shape);
        let request_strides = contiguous_strides(request_shape);
        let inner = rank - 1;
        let run_len = self.chunk_ranges[inner].len();

        let outer_ranges: Vec<Range<usize>> = (0..inner)
            .map(|d| 0..self.chunk_ranges[d].len())
            .collect();

        let mut runs: Vec<(usize, usize, usize)> = Vec::new();
        let mut visit = |rel: &[usize]| {
            let mut c = self.chunk_ranges[inner].start;
            let mut r = self.request_ranges[inner].start;
            for d in 0..inner {
                c += (self.chunk_ranges[d].start + rel[d]) * chunk_strides[d];
                r += (self.request_ranges[d].start + rel[d]) * request_strides[d];
            }
            match runs.last_mut() {
                Some(last) if last.0 + last.2 == c && last.1 + last.2 == r => last.2 += run_len,
                _ => runs.push((c, r, run_len)),
            }
        };

        if inner == 0 {
            visit(&[]);
        } else {
            walk(&outer_ranges, visit);
        }
        runs
    }
}

/// The division of a tensor's index space into equal-size chunks.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChunkGrid {
    chunks: Vec<usize>,
    elem_size: usize,
}

impl ChunkGrid {
    /// Create a grid with the given chunk shape and element width in bytes.
    pub fn new(chunks: Vec<usize>, elem_size: usize) -> Result<Self> {
        if chunks.is_empty() {
            return Err(TensorStoreError::InvalidShape(
                "chunk shape must have at least one dimension".into(),
            ));
        }
        if chunks.contains(&0) {
            return Err(TensorStoreError::InvalidShape(format!(
                "chunk shape cannot contain zero: {:?}",
                chunks
            )));
        }
        if elem_size == 0 {
            return Err(TensorStoreError::InvalidParameter(
                "element size must be positive".into(),
            ));
        }
        Ok(Self { chunks, elem_size })
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn chunk_shape(&self) -> &[usize] {
        &self.chunks
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Elements per chunk (boundary chunks included: they are padded).
    pub fn chunk_elements(&self) -> usize {
        self.chunks.iter().product()
    }

    /// Uncompressed byte length of every chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_elements() * self.elem_size
    }

    /// Chunk containing element `coord` along dimension `dim`.
    #[inline]
    pub fn chunk_index(&self, dim: usize, coord: usize) -> usize {
        coord / self.chunks[dim]
    }

    /// Number of chunks needed to cover `shape`.
    pub fn grid_shape(&self, shape: &[usize]) -> Vec<usize> {
        shape
            .iter()
            .zip(&self.chunks)
            .map(|(&s, &c)| s.div_ceil(c))
            .collect()
    }

    /// Per-dimension range of chunk indices touched by `ranges`.
    pub fn chunk_ranges(&self, ranges: &[DimRange]) -> Vec<Range<usize>> {
        ranges
            .iter()
            .enumerate()
            .map(|(d, r)| {
                if r.is_empty() {
                    0..0
                } else {
                    self.chunk_index(d, r.start)..self.chunk_index(d, r.stop - 1) + 1
                }
            })
            .collect()
    }

    /// Every chunk intersecting `ranges`, in row-major grid order.
    pub fn overlaps(&self, ranges: &[DimRange]) -> Vec<ChunkOverlap> {
        debug_assert_eq!(ranges.len(), self.rank());
        let per_dim = self.chunk_ranges(ranges);
        let mut out = Vec::new();

        walk(&per_dim, |coord| {
            let mut chunk_ranges = Vec::with_capacity(coord.len());
            let mut request_ranges = Vec::with_capacity(coord.len());
            for (d, &ci) in coord.iter().enumerate() {
                let origin = ci * self.chunks[d];
                let lo = ranges[d].start.max(origin);
                let hi = ranges[d].stop.min(origin + self.chunks[d]);
                chunk_ranges.push(lo - origin..hi - origin);
                request_ranges.push(lo - ranges[d].start..hi - ranges[d].start);
            }
            out.push(ChunkOverlap {
                coord: ChunkCoord(coord.to_vec()),
                chunk_ranges,
                request_ranges,
            });
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: usize, stop: usize) -> DimRange {
        DimRange {
            start,
            stop,
            squeeze: false,
            open_start: false,
            open_stop: false,
        }
    }

    #[test]
    fn test_key_order_matches_grid_order() {
        let a = ChunkCoord(vec![2, 10]).key();
        let b = ChunkCoord(vec![10, 2]).key();
        let c = ChunkCoord(vec![10, 10]).key();
        assert!(a < b && b < c);
        assert_eq!(parse_chunk_key(&b), Some(ChunkCoord(vec![10, 2])));
        assert_eq!(parse_chunk_key("12.3"), None);
    }

    #[test]
    fn test_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[7]), vec![1]);
    }

    #[test]
    fn test_rejects_zero_chunk() {
        assert!(ChunkGrid::new(vec![2, 0], 1).is_err());
        assert!(ChunkGrid::new(vec![], 1).is_err());
    }

    #[test]
    fn test_overlaps_cross_chunk_boundaries() {
        let grid = ChunkGrid::new(vec![4, 4], 4).unwrap();
        assert_eq!(grid.chunk_bytes(), 64);

        let overlaps = grid.overlaps(&[span(2, 6), span(3, 5)]);
        let coords: Vec<_> = overlaps.iter().map(|o| o.coord.0.clone()).collect();
        assert_eq!(coords, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);

        assert_eq!(overlaps[0].chunk_ranges, vec![2..4, 3..4]);
        assert_eq!(overlaps[0].request_ranges, vec![0..2, 0..1]);
        assert_eq!(overlaps[3].chunk_ranges, vec![0..2, 0..1]);
        assert_eq!(overlaps[3].request_ranges, vec![2..4, 1..2]);

        let total: usize = overlaps.iter().map(|o| o.len()).sum();
        assert_eq!(total, 4 * 2);
    }

    #[test]
    fn test_empty_request_touches_nothing() {
        let grid = ChunkGrid::new(vec![4, 4], 1).unwrap();
        assert!(grid.overlaps(&[span(3, 3), span(0, 4)]).is_empty());
    }

    #[test]
    fn test_runs_merge_full_rows() {
        let grid = ChunkGrid::new(vec![2, 4], 1).unwrap();
        let overlaps = grid.overlaps(&[span(0, 2), span(0, 4)]);
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].runs(&[2, 4], &[2, 4]), vec![(0, 0, 8)]);
    }

    #[test]
    fn test_runs_partial_rows() {
        let grid = ChunkGrid::new(vec![4, 4], 1).unwrap();
        let overlaps = grid.overlaps(&[span(1, 3), span(1, 3)]);
        assert_eq!(overlaps.len(), 1);
        // chunk rows 1 and 2, columns 1..3 -> offsets 5 and 9
        assert_eq!(overlaps[0].runs(&[4, 4], &[2, 2]), vec![(5, 0, 2), (9, 2, 2)]);
    }

    #[test]
    fn test_walk_row_major() {
        let mut seen = Vec::new();
        walk(&[0..2, 5..7], |i| seen.push(i.to_vec()));
        assert_eq!(seen, vec![vec![0, 5], vec![0, 6], vec![1, 5], vec![1, 6]]);

        let mut count = 0;
        walk(&[0..2, 3..3], |_| count += 1);
        assert_eq!(count, 0);
    }
}
