//! Per-dimension indexing and its normalization into half-open ranges.

use crate::error::{Result, TensorStoreError};
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

/// One component of a tensor index: a scalar position or a slice.
///
/// Negative values count from the end of the dimension's current extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceIndex {
    /// Single position; the dimension is dropped from the result.
    Index(i64),
    /// Half-open slice, `None` bounds meaning "from the start" / "to the end".
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
}

impl SliceIndex {
    /// `..`
    pub const fn full() -> Self {
        SliceIndex::Slice {
            start: None,
            stop: None,
            step: None,
        }
    }

    /// `start..stop`
    pub const fn range(start: i64, stop: i64) -> Self {
        SliceIndex::Slice {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }

    /// Same slice with an explicit step. Only a step of 1 can be normalized.
    pub fn step_by(self, step: i64) -> Self {
        match self {
            SliceIndex::Index(i) => SliceIndex::Slice {
                start: Some(i),
                stop: Some(i + 1),
                step: Some(step),
            },
            SliceIndex::Slice { start, stop, .. } => SliceIndex::Slice {
                start,
                stop,
                step: Some(step),
            },
        }
    }

    /// True for scalar indices.
    pub fn is_index(&self) -> bool {
        matches!(self, SliceIndex::Index(_))
    }
}

/// Positions past `i64::MAX` saturate, so they fail bounds checks instead
/// of wrapping around to negative (from-the-end) positions.
fn saturating_i64<T: TryInto<i64>>(v: T) -> i64 {
    v.try_into().unwrap_or(i64::MAX)
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for SliceIndex {
                fn from(i: $t) -> Self {
                    SliceIndex::Index(saturating_i64(i))
                }
            }

            impl From<Range<$t>> for SliceIndex {
                fn from(r: Range<$t>) -> Self {
                    SliceIndex::range(saturating_i64(r.start), saturating_i64(r.end))
                }
            }

            impl From<RangeFrom<$t>> for SliceIndex {
                fn from(r: RangeFrom<$t>) -> Self {
                    SliceIndex::Slice { start: Some(saturating_i64(r.start)), stop: None, step: None }
                }
            }

            impl From<RangeTo<$t>> for SliceIndex {
                fn from(r: RangeTo<$t>) -> Self {
                    SliceIndex::Slice { start: None, stop: Some(saturating_i64(r.end)), step: None }
                }
            }
        )*
    };
}

impl_from_int!(i32, i64, isize, usize);

impl From<RangeFull> for SliceIndex {
    fn from(_: RangeFull) -> Self {
        SliceIndex::full()
    }
}

/// Build a `[SliceIndex; N]` from integers and ranges.
///
/// ```
/// use ruvector_tensor_store::{sel, SliceIndex};
///
/// let idx = sel![5, 0..10, ..];
/// assert_eq!(idx[0], SliceIndex::Index(5));
/// assert_eq!(idx[2], SliceIndex::full());
/// ```
#[macro_export]
macro_rules! sel {
    ($($e:expr),* $(,)?) => {
        [$($crate::SliceIndex::from($e)),*]
    };
}

/// A normalized, unit-step, half-open range over one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimRange {
    pub start: usize,
    pub stop: usize,
    /// Came from a scalar index; the dimension is dropped from results.
    pub squeeze: bool,
    pub open_start: bool,
    pub open_stop: bool,
}

impl DimRange {
    /// Whole `0..len` range, as produced by an omitted index.
    pub fn full(len: usize) -> Self {
        Self {
            start: 0,
            stop: len,
            squeeze: false,
            open_start: true,
            open_stop: true,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stop == self.start
    }

    /// Both bounds omitted: the index addresses the whole dimension.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.open_start && self.open_stop
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.stop
    }
}

/// Normalize `index` on dimension `dim`.
///
/// Negative and omitted bounds resolve against `extent` (the current extent
/// of the dimension); the result may reach up to `limit` (the largest
/// addressable extent, `>= extent`).
pub fn normalize(index: &SliceIndex, dim: usize, extent: usize, limit: usize) -> Result<DimRange> {
    let resolve = |i: i64| if i < 0 { i + extent as i64 } else { i };

    match *index {
        SliceIndex::Index(i) => {
            let pos = resolve(i);
            if pos < 0 || pos as usize >= limit {
                return Err(TensorStoreError::OutOfBounds {
                    dim,
                    index: i,
                    len: limit,
                });
            }
            let pos = pos as usize;
            Ok(DimRange {
                start: pos,
                stop: pos + 1,
                squeeze: true,
                open_start: false,
                open_stop: false,
            })
        }
        SliceIndex::Slice { start, stop, step } => {
            match step {
                None | Some(1) => {}
                Some(s) if s < 0 => {
                    return Err(TensorStoreError::Unsupported(format!(
                        "negative step {} in dimension {}",
                        s, dim
                    )))
                }
                Some(s) => {
                    return Err(TensorStoreError::Unsupported(format!(
                        "strided slice with step {} in dimension {}",
                        s, dim
                    )))
                }
            }

            let lo = match start {
                None => 0,
                Some(s) => {
                    let pos = resolve(s);
                    if pos < 0 || pos as usize > limit {
                        return Err(TensorStoreError::OutOfBounds {
                            dim,
                            index: s,
                            len: limit,
                        });
                    }
                    pos as usize
                }
            };
            let hi = match stop {
                None => extent.max(lo),
                Some(s) => {
                    let pos = resolve(s);
                    if pos < 0 || pos as usize > limit {
                        return Err(TensorStoreError::OutOfBounds {
                            dim,
                            index: s,
                            len: limit,
                        });
                    }
                    (pos as usize).max(lo)
                }
            };

            Ok(DimRange {
                start: lo,
                stop: hi,
                squeeze: false,
                open_start: start.is_none(),
                open_stop: stop.is_none(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_index() {
        let r = normalize(&SliceIndex::Index(3), 0, 10, 10).unwrap();
        assert_eq!((r.start, r.stop, r.squeeze), (3, 4, true));

        let r = normalize(&SliceIndex::Index(-1), 0, 10, 10).unwrap();
        assert_eq!(r.start, 9);

        assert!(matches!(
            normalize(&SliceIndex::Index(10), 0, 10, 10),
            Err(TensorStoreError::OutOfBounds { index: 10, .. })
        ));
        assert!(normalize(&SliceIndex::Index(-11), 0, 10, 10).is_err());
    }

    #[test]
    fn test_omitted_bounds_use_current_extent() {
        // dynamic dim: recorded extent 4, max 100
        let r = normalize(&SliceIndex::full(), 1, 4, 100).unwrap();
        assert_eq!(r.as_range(), 0..4);
        assert!(r.is_open());

        let r = normalize(&SliceIndex::from(-2..), 1, 4, 100).unwrap();
        assert_eq!(r.as_range(), 2..4);
        assert!(!r.is_open());
    }

    #[test]
    fn test_explicit_stop_may_exceed_extent_up_to_limit() {
        let r = normalize(&SliceIndex::from(50..60), 1, 10, 100).unwrap();
        assert_eq!(r.as_range(), 50..60);

        assert!(matches!(
            normalize(&SliceIndex::from(90..101), 1, 10, 100),
            Err(TensorStoreError::OutOfBounds { index: 101, len: 100, .. })
        ));
    }

    #[test]
    fn test_reversed_bounds_are_empty() {
        let r = normalize(&SliceIndex::from(5..2), 0, 10, 10).unwrap();
        assert!(r.is_empty());
        assert_eq!(r.start, 5);
    }

    #[test]
    fn test_steps() {
        assert!(normalize(&SliceIndex::full().step_by(1), 0, 10, 10).is_ok());
        assert!(matches!(
            normalize(&SliceIndex::full().step_by(2), 0, 10, 10),
            Err(TensorStoreError::Unsupported(_))
        ));
        assert!(matches!(
            normalize(&SliceIndex::full().step_by(-1), 0, 10, 10),
            Err(TensorStoreError::Unsupported(_))
        ));
    }

    #[test]
    fn test_sel_macro() {
        let idx = crate::sel![3, 1..4, .., -2];
        assert_eq!(
            idx,
            [
                SliceIndex::Index(3),
                SliceIndex::range(1, 4),
                SliceIndex::full(),
                SliceIndex::Index(-2),
            ]
        );
    }

    #[test]
    fn test_huge_unsigned_positions_do_not_wrap() {
        assert_eq!(SliceIndex::from(usize::MAX), SliceIndex::Index(i64::MAX));
        assert_eq!(
            SliceIndex::from(0..usize::MAX),
            SliceIndex::range(0, i64::MAX)
        );
        assert!(matches!(
            normalize(&SliceIndex::from(usize::MAX), 0, 10, 10),
            Err(TensorStoreError::OutOfBounds { index: i64::MAX, .. })
        ));
        assert!(normalize(&SliceIndex::from(2usize..usize::MAX), 0, 10, 10).is_err());
    }
}
