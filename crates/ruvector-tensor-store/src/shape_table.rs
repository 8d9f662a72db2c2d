//! Per-sample extents of dynamic dimensions.
//!
//! One record per sample, one slot per dynamic dimension, stored flat.
//! The table is small relative to chunk data, so it is loaded whole on
//! open and rewritten whole (bincode) on flush and resize.

use crate::error::{Result, TensorStoreError};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Current on-disk layout version.
pub const SHAPE_TABLE_VERSION: u32 = 1;

/// Key of the persisted table, relative to the tensor root.
pub const SHAPE_TABLE_KEY: &str = "--dynamic--/shape_table";

/// Recorded extents of every dynamic dimension, for every sample.
///
/// Shapes handled here are per-sample shapes: the outer dimension is not
/// included. Dimension numbers in errors are full-rank (outer dimension = 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicShapeTable {
    version: u32,
    shape: Vec<Option<usize>>,
    max_shape: Vec<usize>,
    dims: Vec<usize>,
    extents: Vec<usize>,
}

impl DynamicShapeTable {
    /// Table for `num_samples` samples, all dynamic extents zero.
    pub fn new(shape: &[Option<usize>], max_shape: &[usize], num_samples: usize) -> Result<Self> {
        if shape.len() != max_shape.len() {
            return Err(TensorStoreError::ShapeLength {
                what: "max_shape",
                expected: shape.len(),
                actual: max_shape.len(),
            });
        }
        let dims: Vec<usize> = shape
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();
        Ok(Self {
            version: SHAPE_TABLE_VERSION,
            shape: shape.to_vec(),
            max_shape: max_shape.to_vec(),
            extents: vec![0; dims.len() * num_samples],
            dims,
        })
    }

    /// Number of samples tracked.
    pub fn len(&self) -> usize {
        if self.dims.is_empty() {
            0
        } else {
            self.extents.len() / self.dims.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Per-sample dimension indices that are dynamic.
    pub fn dynamic_dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn max_shape(&self) -> &[usize] {
        &self.max_shape
    }

    fn slot(&self, sample: usize) -> Result<Range<usize>> {
        let n = self.dims.len();
        if n == 0 || sample >= self.len() {
            return Err(TensorStoreError::OutOfBounds {
                dim: 0,
                index: sample as i64,
                len: self.len(),
            });
        }
        Ok(sample * n..(sample + 1) * n)
    }

    /// Recorded extents of the dynamic dimensions of `sample`.
    pub fn extents(&self, sample: usize) -> Result<&[usize]> {
        let slot = self.slot(sample)?;
        Ok(&self.extents[slot])
    }

    /// Full per-sample shape: declared size for fixed dimensions, recorded
    /// extent for dynamic ones.
    pub fn get_shape(&self, sample: usize) -> Result<Vec<usize>> {
        let extents = self.extents(sample)?;
        Ok(self.merge(extents))
    }

    fn merge(&self, extents: &[usize]) -> Vec<usize> {
        let mut shape: Vec<usize> = self
            .shape
            .iter()
            .zip(&self.max_shape)
            .map(|(s, m)| s.unwrap_or(*m))
            .collect();
        for (&d, &e) in self.dims.iter().zip(extents) {
            shape[d] = e;
        }
        shape
    }

    /// Pick the dynamic entries out of a full per-sample shape, validating it.
    fn dynamic_part(&self, shape: &[usize]) -> Result<Vec<usize>> {
        if shape.len() != self.shape.len() {
            return Err(TensorStoreError::ShapeLength {
                what: "sample shape",
                expected: self.shape.len(),
                actual: shape.len(),
            });
        }
        for (d, (&value, &max)) in shape.iter().zip(&self.max_shape).enumerate() {
            if value > max {
                return Err(TensorStoreError::ExtentExceedsMax {
                    dim: d + 1,
                    extent: value,
                    max,
                });
            }
        }
        Ok(self.dims.iter().map(|&d| shape[d]).collect())
    }

    /// Overwrite the recorded shape of `sample`.
    pub fn set_shape(&mut self, sample: usize, shape: &[usize]) -> Result<()> {
        let dynamic = self.dynamic_part(shape)?;
        let slot = self.slot(sample)?;
        self.extents[slot].copy_from_slice(&dynamic);
        Ok(())
    }

    /// Merge `shape` into the recorded shape of `sample`, keeping the larger
    /// extent per dimension.
    pub fn grow_shape(&mut self, sample: usize, shape: &[usize]) -> Result<()> {
        let dynamic = self.dynamic_part(shape)?;
        let slot = self.slot(sample)?;
        for (e, d) in self.extents[slot].iter_mut().zip(dynamic) {
            *e = (*e).max(d);
        }
        Ok(())
    }

    /// Grow (new samples get zero extents) or truncate to `num_samples`.
    pub fn resize(&mut self, num_samples: usize) {
        self.extents.resize(num_samples * self.dims.len(), 0);
    }

    /// Per-dimension maximum shape over `samples`; dynamic extents are zero
    /// for an empty range.
    pub fn max_extents(&self, samples: Range<usize>) -> Result<Vec<usize>> {
        let n = self.dims.len();
        let mut acc = vec![0usize; n];
        if !samples.is_empty() {
            if samples.end > self.len() {
                return Err(TensorStoreError::OutOfBounds {
                    dim: 0,
                    index: samples.end as i64 - 1,
                    len: self.len(),
                });
            }
            for record in self.extents[samples.start * n..samples.end * n].chunks_exact(n) {
                for (a, &e) in acc.iter_mut().zip(record) {
                    *a = (*a).max(e);
                }
            }
        }
        Ok(self.merge(&acc))
    }

    /// Serialize with bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TensorStoreError::SerializationError(e.to_string()))
    }

    /// Deserialize, rejecting unknown layout versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (table, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| TensorStoreError::SerializationError(e.to_string()))?;
        if table.version != SHAPE_TABLE_VERSION {
            return Err(TensorStoreError::SerializationError(format!(
                "unsupported shape table version {}",
                table.version
            )));
        }
        if table.dims.is_empty() || table.extents.len() % table.dims.len() != 0 {
            return Err(TensorStoreError::SerializationError(
                "corrupt shape table".into(),
            ));
        }
        Ok(table)
    }
}
