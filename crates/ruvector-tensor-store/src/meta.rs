//! Tensor declaration and persisted tensor metadata.

use crate::codec::Compressor;
use crate::dtype::DType;
use crate::error::{Result, TensorStoreError};
use crate::grid::ChunkGrid;
use serde::{Deserialize, Serialize};

/// Current metadata layout version.
pub const TENSOR_META_VERSION: u32 = 1;

/// Key of the metadata record, relative to the tensor root.
pub const TENSOR_META_KEY: &str = "meta.json";

/// Declaration of a tensor, before the number of samples is known.
///
/// `shape` is the per-sample shape; `None` marks a dynamic dimension,
/// which then needs an entry in `max_shape`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub shape: Vec<Option<usize>>,
    #[serde(default)]
    pub max_shape: Option<Vec<usize>>,
    pub dtype: DType,
    /// Chunk shape including the outer dimension. A shorter list is
    /// completed from `max_shape`.
    #[serde(default)]
    pub chunks: Option<Vec<usize>>,
    #[serde(default)]
    pub compressor: Compressor,
}

impl TensorSpec {
    /// Fixed per-sample shape.
    pub fn new(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.iter().copied().map(Some).collect(),
            max_shape: None,
            dtype,
            chunks: None,
            compressor: Compressor::default(),
        }
    }

    /// Per-sample shape with dynamic dimensions bounded by `max_shape`.
    pub fn dynamic(shape: &[Option<usize>], max_shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            max_shape: Some(max_shape.to_vec()),
            dtype,
            chunks: None,
            compressor: Compressor::default(),
        }
    }

    pub fn with_chunks(mut self, chunks: &[usize]) -> Self {
        self.chunks = Some(chunks.to_vec());
        self
    }

    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }
}

/// Persisted description of a tensor. All shape vectors are full rank
/// (outer dimension first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub version: u32,
    pub shape: Vec<Option<usize>>,
    pub max_shape: Vec<usize>,
    pub dtype: DType,
    pub chunks: Vec<usize>,
    pub compressor: Compressor,
}

impl TensorMeta {
    /// Validate `spec` and resolve it for `num_samples` samples.
    pub fn resolve(num_samples: usize, spec: &TensorSpec, target_chunk_bytes: usize) -> Result<Self> {
        let suffix_max: Vec<usize> = match &spec.max_shape {
            Some(max) => {
                if max.len() != spec.shape.len() {
                    return Err(TensorStoreError::ShapeLength {
                        what: "max_shape",
                        expected: spec.shape.len(),
                        actual: max.len(),
                    });
                }
                for (d, (s, &m)) in spec.shape.iter().zip(max).enumerate() {
                    if let Some(s) = s {
                        if *s != m {
                            return Err(TensorStoreError::InvalidShape(format!(
                                "dimension {} is fixed at {} but max_shape says {}",
                                d + 1,
                                s,
                                m
                            )));
                        }
                    }
                }
                max.clone()
            }
            None => spec
                .shape
                .iter()
                .enumerate()
                .map(|(d, s)| {
                    s.ok_or_else(|| {
                        TensorStoreError::InvalidShape(format!(
                            "dimension {} is dynamic but no max_shape was given",
                            d + 1
                        ))
                    })
                })
                .collect::<Result<_>>()?,
        };

        let rank = spec.shape.len() + 1;
        let mut shape = Vec::with_capacity(rank);
        shape.push(Some(num_samples));
        shape.extend(spec.shape.iter().copied());
        let mut max_shape = Vec::with_capacity(rank);
        max_shape.push(num_samples);
        max_shape.extend(suffix_max.iter().copied());

        let chunks = match &spec.chunks {
            Some(given) => {
                if given.len() > rank {
                    return Err(TensorStoreError::ShapeLength {
                        what: "chunks",
                        expected: rank,
                        actual: given.len(),
                    });
                }
                let mut chunks = given.clone();
                chunks.extend(max_shape[given.len()..].iter().map(|&m| m.max(1)));
                chunks
            }
            None => default_chunks(&suffix_max, spec.dtype.size(), num_samples, target_chunk_bytes),
        };
        if chunks.contains(&0) {
            return Err(TensorStoreError::InvalidShape(format!(
                "chunk shape cannot contain zero: {:?}",
                chunks
            )));
        }

        Ok(Self {
            version: TENSOR_META_VERSION,
            shape,
            max_shape,
            dtype: spec.dtype,
            chunks,
            compressor: spec.compressor,
        })
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.max_shape.len()
    }

    #[inline]
    pub fn num_samples(&self) -> usize {
        self.max_shape[0]
    }

    /// Full-rank indices of the dynamic dimensions.
    pub fn dynamic_dims(&self) -> Vec<usize> {
        self.shape
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_dynamic(&self) -> bool {
        self.shape.iter().any(Option::is_none)
    }

    /// Declared per-sample shape.
    pub fn sample_shape(&self) -> &[Option<usize>] {
        &self.shape[1..]
    }

    /// Per-sample maximum shape.
    pub fn sample_max_shape(&self) -> &[usize] {
        &self.max_shape[1..]
    }

    pub fn grid(&self) -> Result<ChunkGrid> {
        ChunkGrid::new(self.chunks.clone(), self.dtype.size())
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunks.iter().product::<usize>() * self.dtype.size()
    }

    pub(crate) fn set_num_samples(&mut self, num_samples: usize) {
        self.shape[0] = Some(num_samples);
        self.max_shape[0] = num_samples;
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let meta: Self = serde_json::from_slice(bytes)?;
        if meta.version != TENSOR_META_VERSION {
            return Err(TensorStoreError::SerializationError(format!(
                "unsupported tensor meta version {}",
                meta.version
            )));
        }
        if meta.shape.len() != meta.max_shape.len() || meta.chunks.len() != meta.max_shape.len() {
            return Err(TensorStoreError::SerializationError(
                "tensor meta shapes disagree in rank".into(),
            ));
        }
        Ok(meta)
    }
}

/// Chunk shape aiming at `target_bytes` per chunk: a sample is split by
/// halving its largest dimension until it fits, then as many samples as
/// fit are stacked along the outer dimension.
fn default_chunks(
    sample_max: &[usize],
    elem_size: usize,
    num_samples: usize,
    target_bytes: usize,
) -> Vec<usize> {
    let mut inner: Vec<usize> = sample_max.iter().map(|&m| m.max(1)).collect();
    let sample_bytes = |inner: &[usize]| inner.iter().product::<usize>() * elem_size;

    while sample_bytes(&inner) > target_bytes {
        let Some((d, &largest)) = inner.iter().enumerate().max_by_key(|&(_, c)| *c) else {
            break;
        };
        if largest <= 1 {
            break;
        }
        inner[d] = largest.div_ceil(2);
    }

    let outer = (target_bytes / sample_bytes(&inner).max(1)).clamp(1, num_samples.max(1));
    let mut chunks = Vec::with_capacity(inner.len() + 1);
    chunks.push(outer);
    chunks.extend(inner);
    chunks
}
