//! # Ruvector Tensor Store
//!
//! Chunked, resizable N-dimensional tensor storage on top of a key-value
//! backing store.
//!
//! ## Features
//!
//! - **Chunk grid**: tensors are split into fixed-size, padded chunks keyed
//!   by grid coordinate; slices touch only the chunks they overlap
//! - **Dynamic shapes**: inner dimensions may vary per sample up to a
//!   declared maximum, tracked in a side table
//! - **Write-back cache**: a bounded LRU of decoded chunks coalesces small
//!   writes; dirty chunks are written on flush, close or eviction
//! - **Codecs**: LZ4 or Zstandard per tensor
//! - **Backends**: in-memory, local filesystem, and redb (`storage` feature)
//! - **Datasets**: named tensors sharing an appendable outer dimension
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ndarray::arr2;
//! use ruvector_tensor_store::prelude::*;
//!
//! # fn main() -> ruvector_tensor_store::Result<()> {
//! let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
//! let ds = Dataset::builder(store)
//!     .num_samples(10)
//!     .tensor("image", TensorSpec::dynamic(&[None, None], &[100, 100], DType::U8))
//!     .build()?;
//!
//! let image = ds.tensor("image")?;
//! image.write(&sel![0], &arr2(&[[1u8, 2], [3, 4]]))?;
//! assert_eq!(image.sample_shape(0)?, vec![2, 2]);
//! ds.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod dtype;
pub mod error;
pub mod grid;
pub mod index;
pub mod meta;
pub mod shape_table;
pub mod tensor;

// Re-exports
pub use backend::{BackingStore, FsStore, MemoryStore, PrefixedStore};
#[cfg(feature = "storage")]
pub use backend::RedbStore;
pub use cache::{CacheStats, ChunkCache};
pub use codec::{CompressionLevel, Compressor};
pub use config::StoreConfig;
pub use dataset::{Dataset, DatasetBuilder, DatasetMeta, DatasetObserver};
pub use dtype::{DType, Element};
pub use error::{Result, TensorStoreError};
pub use grid::{ChunkCoord, ChunkGrid};
pub use index::{DimRange, SliceIndex};
pub use meta::{TensorMeta, TensorSpec};
pub use shape_table::DynamicShapeTable;
pub use tensor::{DynamicTensor, Mode};

/// Commonly used types and the `sel!` macro.
pub mod prelude {
    pub use crate::backend::{BackingStore, FsStore, MemoryStore};
    #[cfg(feature = "storage")]
    pub use crate::backend::RedbStore;
    pub use crate::codec::Compressor;
    pub use crate::config::StoreConfig;
    pub use crate::dataset::Dataset;
    pub use crate::dtype::DType;
    pub use crate::error::{Result, TensorStoreError};
    pub use crate::index::SliceIndex;
    pub use crate::meta::TensorSpec;
    pub use crate::sel;
    pub use crate::tensor::{DynamicTensor, Mode};
}
