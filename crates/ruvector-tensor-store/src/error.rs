//! Error types for the tensor store

use crate::dtype::DType;
use thiserror::Error;

/// Result type alias for tensor store operations
pub type Result<T> = std::result::Result<T, TensorStoreError>;

/// Main error type for the tensor store
#[derive(Error, Debug)]
pub enum TensorStoreError {
    /// Dimension count mismatch between two shape-like tuples
    #[error("Shape length mismatch: {what} has {actual} dimensions, expected {expected}")]
    ShapeLength {
        /// What was being checked (e.g. "max_shape", "index")
        what: &'static str,
        /// Expected number of dimensions
        expected: usize,
        /// Actual number of dimensions
        actual: usize,
    },

    /// Value shape cannot be broadcast to the target shape
    #[error("Shape mismatch: cannot broadcast value of shape {actual:?} to {expected:?}")]
    ShapeMismatch {
        /// Target shape
        expected: Vec<usize>,
        /// Shape of the supplied value
        actual: Vec<usize>,
    },

    /// Declared shape is inconsistent
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// A dynamic dimension extent exceeds its declared maximum
    #[error("Extent {extent} exceeds max shape {max} in dimension {dim}")]
    ExtentExceedsMax {
        /// Dimension (full-rank index)
        dim: usize,
        /// Requested extent
        extent: usize,
        /// Declared maximum
        max: usize,
    },

    /// Index or slice bound outside the addressable range
    #[error("Index {index} out of bounds for dimension {dim} with length {len}")]
    OutOfBounds {
        /// Dimension (full-rank index)
        dim: usize,
        /// Offending index
        index: i64,
        /// Length of the dimension
        len: usize,
    },

    /// Operation is not supported (strided slices, fancy indexing...)
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Resource was used after close
    #[error("Resource closed: {0}")]
    Closed(String),

    /// Mutation attempted on a read-only handle
    #[error("Read-only: {0}")]
    ReadOnly(String),

    /// Element type requested does not match the stored dtype
    #[error("DType mismatch: tensor stores {expected}, requested {actual}")]
    DTypeMismatch {
        /// Stored dtype
        expected: DType,
        /// Requested dtype
        actual: DType,
    },

    /// Key missing from the backing store
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// No tensor metadata found at the given location
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    /// No dataset metadata found at the given location
    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    /// Store holds data that is not a dataset
    #[error("Not a dataset: {0}")]
    NotADataset(String),

    /// A required argument was not supplied
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Compression or decompression failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid key or path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl TensorStoreError {
    /// True for errors raised by shape validation (never partially applied).
    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            Self::ShapeLength { .. }
                | Self::ShapeMismatch { .. }
                | Self::InvalidShape(_)
                | Self::ExtentExceedsMax { .. }
        )
    }
}

impl From<serde_json::Error> for TensorStoreError {
    fn from(err: serde_json::Error) -> Self {
        TensorStoreError::SerializationError(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::Error> for TensorStoreError {
    fn from(err: redb::Error) -> Self {
        TensorStoreError::DatabaseError(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::DatabaseError> for TensorStoreError {
    fn from(err: redb::DatabaseError) -> Self {
        TensorStoreError::DatabaseError(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::StorageError> for TensorStoreError {
    fn from(err: redb::StorageError) -> Self {
        TensorStoreError::DatabaseError(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::TableError> for TensorStoreError {
    fn from(err: redb::TableError) -> Self {
        TensorStoreError::DatabaseError(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::TransactionError> for TensorStoreError {
    fn from(err: redb::TransactionError) -> Self {
        TensorStoreError::DatabaseError(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::CommitError> for TensorStoreError {
    fn from(err: redb::CommitError) -> Self {
        TensorStoreError::DatabaseError(err.to_string())
    }
}
