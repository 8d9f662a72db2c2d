//! Store configuration.

use crate::error::{Result, TensorStoreError};
use serde::{Deserialize, Serialize};

/// Default chunk cache budget: 64 MiB.
pub const DEFAULT_CACHE_BYTES: usize = 1 << 26;

/// Default target size of one uncompressed chunk: 16 MiB.
pub const DEFAULT_TARGET_CHUNK_BYTES: usize = 1 << 24;

/// Tuning knobs shared by every tensor opened with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Byte budget of each tensor's chunk cache. `0` disables caching:
    /// every chunk write goes straight to the backing store.
    pub cache_bytes: usize,
    /// Serialize every operation on a shared tensor behind one mutex,
    /// reads included. When `false`, reads run concurrently with each
    /// other; writes and resizes stay exclusive and each chunk's
    /// read-modify-write in the cache is atomic either way.
    pub lock_cache: bool,
    /// Target uncompressed chunk size used when a tensor declares no chunks.
    pub target_chunk_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_bytes: DEFAULT_CACHE_BYTES,
            lock_cache: true,
            target_chunk_bytes: DEFAULT_TARGET_CHUNK_BYTES,
        }
    }
}

impl StoreConfig {
    pub fn with_cache_bytes(mut self, bytes: usize) -> Self {
        self.cache_bytes = bytes;
        self
    }

    pub fn with_lock_cache(mut self, lock: bool) -> Self {
        self.lock_cache = lock;
        self
    }

    pub fn with_target_chunk_bytes(mut self, bytes: usize) -> Self {
        self.target_chunk_bytes = bytes;
        self
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_chunk_bytes == 0 {
            return Err(TensorStoreError::InvalidParameter(
                "target_chunk_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}
