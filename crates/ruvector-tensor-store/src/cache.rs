//! Write-back chunk cache
//!
//! Holds decoded chunk bytes in LRU order under a byte budget. Reads fall
//! through to the backing store on a miss; writes stay in memory (dirty)
//! until [`ChunkCache::flush`], or until the entry is evicted, at which
//! point it is encoded and written back.

use crate::backend::BackingStore;
use crate::codec::Compressor;
use crate::error::{Result, TensorStoreError};
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from memory
    pub hits: u64,
    /// Lookups that went to the backing store
    pub misses: u64,
    /// Entries dropped to stay under budget
    pub evictions: u64,
    /// Dirty entries encoded and written to the backing store
    pub writebacks: u64,
}

impl CacheStats {
    /// Fraction of lookups served from memory.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    data: Vec<u8>,
    dirty: bool,
}

#[derive(Debug)]
struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    used_bytes: usize,
    stats: CacheStats,
    closed: bool,
}

/// Bounded write-back cache of decoded chunks for one tensor.
#[derive(Debug)]
pub struct ChunkCache {
    store: Arc<dyn BackingStore>,
    compressor: Compressor,
    chunk_bytes: usize,
    capacity_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl ChunkCache {
    /// Create a cache over `store` for chunks of `chunk_bytes` uncompressed bytes.
    pub fn new(
        store: Arc<dyn BackingStore>,
        compressor: Compressor,
        chunk_bytes: usize,
        capacity_bytes: usize,
    ) -> Self {
        Self {
            store,
            compressor,
            chunk_bytes,
            capacity_bytes,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                used_bytes: 0,
                stats: CacheStats::default(),
                closed: false,
            }),
        }
    }

    /// Uncompressed size of every chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Bytes currently held in memory.
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }

    /// Number of cached chunks.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chunks with unflushed writes.
    pub fn dirty_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .count()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Decoded bytes of chunk `key`; a chunk never written reads as zeros.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        self.load(&mut inner, key)?;
        let data = inner
            .entries
            .get(key)
            .map(|e| e.data.clone())
            .ok_or_else(|| TensorStoreError::KeyNotFound(key.to_string()))?;
        self.enforce_budget(&mut inner)?;
        Ok(data)
    }

    /// Replace chunk `key` with `data` and mark it dirty.
    pub fn set(&self, key: &str, data: Vec<u8>) -> Result<()> {
        if data.len() != self.chunk_bytes {
            return Err(TensorStoreError::InvalidParameter(format!(
                "chunk {} has {} bytes, expected {}",
                key,
                data.len(),
                self.chunk_bytes
            )));
        }
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        let len = data.len();
        if let Some(old) = inner
            .entries
            .put(key.to_string(), CacheEntry { data, dirty: true })
        {
            inner.used_bytes -= old.data.len();
        }
        inner.used_bytes += len;
        self.enforce_budget(&mut inner)
    }

    /// Read-modify-write chunk `key` in place, then mark it dirty.
    ///
    /// The whole cycle runs under the cache lock, so concurrent callers
    /// touching the same chunk never interleave.
    pub fn with_chunk_mut<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        self.load(&mut inner, key)?;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                f(&mut entry.data);
                entry.dirty = true;
            }
            None => return Err(TensorStoreError::KeyNotFound(key.to_string())),
        }
        self.enforce_budget(&mut inner)
    }

    /// Write every dirty chunk to the backing store; returns how many were written.
    pub fn flush(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        self.flush_locked(&mut inner)
    }

    /// Flush, then drop all cached chunks. The cache is unusable afterwards.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        self.flush_locked(&mut inner)?;
        inner.entries.clear();
        inner.used_bytes = 0;
        inner.closed = true;
        Ok(())
    }

    /// Drop clean entries so the next reads see the backing store again.
    pub fn invalidate(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        let clean: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| !e.dirty)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &clean {
            if let Some(entry) = inner.entries.pop(key) {
                inner.used_bytes -= entry.data.len();
            }
        }
        Ok(clean.len())
    }

    /// Drop everything without writing back. Used when the storage is deleted.
    pub(crate) fn discard(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.used_bytes = 0;
        inner.closed = true;
    }

    fn ensure_open(&self, inner: &CacheInner) -> Result<()> {
        if inner.closed {
            Err(TensorStoreError::Closed("chunk cache".into()))
        } else {
            Ok(())
        }
    }

    /// Make sure `key` is resident, fetching and decoding it on a miss.
    fn load(&self, inner: &mut CacheInner, key: &str) -> Result<()> {
        if inner.entries.get(key).is_some() {
            inner.stats.hits += 1;
            return Ok(());
        }
        inner.stats.misses += 1;

        let data = match self.store.get(key)? {
            Some(encoded) => self.compressor.decode(&encoded, self.chunk_bytes)?,
            None => {
                trace!(key, "chunk missing, zero-filled");
                vec![0u8; self.chunk_bytes]
            }
        };
        inner.used_bytes += data.len();
        inner
            .entries
            .put(key.to_string(), CacheEntry { data, dirty: false });
        Ok(())
    }

    fn write_back(&self, key: &str, data: &[u8]) -> Result<()> {
        let encoded = self.compressor.encode(data)?;
        self.store.set(key, &encoded)
    }

    /// Evict least recently used chunks until within budget, writing dirty ones back.
    fn enforce_budget(&self, inner: &mut CacheInner) -> Result<()> {
        while inner.used_bytes > self.capacity_bytes {
            let Some((key, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.used_bytes -= entry.data.len();
            inner.stats.evictions += 1;
            if entry.dirty {
                trace!(key = %key, "writing back evicted chunk");
                if let Err(e) = self.write_back(&key, &entry.data) {
                    // keep the data resident rather than dropping a write
                    inner.used_bytes += entry.data.len();
                    inner.entries.put(key, entry);
                    return Err(e);
                }
                inner.stats.writebacks += 1;
            }
        }
        Ok(())
    }

    fn flush_locked(&self, inner: &mut CacheInner) -> Result<usize> {
        let mut dirty: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(k, _)| k.clone())
            .collect();
        // key order equals grid order
        dirty.sort();

        for key in &dirty {
            if let Some(entry) = inner.entries.peek_mut(key) {
                let encoded = self.compressor.encode(&entry.data)?;
                self.store.set(key, &encoded)?;
                entry.dirty = false;
            }
        }
        inner.stats.writebacks += dirty.len() as u64;
        if !dirty.is_empty() {
            debug!(chunks = dirty.len(), "flushed dirty chunks");
        }
        Ok(dirty.len())
    }
}
