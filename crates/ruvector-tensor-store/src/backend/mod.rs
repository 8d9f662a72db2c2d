//! Backing store contract and adapters.
//!
//! A backing store is a durable mapping from POSIX-style string keys to
//! byte blobs. Everything above this module (cache, tensors, datasets)
//! talks to it through [`BackingStore`] only.

use crate::error::{Result, TensorStoreError};
use std::fmt;
use std::sync::Arc;

pub mod fs;
pub mod memory;
#[cfg(feature = "storage")]
pub mod redb_store;

pub use self::fs::FsStore;
pub use self::memory::MemoryStore;
#[cfg(feature = "storage")]
pub use self::redb_store::RedbStore;

/// Durable key -> bytes storage beneath the chunk cache.
pub trait BackingStore: Send + Sync + fmt::Debug {
    /// Check whether `key` holds a value.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Fetch the value of `key`; `Ok(None)` when the key is missing.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`; returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, sorted lexicographically.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Fetch `key`, failing with [`TensorStoreError::KeyNotFound`] when missing.
    fn get_required(&self, key: &str) -> Result<Vec<u8>> {
        self.get(key)?
            .ok_or_else(|| TensorStoreError::KeyNotFound(key.to_string()))
    }

    /// Remove every key starting with `prefix`; returns how many were removed.
    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        for key in self.list_keys(prefix)? {
            if self.delete(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Validate a POSIX-style key: non-empty segments, no `.`/`..`, not absolute.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(TensorStoreError::InvalidPath("empty key".into()));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(TensorStoreError::InvalidPath(format!(
            "key must be relative and '/'-separated: {key}"
        )));
    }
    if key
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(TensorStoreError::InvalidPath(format!(
            "Path traversal or empty segment in key: {key}"
        )));
    }
    Ok(())
}

/// Join two key fragments with `/`, treating an empty side as absent.
pub fn join_key(prefix: &str, key: &str) -> String {
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{}/{}", prefix.trim_end_matches('/'), key),
    }
}

/// A namespaced view of another store: every key is placed under `prefix/`.
///
/// Used to confine each tensor of a dataset to its own key space.
#[derive(Clone)]
pub struct PrefixedStore {
    inner: Arc<dyn BackingStore>,
    prefix: String,
}

impl PrefixedStore {
    pub fn new(inner: Arc<dyn BackingStore>, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches('/').to_string();
        if !prefix.is_empty() {
            validate_key(&prefix)?;
        }
        Ok(Self { inner, prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full(&self, key: &str) -> String {
        join_key(&self.prefix, key)
    }
}

impl fmt::Debug for PrefixedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefixedStore")
            .field("prefix", &self.prefix)
            .field("inner", &self.inner)
            .finish()
    }
}

impl BackingStore for PrefixedStore {
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(&self.full(key))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(&self.full(key))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.set(&self.full(key), value)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(&self.full(key))
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        if self.prefix.is_empty() {
            return self.inner.list_keys(prefix);
        }
        let own = format!("{}/", self.prefix);
        let keys = self.inner.list_keys(&format!("{}{}", own, prefix))?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&own).map(str::to_string))
            .collect())
    }
}

/// Stores used by unit tests across the crate.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::backend::MemoryStore;
    use parking_lot::Mutex;

    /// In-memory store whose writes fail under a chosen key prefix.
    #[derive(Debug, Default)]
    pub(crate) struct FailingStore {
        inner: MemoryStore,
        fail_prefix: Mutex<Option<String>>,
    }

    impl FailingStore {
        /// Make every `set` of a key starting with `prefix` fail.
        pub(crate) fn fail_under(&self, prefix: &str) {
            *self.fail_prefix.lock() = Some(prefix.to_string());
        }

        pub(crate) fn heal(&self) {
            *self.fail_prefix.lock() = None;
        }
    }

    impl BackingStore for FailingStore {
        fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key)
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> Result<()> {
            if let Some(prefix) = self.fail_prefix.lock().as_deref() {
                if key.starts_with(prefix) {
                    return Err(TensorStoreError::IoError(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("disk full writing {key}"),
                    )));
                }
            }
            self.inner.set(key, value)
        }

        fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key)
        }

        fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list_keys(prefix)
        }
    }
}
