//! redb-backed backing store
//!
//! This module is only available when the "storage" feature is enabled.
//! All keys live in a single `blobs` table of one database file.

use super::{validate_key, BackingStore};
use crate::error::{Result, TensorStoreError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BLOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

// Global database pool so that several stores (e.g. a dataset and a
// reader opened later in the same process) can share one database file.
static DB_POOL: Lazy<Mutex<HashMap<PathBuf, Arc<Database>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Backing store persisted in a redb database file.
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbStore {
    /// Create or open a store at the given database path
    ///
    /// Uses a global connection pool, so opening the same path twice in one
    /// process returns handles to the same database instead of failing on
    /// the file lock.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        if path_ref
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(TensorStoreError::InvalidPath(
                "Path traversal attempt detected".to_string(),
            ));
        }
        let path_buf = path_ref
            .canonicalize()
            .unwrap_or_else(|_| path_ref.to_path_buf());

        let db = {
            let mut pool = DB_POOL.lock();

            if let Some(existing_db) = pool.get(&path_buf) {
                Arc::clone(existing_db)
            } else {
                let new_db = Arc::new(Database::create(&path_buf)?);

                let write_txn = new_db.begin_write()?;
                {
                    let _ = write_txn.open_table(BLOBS_TABLE)?;
                }
                write_txn.commit()?;

                pool.insert(path_buf.clone(), Arc::clone(&new_db));
                new_db
            }
        };

        Ok(Self { db, path: path_buf })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbStore").field("path", &self.path).finish()
    }
}

impl BackingStore for RedbStore {
    fn exists(&self, key: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;
        Ok(table.get(key)?.is_some())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;
        let value = table.get(key)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            let removed = table.remove(key)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;

        let mut keys = Vec::new();
        for item in table.range(prefix..)? {
            let (key, _) = item?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list_keys(prefix)?;
        if keys.is_empty() {
            return Ok(0);
        }
        let write_txn = self.db.begin_write()?;
        let mut removed = 0;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            for key in &keys {
                if table.remove(key.as_str())?.is_some() {
                    removed += 1;
                }
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }
}
