//! Local filesystem backing store
//!
//! Each key maps to one file below the store root; `/` in keys maps to
//! directories. Writes go to a sibling temp file first and are renamed
//! into place, so a reader never observes a half-written chunk.

use super::{validate_key, BackingStore};
use crate::error::{Result, TensorStoreError};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const PARTIAL_SUFFIX: &str = ".partial";

/// Backing store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        if !root.is_dir() {
            return Err(TensorStoreError::InvalidPath(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        if key.ends_with(PARTIAL_SUFFIX) {
            return Err(TensorStoreError::InvalidPath(format!(
                "reserved key suffix: {key}"
            )));
        }
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }

    fn collect(&self, dir: &Path, rel: &str, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let key = if rel.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", rel, name)
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                // prune subtrees that cannot match
                let dir_key = format!("{}/", key);
                if dir_key.starts_with(prefix) || prefix.starts_with(&dir_key) {
                    self.collect(&entry.path(), &key, prefix, out)?;
                }
            } else if !name.ends_with(PARTIAL_SUFFIX) && key.starts_with(prefix) {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl BackingStore for FsStore {
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(PARTIAL_SUFFIX);
        let tmp = PathBuf::from(tmp_name);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect(&self.root, "", prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}
