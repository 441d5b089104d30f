// SPDX-License-Identifier: Apache-2.0
//! Filesystem store tier.
//!
//! One file per key under the data directory; slash-separated key segments
//! become subdirectories. Writes land in a `.tmp` sibling and are renamed
//! into place, so readers never observe a torn blob.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::{blob_digest, check_key, BlobDigest, KVStore, StoreError, SwapOutcome};

/// Filesystem-backed tier rooted at a data directory.
#[derive(Debug)]
pub struct FsStore {
    base: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `base`.
    ///
    /// # Errors
    ///
    /// I/O failure creating the root directory.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// The root directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        check_key(key)?;
        Ok(self.base.join(key))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp-write");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn collect_keys(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
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
                format!("{rel}/{name}")
            };
            let ty = entry.file_type()?;
            if ty.is_dir() {
                self.collect_keys(&entry.path(), &key, out)?;
            } else if ty.is_file() && !name.ends_with(".tmp-write") {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl KVStore for FsStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        self.write_atomic(&path, bytes)
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        self.collect_keys(&self.base, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn atomic_swap(
        &mut self,
        key: &str,
        expected: Option<BlobDigest>,
        bytes: &[u8],
    ) -> Result<SwapOutcome, StoreError> {
        let path = self.path_for(key)?;
        let actual = match fs::read(&path) {
            Ok(current) => Some(blob_digest(&current)),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        if actual != expected {
            return Ok(SwapOutcome::Conflict { actual });
        }
        self.write_atomic(&path, bytes)?;
        Ok(SwapOutcome::Swapped)
    }
}
