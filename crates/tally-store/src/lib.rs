// SPDX-License-Identifier: Apache-2.0
//! Keyed blob store for tally nodes.
//!
//! The [`KVStore`] trait is the boundary the replicated state machine
//! persists through. It deals in opaque byte blobs under string keys; the
//! only structure it knows is prefix listing and per-blob compare-and-swap.
//! Writes are serialized per key by the FSM layer — the store itself
//! guarantees only per-blob atomicity.
//!
//! # Absence Semantics
//!
//! [`get`](KVStore::get) returns `None` for missing keys — absence is not an
//! error. Error variants are reserved for I/O and integrity failures.
//!
//! Two tiers ship here: [`MemoryStore`] for tests and caches, and
//! [`FsStore`] writing one file per key under a data directory with
//! tmp-and-rename atomicity.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

mod fs;
pub mod keys;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

/// A 32-byte BLAKE3 content digest of one blob.
///
/// Content-only (no domain prefix): two identical blobs carry the same
/// digest wherever they live, which is exactly what compare-and-swap needs.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlobDigest(pub [u8; 32]);

impl BlobDigest {
    /// View the digest as raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for BlobDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Compute the content digest of `bytes`.
pub fn blob_digest(bytes: &[u8]) -> BlobDigest {
    BlobDigest(*blake3::hash(bytes).as_bytes())
}

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A key contained path traversal or characters outside the allowed set.
    #[error("invalid store key: {0:?}")]
    InvalidKey(String),
    /// Underlying I/O failure.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure in the typed helpers.
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// `master.key` is present but `SK_MASTER_KEY` is not set; refusing to
    /// read encrypted data in the clear.
    #[error("master.key present but SK_MASTER_KEY unset; refusing to start")]
    MasterKeyRequired,
}

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// Expectation held; the blob was replaced.
    Swapped,
    /// The stored blob did not match the expectation; nothing changed.
    Conflict {
        /// Digest of what is actually stored, `None` when absent.
        actual: Option<BlobDigest>,
    },
}

/// Keyed blob storage port.
pub trait KVStore: Send + Sync {
    /// Read a blob. `None` when absent.
    ///
    /// # Errors
    ///
    /// I/O failures only; absence is `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a blob, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Invalid keys and I/O failures.
    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Delete a blob. Deleting an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Invalid keys and I/O failures.
    fn delete(&mut self, key: &str) -> Result<(), StoreError>;

    /// All keys with the given prefix, sorted.
    ///
    /// # Errors
    ///
    /// I/O failures while walking the tier.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Replace the blob iff the stored content matches `expected`
    /// (`None` = expect absent).
    ///
    /// # Errors
    ///
    /// Invalid keys and I/O failures; a failed expectation is the
    /// [`SwapOutcome::Conflict`] value, not an error.
    fn atomic_swap(
        &mut self,
        key: &str,
        expected: Option<BlobDigest>,
        bytes: &[u8],
    ) -> Result<SwapOutcome, StoreError>;
}

/// Load and deserialize a JSON blob. `Ok(None)` when absent.
///
/// # Errors
///
/// Store and JSON failures.
pub fn get_json<T: DeserializeOwned>(
    store: &dyn KVStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and persist a value as a JSON blob.
///
/// # Errors
///
/// Store and JSON failures.
pub fn put_json<T: Serialize>(
    store: &mut dyn KVStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}

/// Validate a store key: non-empty, `/`-separated segments of
/// `[A-Za-z0-9._-]`, no traversal.
pub(crate) fn check_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.ends_with('/')
        && key.split('/').all(|seg| {
            !seg.is_empty()
                && seg != ".."
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Fail-stop guard: a data directory carrying `master.key` must only be
/// opened when `SK_MASTER_KEY` is set, so encrypted state is never read (or
/// worse, rewritten) in the clear.
///
/// # Errors
///
/// [`StoreError::MasterKeyRequired`] when the marker exists and the
/// environment variable is absent or empty.
pub fn ensure_master_key(data_dir: &std::path::Path) -> Result<(), StoreError> {
    let marker = data_dir.join(keys::MASTER_KEY_FILE);
    if marker.exists() {
        let set = std::env::var(keys::MASTER_KEY_ENV)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if !set {
            return Err(StoreError::MasterKeyRequired);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation_rejects_traversal_and_junk() {
        assert!(check_key("games/abc-123").is_ok());
        assert!(check_key("fsm_state.json").is_ok());
        assert!(check_key("").is_err());
        assert!(check_key("/etc/passwd").is_err());
        assert!(check_key("games/../secrets").is_err());
        assert!(check_key("games//x").is_err());
        assert!(check_key("games/a b").is_err());
    }

    #[test]
    fn blob_digest_is_content_only() {
        assert_eq!(blob_digest(b"abc"), blob_digest(b"abc"));
        assert_ne!(blob_digest(b"abc"), blob_digest(b"abd"));
        assert_eq!(blob_digest(b"abc").to_string().len(), 64);
    }
}
