// SPDX-License-Identifier: Apache-2.0
//! In-memory store tier.

use std::collections::BTreeMap;

use crate::{blob_digest, check_key, BlobDigest, KVStore, StoreError, SwapOutcome};

/// `BTreeMap`-backed tier for tests and warm caches. Listing order is the
/// key order, which keeps everything built on it deterministic.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    blobs: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs held.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl KVStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.get(key).cloned())
    }

    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        self.blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        check_key(key)?;
        self.blobs.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .blobs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn atomic_swap(
        &mut self,
        key: &str,
        expected: Option<BlobDigest>,
        bytes: &[u8],
    ) -> Result<SwapOutcome, StoreError> {
        check_key(key)?;
        let actual = self.blobs.get(key).map(|b| blob_digest(b));
        if actual != expected {
            return Ok(SwapOutcome::Conflict { actual });
        }
        self.blobs.insert(key.to_string(), bytes.to_vec());
        Ok(SwapOutcome::Swapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_cycle() {
        let mut store = MemoryStore::new();
        store.put("games/a", b"one").unwrap();
        assert_eq!(store.get("games/a").unwrap().as_deref(), Some(&b"one"[..]));
        store.delete("games/a").unwrap();
        assert_eq!(store.get("games/a").unwrap(), None);
        // Deleting again is a no-op.
        store.delete("games/a").unwrap();
    }

    #[test]
    fn list_is_prefix_scoped_and_sorted() {
        let mut store = MemoryStore::new();
        store.put("teams/z", b"z").unwrap();
        store.put("games/b", b"b").unwrap();
        store.put("games/a", b"a").unwrap();
        assert_eq!(store.list("games/").unwrap(), vec!["games/a", "games/b"]);
        assert_eq!(store.list("").unwrap().len(), 3);
    }

    #[test]
    fn swap_honors_expectations() {
        let mut store = MemoryStore::new();
        // Expect-absent on an absent key succeeds.
        assert_eq!(
            store.atomic_swap("k", None, b"v1").unwrap(),
            SwapOutcome::Swapped
        );
        // Stale expectation conflicts and reports the actual digest.
        match store.atomic_swap("k", None, b"v2").unwrap() {
            SwapOutcome::Conflict { actual } => {
                assert_eq!(actual, Some(blob_digest(b"v1")));
            }
            SwapOutcome::Swapped => panic!("stale swap must conflict"),
        }
        // Correct expectation swaps.
        assert_eq!(
            store
                .atomic_swap("k", Some(blob_digest(b"v1")), b"v2")
                .unwrap(),
            SwapOutcome::Swapped
        );
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"v2"[..]));
    }
}
