// SPDX-License-Identifier: Apache-2.0
//! Canonical encoding and state digests.
//!
//! Determinism contract
//! - Canonical bytes are JSON with object keys in sorted order. Values are
//!   first lifted into `serde_json::Value` (whose object map is a `BTreeMap`)
//!   so struct field declaration order cannot leak into the encoding.
//! - The state digest is a BLAKE3 hash over a domain separator plus the
//!   canonical bytes. Changing either the separator or the encoding is a
//!   breaking change to every stored digest.

use serde::Serialize;

/// A 32-byte BLAKE3 digest of canonical state bytes.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// View the digest as raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Domain separator for state digests.
const STATE_DIGEST_V1: &[u8] = b"tally:state-digest:v1";

/// Encode a value as canonical JSON bytes (sorted object keys).
///
/// # Errors
///
/// Propagates `serde_json` encoding failures (non-string map keys and the
/// like); the core types never trigger them.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// Digest a value's canonical encoding.
///
/// # Errors
///
/// Propagates `serde_json` encoding failures from [`canonical_bytes`].
pub fn state_digest<T: Serialize>(value: &T) -> Result<Digest, serde_json::Error> {
    let bytes = canonical_bytes(value)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(STATE_DIGEST_V1);
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(&bytes);
    Ok(Digest(*hasher.finalize().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn canonical_bytes_sort_object_keys() {
        let mut a = BTreeMap::new();
        a.insert("zebra", 1);
        a.insert("apple", 2);
        let bytes = canonical_bytes(&a).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.find("apple").unwrap() < text.find("zebra").unwrap());
    }

    #[test]
    fn digest_is_content_sensitive() {
        let a = vec![1u32, 2, 3];
        let b = vec![1u32, 2, 4];
        assert_eq!(state_digest(&a).unwrap(), state_digest(&a).unwrap());
        assert_ne!(state_digest(&a).unwrap(), state_digest(&b).unwrap());
    }

    #[test]
    fn digest_renders_as_hex() {
        let d = Digest([0xab; 32]);
        assert_eq!(d.to_string().len(), 64);
        assert!(d.to_string().starts_with("abab"));
    }
}
