//! # strata-hash
//!
//! Content hashing for the Strata CAS.
//!
//! Every stored object is identified by the SHA-256 digest of its bytes,
//! rendered as a 64-character lowercase hex string. [`hash_bytes`] and
//! [`StreamingHasher`] are guaranteed to produce identical results for the
//! same logical content regardless of how the input is chunked.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from parsing a content hash.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HashError {
    #[error("invalid hash length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hash encoding: {0}")]
    InvalidHex(String),
}

/// SHA-256 content identifier (32 bytes).
///
/// Displays as 64 lowercase hex characters; this string form is used for
/// backend keys and metadata rows.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, 64 chars.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First two hex characters, used to shard storage directories.
    pub fn shard_prefix(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(HashError::InvalidLength(s.len()));
        }
        // Reject uppercase: hashes are canonically lowercase everywhere.
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(HashError::InvalidHex(s.to_string()));
        }
        let raw = hex::decode(s).map_err(|_| HashError::InvalidHex(s.to_string()))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&raw);
        Ok(Self(out))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute the SHA-256 content hash of a byte slice.
#[inline]
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash(Sha256::digest(data).into())
}

/// Incremental hasher for content too large to materialize in memory.
///
/// Feeding the concatenation of the same bytes yields the same hash as
/// [`hash_bytes`], whatever the chunk boundaries.
#[derive(Default)]
pub struct StreamingHasher {
    inner: Sha256,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(
            hash_bytes(b"Hello World").to_hex(),
            "a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e"
        );
        assert_eq!(
            hash_bytes(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn streaming_matches_oneshot() {
        let data: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();

        for chunk_size in [1usize, 7, 64, 4096, 100_000] {
            let mut hasher = StreamingHasher::new();
            for chunk in data.chunks(chunk_size) {
                hasher.update(chunk);
            }
            assert_eq!(hasher.finalize(), hash_bytes(&data), "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn hex_roundtrip() {
        let hash = hash_bytes(b"roundtrip");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(
            "deadbeef".parse::<ContentHash>(),
            Err(HashError::InvalidLength(8))
        );
        let upper = hash_bytes(b"x").to_hex().to_uppercase();
        assert!(matches!(
            upper.parse::<ContentHash>(),
            Err(HashError::InvalidHex(_))
        ));
        let nonhex = "z".repeat(64);
        assert!(matches!(
            nonhex.parse::<ContentHash>(),
            Err(HashError::InvalidHex(_))
        ));
    }

    #[test]
    fn shard_prefix_is_first_two_chars() {
        let hash = hash_bytes(b"shard me");
        assert_eq!(hash.shard_prefix(), &hash.to_hex()[..2]);
    }

    #[test]
    fn serde_as_hex_string() {
        let hash = hash_bytes(b"serde");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
