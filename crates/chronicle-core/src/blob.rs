use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content-derived identity of a binary object: lower-case hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wrap an already computed hash.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Hash a buffer.
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that `bytes` digest to this hash.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        *self == Self::of(bytes)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable metadata of a stored blob (the `bvobs` record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub content_hash: ContentHash,
    pub byte_length: u64,
    pub persist_ref_count: i64,
}

impl BlobMeta {
    pub fn new(content_hash: ContentHash, byte_length: u64, persist_ref_count: i64) -> Self {
        Self {
            content_hash,
            byte_length,
            persist_ref_count: persist_ref_count.max(0),
        }
    }

    /// Apply a signed delta, clamping at zero.
    pub fn adjust(&mut self, delta: i64) {
        self.persist_ref_count = (self.persist_ref_count + delta).max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_of_hello() {
        let hash = ContentHash::of(b"hello");
        assert_eq!(
            hash.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(hash.matches(b"hello"));
        assert!(!hash.matches(b"hellO"));
    }

    #[test]
    fn test_meta_adjust_clamps_at_zero() {
        let mut meta = BlobMeta::new(ContentHash::of(b"x"), 1, 1);
        meta.adjust(-3);
        assert_eq!(meta.persist_ref_count, 0);
        meta.adjust(2);
        assert_eq!(meta.persist_ref_count, 2);
    }
}
