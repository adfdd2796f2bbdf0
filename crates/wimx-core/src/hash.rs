use std::fmt;

use sha1::{Digest, Sha1};

/// Number of bytes in a stream identity hash.
pub const HASH_SIZE: usize = 20;

/// SHA-1 identity of a stream's uncompressed bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamHash(pub [u8; HASH_SIZE]);

impl StreamHash {
    /// The all-zero hash, used by descriptors whose identity has not been
    /// computed yet.
    pub const ZERO: StreamHash = StreamHash([0; HASH_SIZE]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; HASH_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Hashes a complete in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut digest = StreamDigest::new();
        digest.update(data);
        digest.finalize()
    }
}

impl From<[u8; HASH_SIZE]> for StreamHash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamHash({self})")
    }
}

/// Incremental SHA-1 over a stream's chunks.
#[derive(Debug, Clone, Default)]
pub struct StreamDigest(Sha1);

impl StreamDigest {
    pub fn new() -> Self {
        Self(Sha1::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> StreamHash {
        StreamHash(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_is_zero() {
        assert!(StreamHash::ZERO.is_zero());
        assert!(!StreamHash::of(b"abc").is_zero());
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut digest = StreamDigest::new();
        digest.update(b"hello ");
        digest.update(b"world");
        assert_eq!(digest.finalize(), StreamHash::of(b"hello world"));
    }

    #[test]
    fn display_is_lowercase_hex() {
        let rendered = StreamHash::of(b"abc").to_string();
        assert_eq!(rendered, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(rendered.len(), HASH_SIZE * 2);
    }
}
