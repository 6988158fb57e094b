//! Incremental SHA-256 hashing of downloaded bytes.
//!
//! [`HashState`] is a live, clonable checkpoint: cloning it lets a resumed
//! writer continue hashing exactly where the previous attempt stopped.
//! [`ContentHash`] is the finalized digest, either of a complete file or of
//! the prefix saved so far.

use std::fmt;

use sha2::{Digest, Sha256};

/// Running hash over the bytes written so far.
#[derive(Clone, Default)]
pub struct HashState {
    hasher: Sha256,
    bytes_hashed: u64,
}

impl HashState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_hashed += data.len() as u64;
    }

    /// Number of bytes fed into the hash.
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Digest of everything hashed so far. The state itself is unchanged.
    #[must_use]
    pub fn finish(&self) -> ContentHash {
        ContentHash(self.hasher.clone().finalize().into())
    }
}

impl fmt::Debug for HashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashState")
            .field("bytes_hashed", &self.bytes_hashed)
            .finish_non_exhaustive()
    }
}

/// A finalized SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hashes `data` in one pass.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex digest.
    #[must_use]
    pub fn from_hex(value: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(value, &mut bytes).ok()?;
        Some(Self(bytes))
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
