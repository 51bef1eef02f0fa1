//! Hashing utilities for the network layer
//!
//! Provides the 32-byte [`Hash`] used for block hashes, transaction IDs,
//! filter headers and inventory vectors, together with the SHA-256 helpers
//! that produce it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size of a hash in bytes
pub const HASH_SIZE: usize = 32;

/// Errors produced when parsing a hash from its hex form
#[derive(Error, Debug, PartialEq)]
pub enum HashParseError {
    #[error("Invalid hash length: expected {HASH_SIZE} bytes, got {0}")]
    InvalidLength(usize),
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    sha256(&sha256(data))
}

// =============================================================================
// Hash
// =============================================================================

/// A double SHA-256 digest.
///
/// Stored in internal byte order; displayed and serialized as hex in
/// reversed byte order, the way block explorers print hashes.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// The all-zero hash
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    /// Wrap raw bytes in internal byte order
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary data with double SHA-256
    pub fn digest(data: &[u8]) -> Self {
        Self(double_sha256(data))
    }

    /// Hash the concatenation of two hashes (merkle branches, filter headers)
    pub fn digest_pair(left: &Hash, right: &Hash) -> Self {
        let mut buf = [0u8; HASH_SIZE * 2];
        buf[..HASH_SIZE].copy_from_slice(&left.0);
        buf[HASH_SIZE..].copy_from_slice(&right.0);
        Self::digest(&buf)
    }

    /// Raw bytes in internal byte order
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = hex::decode(s)?;
        if bytes.len() != HASH_SIZE {
            return Err(HashParseError::InvalidLength(bytes.len()));
        }
        bytes.reverse();
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_str(&s).map_err(serde::de::Error::custom)
    }
}
