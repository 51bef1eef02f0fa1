//! Cryptographic utilities for the network layer
//!
//! This module provides:
//! - SHA-256 hashing and the 32-byte [`Hash`] type
//! - Merkle tree calculations

pub mod hash;
pub mod merkle;

pub use hash::{double_sha256, sha256, Hash, HashParseError, HASH_SIZE};
pub use merkle::{calculate_merkle_root, tree_node_hash, tree_width};
