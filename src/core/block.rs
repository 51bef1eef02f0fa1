//! Block and block header types
//!
//! A block contains an 80-byte header and a list of transactions.

use crate::core::transaction::Transaction;
use crate::crypto::{calculate_merkle_root, Hash};
use serde::{Deserialize, Serialize};

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Block header containing metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: i32,
    /// Hash of the previous block
    pub prev_block: Hash,
    /// Merkle root of all transactions
    pub merkle_root: Hash,
    /// Block creation time (unix seconds)
    pub timestamp: u32,
    /// Compact difficulty target
    pub bits: u32,
    /// Nonce used for proof of work
    pub nonce: u32,
}

impl BlockHeader {
    /// The 80-byte serialization committed to by the block hash
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_block.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Calculate the hash of the block header
    pub fn block_hash(&self) -> Hash {
        Hash::digest(&self.to_bytes())
    }
}

/// A full block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block on top of `prev_block`, computing its merkle root
    pub fn new(prev_block: Hash, timestamp: u32, transactions: Vec<Transaction>) -> Self {
        let txids: Vec<Hash> = transactions.iter().map(Transaction::txid).collect();
        Self {
            header: BlockHeader {
                version: 1,
                prev_block,
                merkle_root: calculate_merkle_root(&txids),
                timestamp,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
        }
    }

    pub fn block_hash(&self) -> Hash {
        self.header.block_hash()
    }

    pub fn txids(&self) -> Vec<Hash> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_hash_commits_to_nonce() {
        let block = Block::new(Hash::ZERO, 1_700_000_000, vec![]);
        let mut other = block.header;
        other.nonce += 1;
        assert_ne!(block.block_hash(), other.block_hash());
    }

    #[test]
    fn test_chained_blocks_link() {
        let genesis = Block::new(Hash::ZERO, 0, vec![]);
        let next = Block::new(genesis.block_hash(), 600, vec![]);
        assert_eq!(next.header.prev_block, genesis.block_hash());
    }
}
