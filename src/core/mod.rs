//! Core chain primitives moved around by the network layer
//!
//! This module contains:
//! - Transactions and transaction pool descriptors
//! - Blocks and block headers
//! - SPV support (bloom filters, merkle blocks)

pub mod block;
pub mod spv;
pub mod transaction;

pub use block::{Block, BlockHeader, BLOCK_HEADER_SIZE};
pub use spv::{
    murmur3, pushed_data, BloomFilter, BloomUpdate, MerkleBlock, MAX_FILTER_ADD_DATA_SIZE,
    MAX_FILTER_LOAD_FILTER_SIZE, MAX_FILTER_LOAD_HASH_FUNCS,
};
pub use transaction::{
    OutPoint, Transaction, TxDesc, TxIn, TxOut, MAX_SATOSHI, SATOSHI_PER_COIN, SEQUENCE_FINAL,
    TX_VERSION,
};
