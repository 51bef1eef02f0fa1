//! Transactions as carried by the network layer
//!
//! The peer core never validates transactions; it only needs their hash for
//! inventory, their scripts and outpoints for bloom filter matching, and the
//! fee rate of mempool entries for fee-filter checks.

use crate::crypto::Hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Current transaction version
pub const TX_VERSION: i32 = 2;

/// Sequence number that disables locktime
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// Satoshis per coin
pub const SATOSHI_PER_COIN: i64 = 100_000_000;

/// Largest valid amount in satoshis (21 million coins)
pub const MAX_SATOSHI: i64 = 21_000_000 * SATOSHI_PER_COIN;

// =============================================================================
// Serialization helpers
// =============================================================================

/// Append a Bitcoin compact-size integer
pub(crate) fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_compact_size(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

// =============================================================================
// Outpoint
// =============================================================================

/// Reference to a specific output of a previous transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// 36-byte serialization used by bloom filters: hash followed by LE index
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..32].copy_from_slice(self.hash.as_bytes());
        out[32..].copy_from_slice(&self.index.to_le_bytes());
        out
    }
}

// =============================================================================
// Inputs and outputs
// =============================================================================

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_outpoint: OutPoint,
    pub signature_script: Vec<u8>,
    #[serde(default)]
    pub witness: Vec<Vec<u8>>,
    pub sequence: u32,
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: i64,
    pub pk_script: Vec<u8>,
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Serialization without witness data, which is what the txid commits to
    pub fn serialize_no_witness(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + 64 * (self.inputs.len() + self.outputs.len()));
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(&input.previous_outpoint.to_bytes());
            write_var_bytes(&mut buf, &input.signature_script);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_compact_size(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_var_bytes(&mut buf, &output.pk_script);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// Transaction id
    pub fn txid(&self) -> Hash {
        Hash::digest(&self.serialize_no_witness())
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// A coinbase spends the null outpoint
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].previous_outpoint.hash.is_zero()
            && self.inputs[0].previous_outpoint.index == u32::MAX
    }
}

// =============================================================================
// Mempool descriptor
// =============================================================================

/// Descriptor for a transaction in the transaction pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxDesc {
    pub tx: Transaction,
    /// Time the transaction entered the pool
    pub added: DateTime<Utc>,
    /// Best chain height when the transaction entered the pool
    pub height: i32,
    /// Total fee paid, in satoshis
    pub fee: i64,
    /// Fee rate in satoshis per 1000 bytes
    pub fee_per_kb: i64,
}

impl TxDesc {
    /// Build a descriptor, deriving the fee rate from the serialized size
    pub fn new(tx: Transaction, fee: i64, height: i32) -> Self {
        let size = tx.serialize_no_witness().len().max(1) as i64;
        Self {
            fee_per_kb: fee.saturating_mul(1000) / size,
            tx,
            added: Utc::now(),
            height,
            fee,
        }
    }
}
