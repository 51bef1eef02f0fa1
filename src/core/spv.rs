//! SPV (Simplified Payment Verification) Support
//!
//! Server-side support for light clients:
//! - Bloom filters for transaction matching (BIP 37)
//! - Merkle blocks proving inclusion of the matched transactions

use crate::core::{Block, BlockHeader, OutPoint, Transaction};
use crate::crypto::{tree_node_hash, tree_width, Hash};
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Maximum bloom filter size in bytes
pub const MAX_FILTER_LOAD_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions a filter may use
pub const MAX_FILTER_LOAD_HASH_FUNCS: u32 = 50;

/// Maximum size of a single `filteradd` element
pub const MAX_FILTER_ADD_DATA_SIZE: usize = 520;

const HASH_SEED_MULTIPLIER: u32 = 0xfba4_c795;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

/// How a filter updates itself when an output matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloomUpdate {
    /// Never add outpoints
    None,
    /// Add the outpoint of every matching output
    All,
    /// Add outpoints only for pay-to-pubkey and bare multisig outputs
    P2PubkeyOnly,
}

// =============================================================================
// Murmur3
// =============================================================================

/// 32-bit Murmur3 as specified by BIP 37
pub fn murmur3(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut hash = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            .wrapping_mul(C1)
            .rotate_left(15)
            .wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k ^= (*byte as u32) << (8 * i);
        }
        hash ^= k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^ (hash >> 16)
}

// =============================================================================
// Script inspection
// =============================================================================

/// Data pushed by a script, including the empty push of OP_0.
///
/// Returns `None` when the script is malformed (a push runs past the end).
pub fn pushed_data(script: &[u8]) -> Option<Vec<&[u8]>> {
    let mut pushes = Vec::new();
    let mut i = 0;

    while i < script.len() {
        let op = script[i];
        i += 1;
        let len = match op {
            OP_0 => 0,
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let n = *script.get(i)? as usize;
                i += 1;
                n
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(i..i + 2)?;
                i += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(i..i + 4)?;
                i += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => continue,
        };
        let end = i.checked_add(len)?;
        pushes.push(script.get(i..end)?);
        i = end;
    }

    Some(pushes)
}

fn is_pubkey_script(script: &[u8]) -> bool {
    match script.len() {
        35 => script[0] == 33 && script[34] == OP_CHECKSIG,
        67 => script[0] == 65 && script[66] == OP_CHECKSIG,
        _ => false,
    }
}

fn is_multisig_script(script: &[u8]) -> bool {
    script.len() >= 3
        && (OP_1..=OP_16).contains(&script[0])
        && (OP_1..=OP_16).contains(&script[script.len() - 2])
        && script[script.len() - 1] == OP_CHECKMULTISIG
}

// =============================================================================
// Bloom Filter (BIP 37)
// =============================================================================

/// Bloom filter loaded by a light client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Filter data (bit array)
    data: Vec<u8>,
    /// Number of hash functions
    hash_funcs: u32,
    /// Tweak for hash randomization
    tweak: u32,
    /// Update behaviour on matching outputs
    flags: BloomUpdate,
}

impl BloomFilter {
    /// Create a filter from `filterload` parameters.
    ///
    /// Returns `None` when the parameters exceed the protocol limits.
    pub fn new(data: Vec<u8>, hash_funcs: u32, tweak: u32, flags: BloomUpdate) -> Option<Self> {
        if data.len() > MAX_FILTER_LOAD_FILTER_SIZE || hash_funcs > MAX_FILTER_LOAD_HASH_FUNCS {
            return None;
        }
        Some(Self {
            data,
            hash_funcs,
            tweak,
            flags,
        })
    }

    /// Create an empty filter sized for `elements` entries at false positive rate `fp_rate`
    pub fn for_elements(elements: u32, fp_rate: f64, tweak: u32, flags: BloomUpdate) -> Self {
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let bits = (-1.0 / ln2_squared) * elements.max(1) as f64 * fp_rate.ln();
        let bytes = ((bits / 8.0) as usize).clamp(1, MAX_FILTER_LOAD_FILTER_SIZE);
        let funcs = ((bytes * 8) as f64 / elements.max(1) as f64 * std::f64::consts::LN_2) as u32;

        Self {
            data: vec![0u8; bytes],
            hash_funcs: funcs.clamp(1, MAX_FILTER_LOAD_HASH_FUNCS),
            tweak,
            flags,
        }
    }

    /// Add data to the filter
    pub fn insert(&mut self, data: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for n in 0..self.hash_funcs {
            let idx = self.hash(data, n);
            self.data[idx >> 3] |= 1 << (idx & 7);
        }
    }

    /// Check if data might be in the filter
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|n| {
            let idx = self.hash(data, n);
            self.data[idx >> 3] & (1 << (idx & 7)) != 0
        })
    }

    pub fn insert_outpoint(&mut self, outpoint: &OutPoint) {
        self.insert(&outpoint.to_bytes());
    }

    pub fn contains_outpoint(&self, outpoint: &OutPoint) -> bool {
        self.contains(&outpoint.to_bytes())
    }

    /// Check a transaction against the filter, adding the outpoints of
    /// matching outputs according to the update flags.
    pub fn matches_tx_and_update(&mut self, tx: &Transaction) -> bool {
        let txid = tx.txid();
        let mut matched = self.contains(txid.as_bytes());

        for (index, output) in tx.outputs.iter().enumerate() {
            let Some(pushes) = pushed_data(&output.pk_script) else {
                continue;
            };
            if pushes.iter().any(|data| self.contains(data)) {
                matched = true;
                self.maybe_add_outpoint(&output.pk_script, OutPoint::new(txid, index as u32));
            }
        }

        if matched {
            return true;
        }

        tx.inputs.iter().any(|input| {
            if self.contains_outpoint(&input.previous_outpoint) {
                return true;
            }
            pushed_data(&input.signature_script)
                .map(|pushes| pushes.iter().any(|data| self.contains(data)))
                .unwrap_or(false)
        })
    }

    /// Get filter size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn flags(&self) -> BloomUpdate {
        self.flags
    }

    fn maybe_add_outpoint(&mut self, pk_script: &[u8], outpoint: OutPoint) {
        match self.flags {
            BloomUpdate::All => self.insert_outpoint(&outpoint),
            BloomUpdate::P2PubkeyOnly
                if is_pubkey_script(pk_script) || is_multisig_script(pk_script) =>
            {
                self.insert_outpoint(&outpoint)
            }
            _ => {}
        }
    }

    fn hash(&self, data: &[u8], n: u32) -> usize {
        let seed = n.wrapping_mul(HASH_SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3(data, seed) as usize % (self.data.len() * 8)
    }
}

// =============================================================================
// Merkle Block
// =============================================================================

/// A block header plus a partial merkle tree proving the matched transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    /// Number of transactions in the full block
    pub total_transactions: u32,
    /// Hashes of the partial merkle tree, depth first
    pub hashes: Vec<Hash>,
    /// Traversal bits, packed little-endian
    pub flags: Vec<u8>,
}

struct PartialTreeBuilder<'a> {
    txids: &'a [Hash],
    matched: &'a [bool],
    bits: Vec<bool>,
    hashes: Vec<Hash>,
}

impl PartialTreeBuilder<'_> {
    fn traverse(&mut self, height: u32, pos: usize) {
        let start = pos << height;
        let end = ((pos + 1) << height).min(self.txids.len());
        let is_parent = (start..end).any(|i| self.matched.get(i).copied().unwrap_or(false));
        self.bits.push(is_parent);

        if height == 0 || !is_parent {
            self.hashes.push(tree_node_hash(self.txids, height, pos));
            return;
        }

        self.traverse(height - 1, pos * 2);
        if pos * 2 + 1 < tree_width(self.txids.len(), height - 1) {
            self.traverse(height - 1, pos * 2 + 1);
        }
    }
}

impl MerkleBlock {
    /// Build a merkle block for `block`, matching (and updating) `filter`.
    ///
    /// Returns the merkle block and the indices of the matched transactions.
    pub fn from_block(block: &Block, filter: &mut BloomFilter) -> (Self, Vec<usize>) {
        let matched: Vec<bool> = block
            .transactions
            .iter()
            .map(|tx| filter.matches_tx_and_update(tx))
            .collect();
        Self::from_matches(block, &matched)
    }

    /// Build a merkle block from per-transaction match results, one entry
    /// per transaction in `block`; missing entries count as unmatched
    pub fn from_matches(block: &Block, matched: &[bool]) -> (Self, Vec<usize>) {
        let txids = block.txids();
        let matched_indices = matched
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.then_some(i))
            .collect();

        let mut builder = PartialTreeBuilder {
            txids: &txids,
            matched,
            bits: Vec::new(),
            hashes: Vec::new(),
        };

        if !txids.is_empty() {
            let mut height = 0;
            while tree_width(txids.len(), height) > 1 {
                height += 1;
            }
            builder.traverse(height, 0);
        }

        let mut flags = vec![0u8; (builder.bits.len() + 7) / 8];
        for (i, bit) in builder.bits.iter().enumerate() {
            if *bit {
                flags[i / 8] |= 1 << (i % 8);
            }
        }

        (
            Self {
                header: block.header,
                total_transactions: txids.len() as u32,
                hashes: builder.hashes,
                flags,
            },
            matched_indices,
        )
    }
}
