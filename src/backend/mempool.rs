//! Transaction pool (mempool) for pending transactions
//!
//! Holds transactions handed over by the validation layer, plus orphans
//! tagged with the peer that sent them so they can be evicted when that
//! peer disconnects.

use crate::backend::{MempoolError, TxPool};
use crate::core::{Transaction, TxDesc};
use crate::crypto::Hash;
use parking_lot::RwLock;
use std::collections::HashMap;

// =============================================================================
// Configuration
// =============================================================================

/// Default maximum mempool transaction count
pub const DEFAULT_MEMPOOL_SIZE: usize = 10_000;

/// Maximum number of orphans kept at once
pub const MAX_ORPHANS: usize = 100;

// =============================================================================
// Mempool
// =============================================================================

#[derive(Debug, Clone)]
struct Orphan {
    tx: Transaction,
    tag: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Transactions indexed by id
    entries: HashMap<Hash, TxDesc>,
    /// Transaction ids in order of arrival
    by_time: Vec<Hash>,
    orphans: HashMap<Hash, Orphan>,
}

/// In-memory transaction pool
#[derive(Debug)]
pub struct MemPool {
    state: RwLock<PoolState>,
    max_size: usize,
}

impl Default for MemPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMPOOL_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            max_size,
        }
    }

    /// Add an accepted transaction
    pub fn add(&self, desc: TxDesc) -> Result<Hash, MempoolError> {
        let txid = desc.tx.txid();
        let mut state = self.state.write();
        if state.entries.contains_key(&txid) {
            return Err(MempoolError::Duplicate(txid));
        }
        if state.entries.len() >= self.max_size {
            return Err(MempoolError::MempoolFull);
        }
        state.orphans.remove(&txid);
        state.by_time.push(txid);
        state.entries.insert(txid, desc);
        Ok(txid)
    }

    /// Keep a transaction whose inputs are unknown, tagged with its source
    pub fn add_orphan(&self, tx: Transaction, tag: u64) -> Hash {
        let txid = tx.txid();
        let mut state = self.state.write();
        if state.orphans.len() >= MAX_ORPHANS {
            // Evict an arbitrary orphan
            if let Some(victim) = state.orphans.keys().next().copied() {
                state.orphans.remove(&victim);
            }
        }
        state.orphans.insert(txid, Orphan { tx, tag });
        txid
    }

    /// Remove a transaction, e.g. once it is mined
    pub fn remove(&self, txid: &Hash) -> Option<TxDesc> {
        let mut state = self.state.write();
        let desc = state.entries.remove(txid)?;
        state.by_time.retain(|id| id != txid);
        Some(desc)
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.state.read().entries.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn orphan_count(&self) -> usize {
        self.state.read().orphans.len()
    }
}

impl TxPool for MemPool {
    fn fetch_transaction(&self, hash: &Hash) -> Result<Transaction, MempoolError> {
        self.state
            .read()
            .entries
            .get(hash)
            .map(|desc| desc.tx.clone())
            .ok_or(MempoolError::NotFound(*hash))
    }

    fn tx_descs(&self) -> Vec<TxDesc> {
        let state = self.state.read();
        state
            .by_time
            .iter()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect()
    }

    fn remove_orphans_by_tag(&self, tag: u64) -> usize {
        let mut state = self.state.write();
        let before = state.orphans.len();
        state.orphans.retain(|_, orphan| orphan.tag != tag);
        let removed = before - state.orphans.len();
        if removed > 0 {
            log::debug!("Evicted {} orphans from peer {}", removed, tag);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutPoint, TxIn, TxOut, SEQUENCE_FINAL, TX_VERSION};

    fn tx(n: u8) -> Transaction {
        Transaction {
            version: TX_VERSION,
            inputs: vec![TxIn {
                previous_outpoint: OutPoint::new(Hash::digest(&[n]), 0),
                signature_script: vec![],
                witness: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut {
                value: 1_000,
                pk_script: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_add_and_fetch() {
        let pool = MemPool::new();
        let txid = pool.add(TxDesc::new(tx(1), 500, 1)).unwrap();
        assert_eq!(pool.fetch_transaction(&txid).unwrap(), tx(1));
        assert!(matches!(
            pool.add(TxDesc::new(tx(1), 500, 1)),
            Err(MempoolError::Duplicate(_))
        ));
        assert!(matches!(
            pool.fetch_transaction(&Hash::ZERO),
            Err(MempoolError::NotFound(_))
        ));
    }

    #[test]
    fn test_descs_in_arrival_order() {
        let pool = MemPool::new();
        let a = pool.add(TxDesc::new(tx(1), 1, 1)).unwrap();
        let b = pool.add(TxDesc::new(tx(2), 1, 1)).unwrap();
        let ids: Vec<Hash> = pool.tx_descs().iter().map(|d| d.tx.txid()).collect();
        assert_eq!(ids, vec![a, b]);

        pool.remove(&a);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let pool = MemPool::with_capacity(1);
        pool.add(TxDesc::new(tx(1), 1, 1)).unwrap();
        assert!(matches!(
            pool.add(TxDesc::new(tx(2), 1, 1)),
            Err(MempoolError::MempoolFull)
        ));
    }

    #[test]
    fn test_remove_orphans_by_tag() {
        let pool = MemPool::new();
        pool.add_orphan(tx(1), 7);
        pool.add_orphan(tx(2), 7);
        pool.add_orphan(tx(3), 8);

        assert_eq!(pool.remove_orphans_by_tag(7), 2);
        assert_eq!(pool.orphan_count(), 1);
        assert_eq!(pool.remove_orphans_by_tag(7), 0);
    }
}
