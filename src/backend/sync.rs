//! Minimal sync manager for a standalone node
//!
//! Accepts blocks into the in-memory chain and transactions into the
//! in-memory pool without validation, acknowledges every queued item right
//! away and reports what it accepted so the node can relay it.

use crate::backend::{ChainProvider, MemChain, MemPool, SyncManager};
use crate::core::{Block, BlockHeader, Transaction, TxDesc};
use crate::crypto::Hash;
use crate::network::message::InvVect;
use crate::network::peer::PeerInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Something the sync manager accepted from a peer
#[derive(Debug, Clone)]
pub enum Accepted {
    Tx(TxDesc),
    Block {
        hash: Hash,
        height: i32,
        header: BlockHeader,
        /// Transactions the block confirmed
        txids: Vec<Hash>,
        /// Peer the block came from
        origin: u64,
    },
}

/// Immediate-acknowledgement sync manager
pub struct LocalSync {
    chain: Arc<MemChain>,
    pool: Arc<MemPool>,
    peers: Mutex<HashMap<u64, PeerInfo>>,
    current: AtomicBool,
    accepted: mpsc::UnboundedSender<Accepted>,
}

impl LocalSync {
    pub fn new(
        chain: Arc<MemChain>,
        pool: Arc<MemPool>,
    ) -> (Self, mpsc::UnboundedReceiver<Accepted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sync = Self {
            chain,
            pool,
            peers: Mutex::new(HashMap::new()),
            current: AtomicBool::new(true),
            accepted: tx,
        };
        (sync, rx)
    }

    pub fn set_current(&self, current: bool) {
        self.current.store(current, Ordering::SeqCst);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    fn notify(&self, accepted: Accepted) {
        // The receiver going away only means nobody relays any more
        let _ = self.accepted.send(accepted);
    }
}

impl SyncManager for LocalSync {
    fn new_peer(&self, peer: &PeerInfo) {
        log::debug!("Sync manager tracking peer {} ({})", peer.id, peer.addr);
        self.peers.lock().insert(peer.id, peer.clone());
    }

    fn done_peer(&self, peer_id: u64) {
        if self.peers.lock().remove(&peer_id).is_none() {
            log::warn!("Received done peer message for unknown peer {}", peer_id);
        }
    }

    fn queue_tx(&self, tx: Transaction, peer_id: u64, done: oneshot::Sender<()>) {
        let height = self.chain.best_snapshot().height;
        let desc = TxDesc::new(tx, 0, height);
        match self.pool.add(desc.clone()) {
            Ok(txid) => {
                log::debug!("Accepted transaction {} from peer {}", txid, peer_id);
                self.notify(Accepted::Tx(desc));
            }
            Err(e) => log::debug!("Rejected transaction from peer {}: {}", peer_id, e),
        }
        let _ = done.send(());
    }

    fn queue_block(&self, block: Block, peer_id: u64, done: oneshot::Sender<()>) {
        let hash = block.block_hash();
        let header = block.header;
        let txids = block.txids();
        match self.chain.add_block(block) {
            Ok(true) => {
                for txid in &txids {
                    self.pool.remove(txid);
                }
                let height = self.chain.block_height(&hash).unwrap_or_default();
                log::info!("Accepted block {} at height {} from peer {}", hash, height, peer_id);
                if let Some(peer) = self.peers.lock().get_mut(&peer_id) {
                    peer.last_block = peer.last_block.max(height);
                }
                self.notify(Accepted::Block {
                    hash,
                    height,
                    header,
                    txids,
                    origin: peer_id,
                });
            }
            Ok(false) => log::debug!("Already have block {}", hash),
            Err(e) => log::debug!("Rejected block {} from peer {}: {}", hash, peer_id, e),
        }
        let _ = done.send(());
    }

    fn queue_inv(&self, inv: Vec<InvVect>, peer_id: u64) {
        log::trace!("Peer {} announced {} inventory vectors", peer_id, inv.len());
    }

    fn queue_headers(&self, headers: Vec<BlockHeader>, peer_id: u64) {
        log::trace!("Peer {} sent {} headers", peer_id, headers.len());
    }

    fn queue_not_found(&self, inv: Vec<InvVect>, peer_id: u64) {
        log::trace!("Peer {} does not have {} requested items", peer_id, inv.len());
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }
}
