//! Collaborators consumed by the networking core
//!
//! The peer layer never validates blocks or transactions itself. It talks to
//! the chain index, transaction pool, address book, connection manager and
//! sync manager through the traits defined here. In-memory implementations
//! are provided so the node can run standalone.

pub mod addrman;
pub mod chain;
pub mod mempool;
pub mod sync;

pub use addrman::MemAddrManager;
pub use chain::MemChain;
pub use mempool::MemPool;
pub use sync::{Accepted, LocalSync};

use crate::core::{Block, BlockHeader, Transaction, TxDesc};
use crate::crypto::Hash;
use crate::network::message::{FilterType, InvVect, NetAddress, ServiceFlags};
use crate::network::peer::PeerInfo;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

// =============================================================================
// Errors
// =============================================================================

/// Chain and filter index lookup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Block not found: {0}")]
    NotFound(Hash),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Transaction pool lookup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Transaction not found: {0}")]
    NotFound(Hash),
    #[error("Transaction already exists: {0}")]
    Duplicate(Hash),
    #[error("Mempool full")]
    MempoolFull,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

// =============================================================================
// Chain / index provider
// =============================================================================

/// Snapshot of the best chain tip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestState {
    pub hash: Hash,
    pub height: i32,
    pub median_time: DateTime<Utc>,
}

/// Consensus deployments the peer layer cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Deployment {
    Segwit,
}

pub trait ChainProvider: Send + Sync {
    fn best_snapshot(&self) -> BestState;

    fn block_by_hash(&self, hash: &Hash) -> Result<Block, ChainError>;

    fn header_by_hash(&self, hash: &Hash) -> Result<BlockHeader, ChainError>;

    /// Hashes of main-chain blocks after the first known locator hash, up to
    /// and including `hash_stop` or `max_hashes` entries
    fn locate_blocks(&self, locator: &[Hash], hash_stop: &Hash, max_hashes: usize) -> Vec<Hash>;

    /// Headers following the locator, up to and including `hash_stop`
    fn locate_headers(&self, locator: &[Hash], hash_stop: &Hash) -> Vec<BlockHeader>;

    fn is_deployment_active(&self, deployment: Deployment) -> Result<bool, ChainError>;

    /// Hashes from `start_height` up to and including `end_hash`
    fn height_to_hash_range(
        &self,
        start_height: i32,
        end_hash: &Hash,
        max_results: usize,
    ) -> Result<Vec<Hash>, ChainError>;

    /// Hashes at every `interval` heights up to `end_hash`, starting at
    /// height `interval`
    fn interval_block_hashes(&self, end_hash: &Hash, interval: u32)
        -> Result<Vec<Hash>, ChainError>;

    fn filters_by_block_hashes(
        &self,
        hashes: &[Hash],
        filter_type: FilterType,
    ) -> Result<Vec<Option<Vec<u8>>>, ChainError>;

    fn filter_hashes_by_block_hashes(
        &self,
        hashes: &[Hash],
        filter_type: FilterType,
    ) -> Result<Vec<Option<Hash>>, ChainError>;

    fn filter_header_by_block_hash(
        &self,
        hash: &Hash,
        filter_type: FilterType,
    ) -> Result<Option<Hash>, ChainError>;

    fn filter_headers_by_block_hashes(
        &self,
        hashes: &[Hash],
        filter_type: FilterType,
    ) -> Result<Vec<Option<Hash>>, ChainError>;
}

// =============================================================================
// Transaction pool
// =============================================================================

pub trait TxPool: Send + Sync {
    fn fetch_transaction(&self, hash: &Hash) -> Result<Transaction, MempoolError>;

    /// Descriptors of every transaction in the pool
    fn tx_descs(&self) -> Vec<TxDesc>;

    /// Evict orphans received from the given peer, returning how many
    fn remove_orphans_by_tag(&self, tag: u64) -> usize;
}

// =============================================================================
// Address manager
// =============================================================================

pub trait AddressManager: Send + Sync {
    /// Sample of known addresses to answer getaddr with
    fn address_cache(&self) -> Vec<NetAddress>;

    fn add_addresses(&self, addrs: Vec<NetAddress>, source: &NetAddress);

    /// Local address to advertise to `remote`, if any
    fn best_local_address(&self, remote: &NetAddress) -> Option<NetAddress>;

    fn need_more_addresses(&self) -> bool;

    /// Candidate for a new outbound connection
    fn get_address(&self) -> Option<NetAddress>;

    fn attempt(&self, addr: &NetAddress);

    fn good(&self, addr: &NetAddress);

    fn connected(&self, addr: &NetAddress);

    /// A connection reported through `connected` has closed
    fn disconnected(&self, addr: &NetAddress);

    fn set_services(&self, addr: &NetAddress, services: ServiceFlags);
}

// =============================================================================
// Connection manager
// =============================================================================

/// An outbound connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnReq {
    pub id: u64,
    pub addr: SocketAddr,
    /// Reconnect whenever the connection drops
    pub permanent: bool,
}

pub trait ConnManager: Send + Sync {
    /// Dial `addr`, retrying forever when `permanent`
    fn connect(&self, addr: SocketAddr, permanent: bool);

    /// A permanent connection dropped; schedule a reconnect
    fn disconnect(&self, id: u64);

    /// Forget a connection request
    fn remove(&self, id: u64);

    /// Replace a dropped outbound connection with a new one
    fn new_conn_req(&self);
}

// =============================================================================
// Sync manager
// =============================================================================

pub trait SyncManager: Send + Sync {
    fn new_peer(&self, peer: &PeerInfo);

    fn done_peer(&self, peer_id: u64);

    /// Queue a transaction for validation; `done` fires once handled
    fn queue_tx(&self, tx: Transaction, peer_id: u64, done: oneshot::Sender<()>);

    /// Queue a block for validation; `done` fires once handled
    fn queue_block(&self, block: Block, peer_id: u64, done: oneshot::Sender<()>);

    fn queue_inv(&self, inv: Vec<InvVect>, peer_id: u64);

    fn queue_headers(&self, headers: Vec<BlockHeader>, peer_id: u64);

    fn queue_not_found(&self, inv: Vec<InvVect>, peer_id: u64);

    /// Whether the chain is believed to be caught up
    fn is_current(&self) -> bool;
}

// =============================================================================
// Backend bundle
// =============================================================================

/// All collaborators of a node
#[derive(Clone)]
pub struct Backend {
    pub chain: Arc<dyn ChainProvider>,
    pub tx_pool: Arc<dyn TxPool>,
    pub addr_manager: Arc<dyn AddressManager>,
    pub conn_manager: Arc<dyn ConnManager>,
    pub sync_manager: Arc<dyn SyncManager>,
}
