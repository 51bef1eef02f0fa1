//! p2p-node: the peer-to-peer networking core of a cryptocurrency full node
//!
//! This crate provides:
//! - Version handshake and per-peer message handling over TCP
//! - A single-task orchestrator owning the registry of connected peers
//! - Decaying misbehaviour scores with host bans
//! - Inventory relay with fee filters, bloom filters and header announcements
//! - Compact filter serving with a reorg-aware checkpoint cache
//! - Transaction rebroadcast and scheduled shutdown
//!
//! Chain state, the transaction pool, the address book, connection
//! management and block sync are collaborators behind the traits in
//! [`backend`]; in-memory versions are included.
//!
//! # Example
//!
//! ```rust,no_run
//! use p2p_node::backend::{Backend, LocalSync, MemAddrManager, MemChain, MemPool};
//! use p2p_node::network::{Node, NodeConfig, TcpConnManager};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() {
//! let chain = Arc::new(MemChain::with_height(0));
//! let pool = Arc::new(MemPool::new());
//! let addrs = Arc::new(MemAddrManager::new());
//! let (sync, _accepted) = LocalSync::new(chain.clone(), pool.clone());
//! let (conn, _connected) = TcpConnManager::new(addrs.clone(), 8, CancellationToken::new());
//!
//! let node = Node::new(
//!     NodeConfig::default(),
//!     Backend {
//!         chain,
//!         tx_pool: pool,
//!         addr_manager: addrs,
//!         conn_manager: Arc::new(conn),
//!         sync_manager: Arc::new(sync),
//!     },
//! );
//! node.start().unwrap();
//! println!("{} peers", node.connected_count().await.unwrap());
//! # }
//! ```

pub mod backend;
pub mod core;
pub mod crypto;
pub mod network;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types
pub use backend::Backend;
pub use core::{Block, BlockHeader, BloomFilter, Transaction, TxDesc};
pub use crypto::Hash;
pub use network::{Node, NodeConfig, NodeError};
