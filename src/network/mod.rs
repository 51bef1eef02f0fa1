//! P2P Networking module
//!
//! Peer orchestration for a full node: the version handshake, per-peer
//! message handling, misbehaviour scoring and banning, inventory relay and
//! the administrative queries answered by the orchestrator.
//!
//! # Features
//! - TCP listener and outbound connection manager
//! - Trickled inventory relay with fee and bloom filtering
//! - Decaying ban scores
//! - Compact filter checkpoint cache that follows reorganisations
//! - Transaction rebroadcast until confirmation
//! - Scheduled shutdown

pub mod addrman;
pub mod banscore;
pub mod cfcheckpt;
pub mod config;
pub mod connmgr;
pub mod message;
pub mod node;
pub mod peer;
pub mod server;

pub use banscore::BanScore;
pub use cfcheckpt::CheckpointCache;
pub use config::{ConfigError, Network, NodeConfig};
pub use connmgr::TcpConnManager;
pub use message::{
    FilterType, InvType, InvVect, Message, NetAddress, RejectCode, RejectMessage, ServiceFlags,
    VersionMessage, MAX_MESSAGE_SIZE, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use node::{Node, NodeError, RelayData};
pub use peer::{PeerError, PeerInfo, ServerPeer};
pub use server::{MessageCodec, Server};
