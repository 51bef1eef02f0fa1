//! Network message types for P2P communication
//!
//! Defines the message set exchanged with peers, the inventory and address
//! types they carry, and the protocol limits enforced by the handlers.

use crate::core::{Block, BlockHeader, BloomUpdate, MerkleBlock, Transaction};
use crate::crypto::Hash;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// =============================================================================
// Protocol versions
// =============================================================================

/// Protocol version spoken by this node
pub const PROTOCOL_VERSION: u32 = 70016;

/// Oldest protocol version a peer may negotiate
pub const MIN_PROTOCOL_VERSION: u32 = 209;

/// Version from which addresses carry a timestamp
pub const NET_ADDRESS_TIME_VERSION: u32 = 31402;

/// Version that introduced bloom filtering (BIP 37)
pub const BIP0037_VERSION: u32 = 70001;

/// Version that introduced the NODE_BLOOM service bit (BIP 111)
pub const BIP0111_VERSION: u32 = 70011;

/// Version that introduced `sendheaders`
pub const SEND_HEADERS_VERSION: u32 = 70012;

/// Version that introduced `sendaddrv2`
pub const ADDRV2_VERSION: u32 = 70016;

// =============================================================================
// Protocol limits
// =============================================================================

/// Maximum inventory vectors per `inv`/`getdata`/`notfound`
pub const MAX_INV_PER_MSG: usize = 50_000;

/// Maximum block hashes returned for one `getblocks`
pub const MAX_BLOCKS_PER_MSG: usize = 500;

/// Maximum headers returned for one `getheaders`
pub const MAX_BLOCK_HEADERS_PER_MSG: usize = 2_000;

/// Maximum locator hashes in `getblocks`/`getheaders`
pub const MAX_BLOCK_LOCATORS_PER_MSG: usize = 500;

/// Maximum addresses per `addr`/`addrv2`
pub const MAX_ADDR_PER_MSG: usize = 1_000;

/// Maximum filters returned for one `getcfilters`
pub const MAX_GETCFILTERS_REQ_RANGE: usize = 1_000;

/// Maximum filter hashes returned for one `getcfheaders`
pub const MAX_CFHEADERS_PER_MSG: usize = 2_000;

/// Height spacing of `cfcheckpt` entries
pub const CF_CHECKPT_INTERVAL: u32 = 1_000;

/// Maximum payload size of any single message
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

// =============================================================================
// Service flags
// =============================================================================

bitflags! {
    /// Services advertised in `version` and address messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        /// Full node serving the complete chain
        const NETWORK = 1 << 0;
        const GETUTXO = 1 << 1;
        /// Supports bloom filtering (BIP 37/111)
        const BLOOM = 1 << 2;
        /// Supports segregated witness
        const WITNESS = 1 << 3;
        /// Serves committed compact filters (BIP 157)
        const CF = 1 << 6;
        const NETWORK_LIMITED = 1 << 10;
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// Type of an announceable object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    WitnessTx,
    WitnessBlock,
    FilteredWitnessBlock,
}

/// Inventory vector: a (type, hash) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    pub inv_type: InvType,
    pub hash: Hash,
}

impl InvVect {
    pub fn new(inv_type: InvType, hash: Hash) -> Self {
        Self { inv_type, hash }
    }

    pub fn tx(hash: Hash) -> Self {
        Self::new(InvType::Tx, hash)
    }

    pub fn block(hash: Hash) -> Self {
        Self::new(InvType::Block, hash)
    }
}

impl fmt::Display for InvVect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.inv_type, self.hash)
    }
}

// =============================================================================
// Network addresses
// =============================================================================

/// Host part of a peer address (BIP 155 subset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetHost {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    TorV3([u8; 32]),
}

impl fmt::Display for NetHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetHost::Ipv4(ip) => write!(f, "{}", ip),
            NetHost::Ipv6(ip) => write!(f, "[{}]", ip),
            NetHost::TorV3(key) => write!(f, "{}.onion", hex::encode(&key[..10])),
        }
    }
}

/// A peer address as relayed in `addr`/`addrv2` and `version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    /// Last time the address was seen
    pub timestamp: DateTime<Utc>,
    pub services: ServiceFlags,
    pub host: NetHost,
    pub port: u16,
}

impl NetAddress {
    pub fn new(host: NetHost, port: u16, services: ServiceFlags) -> Self {
        Self {
            timestamp: Utc::now(),
            services,
            host,
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: ServiceFlags) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => NetHost::Ipv4(ip),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => NetHost::Ipv4(v4),
                None => NetHost::Ipv6(ip),
            },
        };
        Self::new(host, addr.port(), services)
    }

    /// The IP address, if this is not an overlay network address
    pub fn ip(&self) -> Option<IpAddr> {
        match self.host {
            NetHost::Ipv4(ip) => Some(IpAddr::V4(ip)),
            NetHost::Ipv6(ip) => Some(IpAddr::V6(ip)),
            NetHost::TorV3(_) => None,
        }
    }

    /// Key identifying the address independent of timestamp and services
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// =============================================================================
// Compact filters
// =============================================================================

/// Committed filter type (BIP 158)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterType(pub u8);

impl FilterType {
    /// The basic filter, the only type served
    pub const REGULAR: FilterType = FilterType(0);
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Message payloads
// =============================================================================

/// Capability and identity announcement sent first on every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMessage {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    pub timestamp: DateTime<Utc>,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    /// Random value used to detect connections to self
    pub nonce: u64,
    pub user_agent: String,
    /// Best height of the sender
    pub start_height: i32,
    /// Peer asks not to be sent transactions until it loads a filter
    pub disable_relay_tx: bool,
}

/// Block locator request used by `getblocks` and `getheaders`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorMessage {
    pub protocol_version: u32,
    pub locator_hashes: Vec<Hash>,
    pub hash_stop: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterLoadMessage {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: BloomUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCFiltersMessage {
    pub filter_type: FilterType,
    pub start_height: u32,
    pub stop_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CFilterMessage {
    pub filter_type: FilterType,
    pub block_hash: Hash,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CFHeadersMessage {
    pub filter_type: FilterType,
    pub stop_hash: Hash,
    pub prev_filter_header: Hash,
    pub filter_hashes: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCFCheckptMessage {
    pub filter_type: FilterType,
    pub stop_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CFCheckptMessage {
    pub filter_type: FilterType,
    pub stop_hash: Hash,
    pub filter_headers: Vec<Hash>,
}

/// Rejection codes carried by `reject`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    NonStandard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectMessage {
    pub command: String,
    pub code: RejectCode,
    pub reason: String,
}

// =============================================================================
// Message
// =============================================================================

/// Network message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Version(VersionMessage),
    VerAck,
    SendAddrV2,
    SendHeaders,
    Ping(u64),
    Pong(u64),
    Reject(RejectMessage),

    Inv(Vec<InvVect>),
    GetData(Vec<InvVect>),
    NotFound(Vec<InvVect>),
    Tx(Transaction),
    Block(Block),
    MerkleBlock(MerkleBlock),
    Headers(Vec<BlockHeader>),
    GetHeaders(LocatorMessage),
    GetBlocks(LocatorMessage),
    MemPool,

    Addr(Vec<NetAddress>),
    AddrV2(Vec<NetAddress>),
    GetAddr,

    FilterLoad(FilterLoadMessage),
    FilterAdd(Vec<u8>),
    FilterClear,
    FeeFilter(i64),

    GetCFilters(GetCFiltersMessage),
    CFilter(CFilterMessage),
    GetCFHeaders(GetCFiltersMessage),
    CFHeaders(CFHeadersMessage),
    GetCFCheckpt(GetCFCheckptMessage),
    CFCheckpt(CFCheckptMessage),
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Wire command name, used for logging and rejects
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::SendAddrV2 => "sendaddrv2",
            Message::SendHeaders => "sendheaders",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Reject(_) => "reject",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::Tx(_) => "tx",
            Message::Block(_) => "block",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Headers(_) => "headers",
            Message::GetHeaders(_) => "getheaders",
            Message::GetBlocks(_) => "getblocks",
            Message::MemPool => "mempool",
            Message::Addr(_) => "addr",
            Message::AddrV2(_) => "addrv2",
            Message::GetAddr => "getaddr",
            Message::FilterLoad(_) => "filterload",
            Message::FilterAdd(_) => "filteradd",
            Message::FilterClear => "filterclear",
            Message::FeeFilter(_) => "feefilter",
            Message::GetCFilters(_) => "getcfilters",
            Message::CFilter(_) => "cfilter",
            Message::GetCFHeaders(_) => "getcfheaders",
            Message::CFHeaders(_) => "cfheaders",
            Message::GetCFCheckpt(_) => "getcfcheckpt",
            Message::CFCheckpt(_) => "cfcheckpt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::Ping(12345);
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_mapped_ipv6_becomes_ipv4() {
        let addr: SocketAddr = "[::ffff:1.2.3.4]:8333".parse().unwrap();
        let na = NetAddress::from_socket_addr(addr, ServiceFlags::NETWORK);
        assert_eq!(na.host, NetHost::Ipv4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(na.key(), "1.2.3.4:8333");
    }

    #[test]
    fn test_unknown_filter_type_survives_decoding() {
        let msg = Message::GetCFCheckpt(GetCFCheckptMessage {
            filter_type: FilterType(7),
            stop_hash: Hash::ZERO,
        });
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}
