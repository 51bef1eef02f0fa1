//! Peer connections
//!
//! A [`ServerPeer`] is one connected remote node. The connection driver in
//! `conn` owns the socket; the protocol callbacks in `handlers` react to what
//! the peer sends. Everything the orchestrator needs to read about a peer is
//! kept behind atomics or short-lived locks so relay decisions never wait on
//! the peer's own task.

mod conn;
mod handlers;

pub(crate) use conn::run_peer;

use crate::backend::ConnReq;
use crate::core::{BloomFilter, Transaction};
use crate::crypto::Hash;
use crate::network::banscore::BanScore;
use crate::network::message::{InvVect, Message, NetAddress, NetHost, ServiceFlags};
use crate::network::message::{ADDRV2_VERSION, MAX_ADDR_PER_MSG};
use crate::network::node::{NodeEvent, Shared};
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Inventory remembered per peer to avoid re-announcing it
pub const MAX_KNOWN_INVENTORY: usize = 1000;

/// Addresses remembered per peer to avoid re-sending them
pub const MAX_KNOWN_ADDRESSES: usize = 10_000;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Protocol negotiation timed out")]
    NegotiationTimeout,
    #[error("Protocol version {0} is too old")]
    ProtocolVersionTooOld(u32),
    #[error("Connected to self")]
    SelfConnection,
    #[error("Unexpected {0} message")]
    UnexpectedMessage(&'static str),
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Work queued for a peer's writer
#[derive(Debug)]
pub(crate) enum Outgoing {
    /// Send now; `done` fires once written
    Message(Message, Option<oneshot::Sender<()>>),
    /// Batch into the next trickled inv
    Inventory(InvVect),
}

/// Snapshot of a peer for administrative callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: u64,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub persistent: bool,
    pub services: ServiceFlags,
    pub protocol_version: u32,
    pub user_agent: String,
    pub start_height: i32,
    pub last_block: i32,
    pub ban_score: u32,
    pub fee_filter: i64,
    pub relay_tx_disabled: bool,
    pub prefers_headers: bool,
    pub connected_at: DateTime<Utc>,
}

/// State negotiated during the handshake and updated as the peer talks
#[derive(Debug, Default)]
struct PeerStats {
    version_known: bool,
    protocol_version: u32,
    services: ServiceFlags,
    user_agent: String,
    start_height: i32,
    last_block: i32,
    last_announced_block: Option<Hash>,
    prefers_headers: bool,
    wants_addrv2: bool,
}

fn lru_cache<K: std::hash::Hash + Eq, V>(cap: usize) -> LruCache<K, V> {
    LruCache::new(NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN))
}

/// A connected remote node
pub struct ServerPeer {
    id: u64,
    addr: SocketAddr,
    na: NetAddress,
    inbound: bool,
    persistent: bool,
    conn_req: Option<ConnReq>,
    whitelisted: bool,
    connected_at: DateTime<Utc>,

    pub(crate) shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    quit: CancellationToken,

    stats: Mutex<PeerStats>,
    relay_tx_disabled: AtomicBool,
    fee_filter: AtomicI64,
    filter: Mutex<Option<BloomFilter>>,
    known_inventory: Mutex<LruCache<InvVect, ()>>,
    known_addresses: Mutex<LruCache<String, ()>>,
    continue_hash: Mutex<Option<Hash>>,

    ban_score: BanScore,
    banned: AtomicBool,
    sent_addrs: AtomicBool,
    verack_received: AtomicBool,
}

impl ServerPeer {
    pub(crate) fn new(
        shared: Arc<Shared>,
        addr: SocketAddr,
        inbound: bool,
        conn_req: Option<ConnReq>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let na = NetAddress::from_socket_addr(addr, ServiceFlags::empty());
        let whitelisted = shared.config.is_whitelisted(&na.host);
        let peer = Arc::new(Self {
            id: shared.next_peer_id(),
            addr,
            na,
            inbound,
            persistent: conn_req.map_or(false, |req| req.permanent),
            conn_req,
            whitelisted,
            connected_at: Utc::now(),
            quit: shared.quit.child_token(),
            shared,
            outgoing: tx,
            stats: Mutex::new(PeerStats::default()),
            relay_tx_disabled: AtomicBool::new(false),
            fee_filter: AtomicI64::new(0),
            filter: Mutex::new(None),
            known_inventory: Mutex::new(lru_cache(MAX_KNOWN_INVENTORY)),
            known_addresses: Mutex::new(lru_cache(MAX_KNOWN_ADDRESSES)),
            continue_hash: Mutex::new(None),
            ban_score: BanScore::new(),
            banned: AtomicBool::new(false),
            sent_addrs: AtomicBool::new(false),
            verack_received: AtomicBool::new(false),
        });
        (peer, rx)
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Remote address with the services it advertised
    pub fn na(&self) -> NetAddress {
        NetAddress {
            services: self.services(),
            ..self.na
        }
    }

    /// Host used as the ban list key
    pub fn host(&self) -> String {
        self.na.host.to_string()
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn conn_req(&self) -> Option<ConnReq> {
        self.conn_req
    }

    pub fn is_whitelisted(&self) -> bool {
        self.whitelisted
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_connected(&self) -> bool {
        !self.quit.is_cancelled()
    }

    /// Ask the connection to close; idempotent
    pub fn disconnect(&self) {
        if !self.quit.is_cancelled() {
            log::debug!("Disconnecting {}", self);
            self.quit.cancel();
        }
    }

    pub(crate) fn quit_token(&self) -> &CancellationToken {
        &self.quit
    }

    pub fn verack_received(&self) -> bool {
        self.verack_received.load(Ordering::SeqCst)
    }

    pub(crate) fn set_verack_received(&self) {
        self.verack_received.store(true, Ordering::SeqCst);
    }

    // =========================================================================
    // Negotiated state
    // =========================================================================

    pub fn version_known(&self) -> bool {
        self.stats.lock().version_known
    }

    pub fn protocol_version(&self) -> u32 {
        self.stats.lock().protocol_version
    }

    pub fn services(&self) -> ServiceFlags {
        self.stats.lock().services
    }

    pub fn user_agent(&self) -> String {
        self.stats.lock().user_agent.clone()
    }

    pub fn is_witness_enabled(&self) -> bool {
        self.services().contains(ServiceFlags::WITNESS)
    }

    pub(crate) fn set_negotiated(
        &self,
        protocol_version: u32,
        services: ServiceFlags,
        user_agent: String,
        start_height: i32,
    ) {
        let mut stats = self.stats.lock();
        stats.version_known = true;
        stats.protocol_version = protocol_version;
        stats.services = services;
        stats.user_agent = user_agent;
        stats.start_height = start_height;
        stats.last_block = start_height;
    }

    pub fn last_block(&self) -> i32 {
        self.stats.lock().last_block
    }

    pub fn update_last_block_height(&self, height: i32) {
        self.stats.lock().last_block = height;
    }

    pub fn last_announced_block(&self) -> Option<Hash> {
        self.stats.lock().last_announced_block
    }

    pub fn update_last_announced_block(&self, hash: Option<Hash>) {
        self.stats.lock().last_announced_block = hash;
    }

    pub fn prefers_headers(&self) -> bool {
        self.stats.lock().prefers_headers
    }

    pub(crate) fn set_prefers_headers(&self) {
        self.stats.lock().prefers_headers = true;
    }

    pub fn wants_addrv2(&self) -> bool {
        self.stats.lock().wants_addrv2
    }

    pub(crate) fn set_wants_addrv2(&self) {
        let mut stats = self.stats.lock();
        if stats.protocol_version >= ADDRV2_VERSION {
            stats.wants_addrv2 = true;
        }
    }

    pub fn relay_tx_disabled(&self) -> bool {
        self.relay_tx_disabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_relay_tx_disabled(&self, disabled: bool) {
        self.relay_tx_disabled.store(disabled, Ordering::SeqCst);
    }

    /// Minimum fee rate, in satoshis per kB, the peer wants relayed
    pub fn fee_filter(&self) -> i64 {
        self.fee_filter.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fee_filter(&self, fee: i64) {
        self.fee_filter.store(fee, Ordering::SeqCst);
    }

    pub(crate) fn filter(&self) -> &Mutex<Option<BloomFilter>> {
        &self.filter
    }

    pub fn is_filter_loaded(&self) -> bool {
        self.filter.lock().is_some()
    }

    /// Match `tx` against the loaded filter, updating it; `None` when no
    /// filter is loaded. The lock covers this one transaction only.
    pub(crate) fn filter_matches(&self, tx: &Transaction) -> Option<bool> {
        self.filter
            .lock()
            .as_mut()
            .map(|filter| filter.matches_tx_and_update(tx))
    }

    pub(crate) fn take_continue_hash_if(&self, hash: &Hash) -> bool {
        let mut continue_hash = self.continue_hash.lock();
        if continue_hash.as_ref() == Some(hash) {
            *continue_hash = None;
            return true;
        }
        false
    }

    pub(crate) fn continue_hash(&self) -> Option<Hash> {
        *self.continue_hash.lock()
    }

    pub(crate) fn set_continue_hash(&self, hash: Option<Hash>) {
        *self.continue_hash.lock() = hash;
    }

    /// Returns true the first time it is called for this connection
    pub(crate) fn mark_sent_addrs(&self) -> bool {
        !self.sent_addrs.swap(true, Ordering::SeqCst)
    }

    pub fn sent_addrs(&self) -> bool {
        self.sent_addrs.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Outbound queue
    // =========================================================================

    /// Queue a message; `done` fires once it is written or dropped with the
    /// connection
    pub fn queue_message(&self, msg: Message, done: Option<oneshot::Sender<()>>) {
        if self.outgoing.send(Outgoing::Message(msg, done)).is_err() {
            log::trace!("Dropping message for disconnected peer {}", self);
        }
    }

    /// Queue an inventory announcement unless the peer already knows it
    pub fn queue_inventory(&self, inv: InvVect) {
        if self.has_known_inventory(&inv) {
            return;
        }
        if self.outgoing.send(Outgoing::Inventory(inv)).is_err() {
            log::trace!("Dropping inventory for disconnected peer {}", self);
        }
    }

    pub fn add_known_inventory(&self, inv: InvVect) {
        self.known_inventory.lock().put(inv, ());
    }

    pub fn has_known_inventory(&self, inv: &InvVect) -> bool {
        self.known_inventory.lock().contains(inv)
    }

    fn address_known(&self, addr: &NetAddress) -> bool {
        self.known_addresses.lock().contains(&addr.key())
    }

    pub(crate) fn add_known_addresses(&self, addrs: &[NetAddress]) {
        let mut known = self.known_addresses.lock();
        for addr in addrs {
            known.put(addr.key(), ());
        }
    }

    /// Send addresses the peer does not know yet, returning how many
    ///
    /// Peers that did not opt into addrv2 cannot receive onion addresses.
    pub fn push_addr_msg(&self, addresses: &[NetAddress]) -> usize {
        let wants_addrv2 = self.wants_addrv2();
        let mut addrs: Vec<NetAddress> = addresses
            .iter()
            .filter(|addr| wants_addrv2 || !matches!(addr.host, NetHost::TorV3(_)))
            .filter(|addr| !self.address_known(addr))
            .copied()
            .collect();
        if addrs.is_empty() {
            return 0;
        }
        if addrs.len() > MAX_ADDR_PER_MSG {
            addrs.shuffle(&mut rand::thread_rng());
            addrs.truncate(MAX_ADDR_PER_MSG);
        }

        self.add_known_addresses(&addrs);
        let count = addrs.len();
        let msg = if wants_addrv2 {
            Message::AddrV2(addrs)
        } else {
            Message::Addr(addrs)
        };
        self.queue_message(msg, None);
        count
    }

    // =========================================================================
    // Misbehaviour
    // =========================================================================

    pub fn ban_score(&self) -> u32 {
        self.ban_score.score()
    }

    /// Increase the ban score, banning and disconnecting the peer once it
    /// crosses the configured threshold
    ///
    /// Returns true if this call banned the peer.
    pub fn add_ban_score(&self, persistent: u32, transient: u32, reason: &str) -> bool {
        let config = &self.shared.config;
        if config.disable_banning {
            return false;
        }
        if self.whitelisted {
            log::debug!("Misbehaving whitelisted peer {}: {}", self, reason);
            return false;
        }

        let warn_threshold = config.ban_threshold >> 1;
        if persistent == 0 && transient == 0 {
            let score = self.ban_score.score();
            if score > warn_threshold {
                log::warn!(
                    "Misbehaving peer {}: {} -- ban score is {}, it was not increased this time",
                    self,
                    reason,
                    score
                );
            }
            return false;
        }

        let score = self.ban_score.increase(persistent, transient);
        if score > warn_threshold {
            log::warn!(
                "Misbehaving peer {}: {} -- ban score increased to {}",
                self,
                reason,
                score
            );
            if score > config.ban_threshold && !self.banned.swap(true, Ordering::SeqCst) {
                log::warn!("Misbehaving peer {} -- banning and disconnecting", self);
                self.shared.send_event(NodeEvent::BanPeer(self.host()));
                self.disconnect();
                return true;
            }
        }
        false
    }

    /// Check that this node serves bloom filters, disconnecting the peer if
    /// it asks for them anyway
    pub(crate) fn enforce_node_bloom_flag(&self, command: &str) -> bool {
        if self.shared.services.contains(ServiceFlags::BLOOM) {
            return true;
        }

        if self.protocol_version() >= crate::network::message::BIP0111_VERSION
            && !self.shared.config.disable_banning
        {
            self.add_ban_score(100, 0, command);
            self.disconnect();
            return false;
        }

        log::debug!(
            "{} sent an unsupported {} request -- disconnecting",
            self,
            command
        );
        self.disconnect();
        false
    }

    pub fn info(&self) -> PeerInfo {
        let stats = self.stats.lock();
        PeerInfo {
            id: self.id,
            addr: self.addr,
            inbound: self.inbound,
            persistent: self.persistent,
            services: stats.services,
            protocol_version: stats.protocol_version,
            user_agent: stats.user_agent.clone(),
            start_height: stats.start_height,
            last_block: stats.last_block,
            ban_score: self.ban_score.score(),
            fee_filter: self.fee_filter(),
            relay_tx_disabled: self.relay_tx_disabled(),
            prefers_headers: stats.prefers_headers,
            connected_at: self.connected_at,
        }
    }
}

impl fmt::Display for ServerPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.inbound { "inbound" } else { "outbound" };
        write!(f, "{} ({})", self.addr, direction)
    }
}

impl fmt::Debug for ServerPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPeer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("inbound", &self.inbound)
            .field("persistent", &self.persistent)
            .finish()
    }
}
