//! Peer orchestrator
//!
//! The [`Node`] owns the registry of connected peers. Every change to it,
//! and every question about it, is an event handled one at a time by a single
//! task, so the registry itself needs no lock. Peers, the rebroadcast timer
//! and administrative callers only ever talk to it through [`NodeEvent`]s.

mod handler;
mod rebroadcast;
mod state;


pub use rebroadcast::dynamic_tick_duration;

use crate::backend::{Backend, ConnReq};
use crate::core::{BlockHeader, TxDesc};
use crate::crypto::Hash;
use crate::network::cfcheckpt::CheckpointCache;
use crate::network::config::NodeConfig;
use crate::network::message::{InvVect, Message, NetAddress, ServiceFlags};
use crate::network::peer::{run_peer, PeerInfo, ServerPeer};
use lru::LruCache;
use parking_lot::Mutex;
use rebroadcast::RebroadcastMsg;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Version nonces remembered to detect connections to ourselves
const MAX_SENT_NONCES: usize = 50;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned to administrative callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("max peers reached")]
    MaxPeers,
    #[error("peer already connected")]
    PeerAlreadyConnected,
    #[error("peer exists as a permanent peer")]
    PeerIsPermanent,
    #[error("peer not found")]
    PeerNotFound,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("node already started")]
    AlreadyStarted,
    #[error("node is shutting down")]
    ShuttingDown,
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(e.to_string())
    }
}

// =============================================================================
// Events
// =============================================================================

/// Payload used to decide per peer whether an inventory is worth relaying
#[derive(Debug, Clone)]
pub enum RelayData {
    Tx(TxDesc),
    Header(BlockHeader),
}

#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub inv: InvVect,
    pub data: RelayData,
}

#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub message: Message,
    /// Peer ids that must not receive the message
    pub exclude: Vec<u64>,
}

/// A newly accepted block; peers that announced it are now at its height
#[derive(Debug, Clone, Copy)]
pub struct UpdatePeerHeights {
    pub new_hash: Hash,
    pub new_height: i32,
    pub origin: Option<u64>,
}

pub type PeerPredicate = Box<dyn Fn(&ServerPeer) -> bool + Send>;

/// Registry queries, each answered on its own channel
pub(crate) enum Query {
    ConnectedCount(oneshot::Sender<usize>),
    OutboundGroupCount {
        key: String,
        reply: oneshot::Sender<usize>,
    },
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    PersistentPeers(oneshot::Sender<Vec<PeerInfo>>),
    ConnectNode {
        addr: String,
        permanent: bool,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    RemoveNode {
        cmp: PeerPredicate,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    DisconnectNode {
        cmp: PeerPredicate,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
}

/// Everything the orchestrator reacts to
pub(crate) enum NodeEvent {
    NewPeer(Arc<ServerPeer>),
    DonePeer(Arc<ServerPeer>),
    /// Host to ban
    BanPeer(String),
    RelayInventory(RelayMessage),
    Broadcast(BroadcastMessage),
    PeerHeightUpdate(UpdatePeerHeights),
    Query(Query),
}

// =============================================================================
// Shared state
// =============================================================================

struct Receivers {
    events: mpsc::UnboundedReceiver<NodeEvent>,
    rebroadcast: mpsc::UnboundedReceiver<RebroadcastMsg>,
}

/// State shared between the orchestrator, its peers and its handle
pub(crate) struct Shared {
    pub(crate) config: NodeConfig,
    pub(crate) backend: Backend,
    /// Services advertised to peers
    pub(crate) services: ServiceFlags,
    pub(crate) cf_checkpoints: CheckpointCache,
    /// Fires when the node stops
    pub(crate) quit: CancellationToken,
    /// Fires once the orchestrator has finished
    done: CancellationToken,
    events: mpsc::UnboundedSender<NodeEvent>,
    rebroadcast: mpsc::UnboundedSender<RebroadcastMsg>,
    receivers: Mutex<Option<Receivers>>,
    shutdown: AtomicBool,
    shutdown_sched: AtomicBool,
    next_peer_id: AtomicU64,
    sent_nonces: Mutex<LruCache<u64, ()>>,
}

impl Shared {
    pub(crate) fn send_event(&self, event: NodeEvent) {
        if self.events.send(event).is_err() {
            log::trace!("Orchestrator stopped, dropping event");
        }
    }

    pub(crate) fn next_peer_id(&self) -> u64 {
        self.next_peer_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Nonce for an outgoing version message
    pub(crate) fn new_nonce(&self) -> u64 {
        let nonce = rand::random();
        self.sent_nonces.lock().put(nonce, ());
        nonce
    }

    pub(crate) fn is_own_nonce(&self, nonce: u64) -> bool {
        self.sent_nonces.lock().contains(&nonce)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<NodeEvent>> {
        self.receivers.lock().take().map(|receivers| receivers.events)
    }
}

// =============================================================================
// Node
// =============================================================================

/// Handle to a peer-to-peer node; cheap to clone
#[derive(Clone)]
pub struct Node {
    pub(crate) shared: Arc<Shared>,
}

impl Node {
    pub fn new(config: NodeConfig, backend: Backend) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (rebroadcast_tx, rebroadcast_rx) = mpsc::unbounded_channel();
        let services = config.services();

        let shared = Shared {
            config,
            backend,
            services,
            cf_checkpoints: CheckpointCache::new(),
            quit: CancellationToken::new(),
            done: CancellationToken::new(),
            events: events_tx,
            rebroadcast: rebroadcast_tx,
            receivers: Mutex::new(Some(Receivers {
                events: events_rx,
                rebroadcast: rebroadcast_rx,
            })),
            shutdown: AtomicBool::new(false),
            shutdown_sched: AtomicBool::new(false),
            next_peer_id: AtomicU64::new(1),
            sent_nonces: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_SENT_NONCES).unwrap_or(NonZeroUsize::MIN),
            )),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    pub fn services(&self) -> ServiceFlags {
        self.shared.services
    }

    /// Token cancelled when the node begins shutting down
    pub fn quit_token(&self) -> CancellationToken {
        self.shared.quit.clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the orchestrator and the rebroadcast timer
    pub fn start(&self) -> Result<(), NodeError> {
        let receivers = self
            .shared
            .receivers
            .lock()
            .take()
            .ok_or(NodeError::AlreadyStarted)?;

        log::trace!("Starting server");
        tokio::spawn(handler::peer_handler(self.shared.clone(), receivers.events));
        tokio::spawn(rebroadcast::rebroadcast_handler(
            self.shared.clone(),
            receivers.rebroadcast,
        ));
        Ok(())
    }

    /// Begin shutting down; only the first call has any effect
    pub fn stop(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            log::info!("Server is already in the process of shutting down");
            return;
        }
        log::warn!("Server shutting down");
        self.shared.quit.cancel();
    }

    /// Resolve once the orchestrator has disconnected every peer
    pub async fn wait_for_shutdown(&self) {
        self.shared.done.cancelled().await;
    }

    /// Stop after `duration`, warning with shrinking intervals until then
    pub fn schedule_shutdown(&self, duration: Duration) {
        if self.shared.shutdown_sched.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("Server shutdown in {:?}", duration);
        tokio::spawn(rebroadcast::shutdown_countdown(self.clone(), duration));
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Take over a connection accepted by a listener
    pub fn inbound_peer_connected<S>(&self, stream: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (peer, outgoing) = ServerPeer::new(self.shared.clone(), remote, true, None);
        tokio::spawn(run_peer(peer, outgoing, stream));
    }

    /// Take over a connection dialed for `req`
    pub fn outbound_peer_connected<S>(&self, req: ConnReq, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (peer, outgoing) = ServerPeer::new(self.shared.clone(), req.addr, false, Some(req));
        self.shared
            .backend
            .addr_manager
            .attempt(&NetAddress::from_socket_addr(req.addr, ServiceFlags::empty()));
        tokio::spawn(run_peer(peer, outgoing, stream));
    }

    // =========================================================================
    // Relay
    // =========================================================================

    /// Announce inventory to every peer that wants it
    pub fn relay_inventory(&self, inv: InvVect, data: RelayData) {
        self.shared
            .send_event(NodeEvent::RelayInventory(RelayMessage { inv, data }));
    }

    /// Send a message to every peer except `exclude`
    pub fn broadcast_message(&self, message: Message, exclude: &[u64]) {
        self.shared.send_event(NodeEvent::Broadcast(BroadcastMessage {
            message,
            exclude: exclude.to_vec(),
        }));
    }

    /// Keep re-announcing `inv` until it is removed
    pub fn add_rebroadcast_inventory(&self, inv: InvVect, data: RelayData) {
        if self.shared.is_shutting_down() {
            return;
        }
        if self.shared.rebroadcast.send(RebroadcastMsg::Add(inv, data)).is_err() {
            log::trace!("Rebroadcast handler stopped, not tracking {:?}", inv);
        }
    }

    pub fn remove_rebroadcast_inventory(&self, inv: InvVect) {
        if self.shared.is_shutting_down() {
            return;
        }
        if self.shared.rebroadcast.send(RebroadcastMsg::Remove(inv)).is_err() {
            log::trace!("Rebroadcast handler stopped, not removing {:?}", inv);
        }
    }

    /// Relay freshly accepted transactions and keep announcing them until
    /// they confirm
    pub fn announce_new_transactions(&self, txns: &[TxDesc]) {
        for desc in txns {
            let inv = InvVect::tx(desc.tx.txid());
            self.relay_inventory(inv, RelayData::Tx(desc.clone()));
            self.add_rebroadcast_inventory(inv, RelayData::Tx(desc.clone()));
        }
    }

    /// A transaction made it into a block; stop rebroadcasting it
    pub fn transaction_confirmed(&self, txid: Hash) {
        self.remove_rebroadcast_inventory(InvVect::tx(txid));
    }

    pub fn update_peer_heights(&self, new_hash: Hash, new_height: i32, origin: Option<u64>) {
        self.shared
            .send_event(NodeEvent::PeerHeightUpdate(UpdatePeerHeights {
                new_hash,
                new_height,
                origin,
            }));
    }

    // =========================================================================
    // Queries
    // =========================================================================

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.shared.send_event(NodeEvent::Query(build(reply)));
        rx.await.map_err(|_| NodeError::ShuttingDown)
    }

    /// Number of registered peers
    pub async fn connected_count(&self) -> Result<usize, NodeError> {
        self.query(Query::ConnectedCount).await
    }

    pub async fn outbound_group_count(&self, key: &str) -> Result<usize, NodeError> {
        let key = key.to_string();
        self.query(|reply| Query::OutboundGroupCount { key, reply })
            .await
    }

    /// Snapshot of every connected peer
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, NodeError> {
        self.query(Query::Peers).await
    }

    pub async fn persistent_peers(&self) -> Result<Vec<PeerInfo>, NodeError> {
        self.query(Query::PersistentPeers).await
    }

    /// Ask the connection manager to dial `addr`
    pub async fn connect_node(&self, addr: &str, permanent: bool) -> Result<(), NodeError> {
        let addr = addr.to_string();
        self.query(|reply| Query::ConnectNode {
            addr,
            permanent,
            reply,
        })
        .await?
    }

    /// Disconnect every peer matching `cmp`, except persistent ones
    pub async fn disconnect_node(&self, cmp: PeerPredicate) -> Result<(), NodeError> {
        self.query(|reply| Query::DisconnectNode { cmp, reply })
            .await?
    }

    pub async fn disconnect_node_by_addr(&self, addr: &str) -> Result<(), NodeError> {
        let addr = addr.to_string();
        self.disconnect_node(Box::new(move |peer| peer.addr().to_string() == addr))
            .await
    }

    pub async fn disconnect_node_by_id(&self, id: u64) -> Result<(), NodeError> {
        self.disconnect_node(Box::new(move |peer| peer.id() == id))
            .await
    }

    /// Drop a persistent peer matching `cmp`
    pub async fn remove_node(&self, cmp: PeerPredicate) -> Result<(), NodeError> {
        self.query(|reply| Query::RemoveNode { cmp, reply }).await?
    }

    pub async fn remove_node_by_addr(&self, addr: &str) -> Result<(), NodeError> {
        let addr = addr.to_string();
        self.remove_node(Box::new(move |peer| peer.addr().to_string() == addr))
            .await
    }

    pub async fn remove_node_by_id(&self, id: u64) -> Result<(), NodeError> {
        self.remove_node(Box::new(move |peer| peer.id() == id)).await
    }
}
