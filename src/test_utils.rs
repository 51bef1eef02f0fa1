//! Test doubles and helpers shared by the unit tests

use crate::backend::{Backend, ConnManager, MemAddrManager, MemChain, MemPool, SyncManager};
use crate::core::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut, SEQUENCE_FINAL, TX_VERSION};
use crate::crypto::Hash;
use crate::network::config::{Network, NodeConfig};
use crate::network::message::{
    InvVect, Message, NetAddress, ServiceFlags, VersionMessage, PROTOCOL_VERSION,
};
use crate::network::node::{Node, NodeEvent};
use crate::network::peer::{Outgoing, PeerInfo, ServerPeer};
use crate::network::server::MessageCodec;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

// =============================================================================
// Recording collaborators
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnCall {
    Connect(SocketAddr, bool),
    Disconnect(u64),
    Remove(u64),
    NewConnReq,
}

#[derive(Default)]
pub(crate) struct RecordingConnManager {
    calls: Mutex<Vec<ConnCall>>,
}

impl RecordingConnManager {
    pub(crate) fn calls(&self) -> Vec<ConnCall> {
        self.calls.lock().clone()
    }
}

impl ConnManager for RecordingConnManager {
    fn connect(&self, addr: SocketAddr, permanent: bool) {
        self.calls.lock().push(ConnCall::Connect(addr, permanent));
    }

    fn disconnect(&self, id: u64) {
        self.calls.lock().push(ConnCall::Disconnect(id));
    }

    fn remove(&self, id: u64) {
        self.calls.lock().push(ConnCall::Remove(id));
    }

    fn new_conn_req(&self) {
        self.calls.lock().push(ConnCall::NewConnReq);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SyncCall {
    NewPeer(u64),
    DonePeer(u64),
    Tx(Hash, u64),
    Block(Hash, u64),
    Inv(Vec<InvVect>, u64),
    Headers(usize, u64),
    NotFound(Vec<InvVect>, u64),
}

/// Sync manager that records calls and can hold back acknowledgements
pub(crate) struct RecordingSync {
    calls: Mutex<Vec<SyncCall>>,
    held: Mutex<Vec<oneshot::Sender<()>>>,
    hold: AtomicBool,
    current: AtomicBool,
}

impl Default for RecordingSync {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            hold: AtomicBool::new(false),
            current: AtomicBool::new(true),
        }
    }
}

impl RecordingSync {
    pub(crate) fn calls(&self) -> Vec<SyncCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn set_current(&self, current: bool) {
        self.current.store(current, Ordering::SeqCst);
    }

    /// Keep acknowledgements until [`RecordingSync::release`]
    pub(crate) fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        for done in self.held.lock().drain(..) {
            let _ = done.send(());
        }
    }

    fn ack(&self, done: oneshot::Sender<()>) {
        if self.hold.load(Ordering::SeqCst) {
            self.held.lock().push(done);
        } else {
            let _ = done.send(());
        }
    }
}

impl SyncManager for RecordingSync {
    fn new_peer(&self, peer: &PeerInfo) {
        self.calls.lock().push(SyncCall::NewPeer(peer.id));
    }

    fn done_peer(&self, peer_id: u64) {
        self.calls.lock().push(SyncCall::DonePeer(peer_id));
    }

    fn queue_tx(&self, tx: Transaction, peer_id: u64, done: oneshot::Sender<()>) {
        self.calls.lock().push(SyncCall::Tx(tx.txid(), peer_id));
        self.ack(done);
    }

    fn queue_block(&self, block: Block, peer_id: u64, done: oneshot::Sender<()>) {
        self.calls
            .lock()
            .push(SyncCall::Block(block.block_hash(), peer_id));
        self.ack(done);
    }

    fn queue_inv(&self, inv: Vec<InvVect>, peer_id: u64) {
        self.calls.lock().push(SyncCall::Inv(inv, peer_id));
    }

    fn queue_headers(&self, headers: Vec<BlockHeader>, peer_id: u64) {
        self.calls
            .lock()
            .push(SyncCall::Headers(headers.len(), peer_id));
    }

    fn queue_not_found(&self, inv: Vec<InvVect>, peer_id: u64) {
        self.calls.lock().push(SyncCall::NotFound(inv, peer_id));
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Node fixtures
// =============================================================================

pub(crate) struct TestBackend {
    pub chain: Arc<MemChain>,
    pub pool: Arc<MemPool>,
    pub addrs: Arc<MemAddrManager>,
    pub conn: Arc<RecordingConnManager>,
    pub sync: Arc<RecordingSync>,
}

impl TestBackend {
    pub(crate) fn new(height: i32) -> Self {
        Self {
            chain: Arc::new(MemChain::with_height(height)),
            pool: Arc::new(MemPool::new()),
            addrs: Arc::new(MemAddrManager::new()),
            conn: Arc::new(RecordingConnManager::default()),
            sync: Arc::new(RecordingSync::default()),
        }
    }

    pub(crate) fn backend(&self) -> Backend {
        Backend {
            chain: self.chain.clone(),
            tx_pool: self.pool.clone(),
            addr_manager: self.addrs.clone(),
            conn_manager: self.conn.clone(),
            sync_manager: self.sync.clone(),
        }
    }
}

pub(crate) fn test_config() -> NodeConfig {
    NodeConfig {
        network: Network::Regtest,
        trickle_interval: Duration::from_millis(20),
        ..NodeConfig::default()
    }
}

pub(crate) fn test_node(config: NodeConfig) -> (Node, TestBackend) {
    test_node_at(config, 10)
}

/// A node whose chain tip is at `height`
pub(crate) fn test_node_at(config: NodeConfig, height: i32) -> (Node, TestBackend) {
    let backend = TestBackend::new(height);
    let node = Node::new(config, backend.backend());
    (node, backend)
}

/// A peer that completed its handshake, without a connection behind it
pub(crate) fn test_peer(
    node: &Node,
    addr: &str,
    inbound: bool,
) -> (Arc<ServerPeer>, mpsc::UnboundedReceiver<Outgoing>) {
    test_peer_with(node, addr, inbound, None)
}

pub(crate) fn test_peer_with(
    node: &Node,
    addr: &str,
    inbound: bool,
    conn_req: Option<crate::backend::ConnReq>,
) -> (Arc<ServerPeer>, mpsc::UnboundedReceiver<Outgoing>) {
    let addr: SocketAddr = addr.parse().unwrap_or_else(|_| panic!("bad address {}", addr));
    let (peer, rx) = ServerPeer::new(node.shared.clone(), addr, inbound, conn_req);
    peer.set_negotiated(
        PROTOCOL_VERSION,
        ServiceFlags::NETWORK | ServiceFlags::WITNESS,
        "/test:1.0/".to_string(),
        0,
    );
    peer.set_verack_received();
    (peer, rx)
}

/// Hand a peer to the orchestrator as if its handshake just finished
pub(crate) fn register(node: &Node, peer: &Arc<ServerPeer>) {
    node.shared.send_event(NodeEvent::NewPeer(peer.clone()));
}

/// Messages queued for a peer so far; write acknowledgements are fired
pub(crate) fn drain_messages(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outgoing::Message(msg, done) = item {
            if let Some(done) = done {
                let _ = done.send(());
            }
            messages.push(msg);
        }
    }
    messages
}

/// Inventory queued for trickling so far
pub(crate) fn drain_inventory(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<InvVect> {
    let mut inventory = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outgoing::Inventory(inv) = item {
            inventory.push(inv);
        }
    }
    inventory
}

/// Forward queued messages, acknowledging each write like the real writer
pub(crate) fn auto_ack(
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) -> mpsc::UnboundedReceiver<Message> {
    let (tx, out) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if let Outgoing::Message(msg, done) = item {
                let _ = tx.send(msg);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    });
    out
}

/// Wait until the orchestrator reports `count` peers
pub(crate) async fn wait_for_count(node: &Node, count: usize) {
    for _ in 0..500 {
        if node.connected_count().await.unwrap_or(usize::MAX) == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer count never reached {}", count);
}

// =============================================================================
// Chain data
// =============================================================================

pub(crate) fn sample_tx(n: u8) -> Transaction {
    Transaction {
        version: TX_VERSION,
        inputs: vec![TxIn {
            previous_outpoint: OutPoint::new(Hash::digest(&[n]), 0),
            signature_script: vec![0x01, n],
            witness: vec![],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOut {
            value: 10_000,
            pk_script: vec![0x14, n, n, n],
        }],
        lock_time: 0,
    }
}

// =============================================================================
// Remote side of a connection
// =============================================================================

/// The far end of a duplex connection handed to a node
pub(crate) struct RemotePeer {
    framed: Framed<DuplexStream, MessageCodec>,
}

impl RemotePeer {
    pub(crate) fn new(stream: DuplexStream, network: Network) -> Self {
        Self {
            framed: Framed::new(stream, MessageCodec::new(network.magic())),
        }
    }

    pub(crate) fn version_msg(services: ServiceFlags) -> VersionMessage {
        let addr = NetAddress::from_socket_addr(
            "127.0.0.1:18444".parse().unwrap_or_else(|_| unreachable!()),
            services,
        );
        VersionMessage {
            protocol_version: PROTOCOL_VERSION,
            services,
            timestamp: Utc::now(),
            addr_recv: addr,
            addr_from: addr,
            nonce: rand::random(),
            user_agent: "/remote:1.0/".to_string(),
            start_height: 0,
            disable_relay_tx: false,
        }
    }

    pub(crate) async fn send(&mut self, msg: Message) {
        self.framed.send(msg).await.unwrap();
    }

    /// Next message, failing the test after a few seconds
    pub(crate) async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .expect("decode error")
    }

    /// Next message other than a ping
    pub(crate) async fn recv_skip_ping(&mut self) -> Message {
        loop {
            match self.recv().await {
                Message::Ping(_) => continue,
                msg => return msg,
            }
        }
    }

    /// Whether the node closed the connection within a few seconds
    pub(crate) async fn closed(&mut self) -> bool {
        let closed = async {
            loop {
                match self.framed.next().await {
                    None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .is_ok()
    }

    /// Complete the handshake as the connecting side
    pub(crate) async fn handshake_as_initiator(&mut self, services: ServiceFlags) -> VersionMessage {
        self.send(Message::Version(Self::version_msg(services))).await;
        let version = match self.recv().await {
            Message::Version(version) => version,
            other => panic!("expected version, got {}", other.command()),
        };
        self.finish_handshake().await;
        version
    }

    /// Complete the handshake as the accepting side
    pub(crate) async fn handshake_as_responder(&mut self, services: ServiceFlags) -> VersionMessage {
        let version = match self.recv().await {
            Message::Version(version) => version,
            other => panic!("expected version, got {}", other.command()),
        };
        self.send(Message::Version(Self::version_msg(services))).await;
        self.finish_handshake().await;
        version
    }

    async fn finish_handshake(&mut self) {
        loop {
            match self.recv().await {
                Message::SendAddrV2 => continue,
                Message::VerAck => break,
                other => panic!("unexpected {} during handshake", other.command()),
            }
        }
        self.send(Message::VerAck).await;
    }
}
