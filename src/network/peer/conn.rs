//! Connection driver: handshake, read loop and trickled writer

use super::{Outgoing, PeerError, ServerPeer};
use crate::network::message::{
    InvVect, Message, NetAddress, NetHost, RejectCode, RejectMessage, VersionMessage,
    ADDRV2_VERSION, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use crate::network::node::NodeEvent;
use crate::network::server::MessageCodec;
use chrono::Utc;
use futures::sink::{Sink, SinkExt};
use futures::stream::{Stream, StreamExt};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;

/// Time allowed to complete the version handshake
pub const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Disconnect after this long without hearing from the peer
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const PING_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Maximum inventory vectors sent in one trickled inv
pub const MAX_INV_TRICKLE_SIZE: usize = 1000;

/// Drive a connection until either side closes it
pub(crate) async fn run_peer<S>(
    peer: Arc<ServerPeer>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    stream: S,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let codec = MessageCodec::new(peer.shared.config.network.magic());
    let (mut writer, mut reader) = Framed::new(stream, codec).split();

    let negotiated = tokio::select! {
        _ = peer.quit_token().cancelled() => Err(PeerError::Disconnected),
        result = timeout(NEGOTIATE_TIMEOUT, negotiate(&peer, &mut writer, &mut reader)) => {
            result.unwrap_or(Err(PeerError::NegotiationTimeout))
        }
    };

    match negotiated {
        Ok(()) => {
            let write_task = tokio::spawn(write_loop(peer.clone(), writer, outgoing));
            read_loop(&peer, &mut reader).await;
            peer.disconnect();
            if let Err(e) = write_task.await {
                log::error!("Writer for {} failed: {}", peer, e);
            }
        }
        Err(e) => {
            log::debug!("Can't negotiate protocol with {}: {}", peer, e);
            peer.disconnect();
        }
    }

    log::debug!("Peer {} disconnected", peer);
    peer.shared.send_event(NodeEvent::DonePeer(peer.clone()));
    if peer.verack_received() {
        let backend = &peer.shared.backend;
        backend.sync_manager.done_peer(peer.id());
        backend.tx_pool.remove_orphans_by_tag(peer.id());
    }
}

// =============================================================================
// Handshake
// =============================================================================

async fn next_message<R>(reader: &mut R) -> Result<Message, PeerError>
where
    R: Stream<Item = Result<Message, io::Error>> + Unpin,
{
    match reader.next().await {
        Some(msg) => Ok(msg?),
        None => Err(PeerError::Disconnected),
    }
}

fn local_version_msg(peer: &ServerPeer) -> VersionMessage {
    let shared = &peer.shared;
    let remote = peer.na();
    let addr_from = shared
        .backend
        .addr_manager
        .best_local_address(&remote)
        .unwrap_or_else(|| {
            NetAddress::new(NetHost::Ipv4(Ipv4Addr::UNSPECIFIED), 0, shared.services)
        });

    VersionMessage {
        protocol_version: PROTOCOL_VERSION,
        services: shared.services,
        timestamp: Utc::now(),
        addr_recv: remote,
        addr_from,
        nonce: shared.new_nonce(),
        user_agent: shared.config.user_agent(),
        start_height: shared.backend.chain.best_snapshot().height,
        disable_relay_tx: shared.config.blocks_only,
    }
}

async fn negotiate<W, R>(
    peer: &Arc<ServerPeer>,
    writer: &mut W,
    reader: &mut R,
) -> Result<(), PeerError>
where
    W: Sink<Message, Error = io::Error> + Unpin,
    R: Stream<Item = Result<Message, io::Error>> + Unpin,
{
    if !peer.is_inbound() {
        writer.send(Message::Version(local_version_msg(peer))).await?;
    }

    let remote = match next_message(reader).await? {
        Message::Version(msg) => msg,
        other => return Err(PeerError::UnexpectedMessage(other.command())),
    };
    if peer.shared.is_own_nonce(remote.nonce) {
        return Err(PeerError::SelfConnection);
    }

    peer.set_negotiated(
        remote.protocol_version.min(PROTOCOL_VERSION),
        remote.services,
        remote.user_agent.clone(),
        remote.start_height,
    );
    log::debug!(
        "Received version from {}: protocol {}, services {:?}, agent {}",
        peer,
        remote.protocol_version,
        remote.services,
        remote.user_agent
    );

    if let Some(reject) = peer.on_version(&remote) {
        let reason = reject.reason.clone();
        writer.send(Message::Reject(reject)).await?;
        return Err(PeerError::Rejected(reason));
    }
    if !peer.is_connected() {
        return Err(PeerError::Disconnected);
    }
    if remote.protocol_version < MIN_PROTOCOL_VERSION {
        let reject = RejectMessage {
            command: "version".to_string(),
            code: RejectCode::Obsolete,
            reason: format!(
                "protocol version must be {} or greater",
                MIN_PROTOCOL_VERSION
            ),
        };
        writer.send(Message::Reject(reject)).await?;
        return Err(PeerError::ProtocolVersionTooOld(remote.protocol_version));
    }

    if peer.is_inbound() {
        writer.send(Message::Version(local_version_msg(peer))).await?;
    }
    if peer.protocol_version() >= ADDRV2_VERSION {
        writer.send(Message::SendAddrV2).await?;
    }
    writer.send(Message::VerAck).await?;

    loop {
        match next_message(reader).await? {
            Message::VerAck => break,
            Message::SendAddrV2 => peer.set_wants_addrv2(),
            other => return Err(PeerError::UnexpectedMessage(other.command())),
        }
    }

    peer.set_verack_received();
    peer.on_verack();
    Ok(())
}

// =============================================================================
// Reader / writer
// =============================================================================

async fn read_loop<R>(peer: &Arc<ServerPeer>, reader: &mut R)
where
    R: Stream<Item = Result<Message, io::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = peer.quit_token().cancelled() => break,
            next = timeout(IDLE_TIMEOUT, reader.next()) => next,
        };

        match next {
            Err(_) => {
                log::info!("Peer {} no answer for {:?} -- disconnecting", peer, IDLE_TIMEOUT);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                log::debug!("Can't read message from {}: {}", peer, e);
                break;
            }
            Ok(Some(Ok(msg))) => {
                log::trace!("Received {} from {}", msg.command(), peer);
                peer.handle_message(msg).await;
            }
        }
    }
}

async fn write_loop<W>(
    peer: Arc<ServerPeer>,
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) where
    W: Sink<Message, Error = io::Error> + Unpin,
{
    let trickle_interval = peer.shared.config.trickle_interval;
    let mut trickle = interval_at(Instant::now() + trickle_interval, trickle_interval);
    trickle.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut pending: Vec<InvVect> = Vec::new();

    loop {
        let result = tokio::select! {
            _ = peer.quit_token().cancelled() => break,
            item = outgoing.recv() => match item {
                Some(Outgoing::Message(msg, done)) => {
                    let result = writer.send(msg).await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    result
                }
                Some(Outgoing::Inventory(inv)) => {
                    if !peer.has_known_inventory(&inv) {
                        pending.push(inv);
                    }
                    Ok(())
                }
                None => break,
            },
            _ = trickle.tick() => flush_inventory(&peer, &mut writer, &mut pending).await,
            _ = ping.tick() => writer.send(Message::Ping(rand::random())).await,
        };

        if let Err(e) = result {
            log::debug!("Can't send message to {}: {}", peer, e);
            peer.disconnect();
            break;
        }
    }
}

/// Announce queued inventory the peer does not already know about
async fn flush_inventory<W>(
    peer: &ServerPeer,
    writer: &mut W,
    pending: &mut Vec<InvVect>,
) -> Result<(), io::Error>
where
    W: Sink<Message, Error = io::Error> + Unpin,
{
    let mut batch = Vec::new();
    for inv in pending.drain(..) {
        if peer.has_known_inventory(&inv) {
            continue;
        }
        peer.add_known_inventory(inv);
        batch.push(inv);
        if batch.len() >= MAX_INV_TRICKLE_SIZE {
            writer.send(Message::Inv(std::mem::take(&mut batch))).await?;
        }
    }
    if !batch.is_empty() {
        writer.send(Message::Inv(batch)).await?;
    }
    Ok(())
}
