//! The orchestrator loop
//!
//! Runs on a single task and is the only code that touches [`PeerState`].
//! Handlers never await, so one slow peer cannot hold up the others.

use super::state::{disconnect_peer, PeerState};
use super::{BroadcastMessage, NodeError, NodeEvent, Query, RelayData, RelayMessage};
use super::{Shared, UpdatePeerHeights};
use crate::network::addrman::is_routable;
use crate::network::message::{InvType, Message, NET_ADDRESS_TIME_VERSION};
use crate::network::peer::ServerPeer;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub(super) async fn peer_handler(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
) {
    let mut state = PeerState::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = shared.quit.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handle_event(&shared, &mut state, event);
    }

    for peer in state.for_all_peers() {
        log::trace!("Shutdown peer {}", peer);
        peer.disconnect();
    }

    // Anything still queued is dropped so no sender is left waiting
    let mut drained = 0usize;
    while events.try_recv().is_ok() {
        drained += 1;
    }
    if drained > 0 {
        log::debug!("Dropped {} events during shutdown", drained);
    }

    log::info!("Peer handler done");
    shared.done.cancel();
}

pub(super) fn handle_event(shared: &Shared, state: &mut PeerState, event: NodeEvent) {
    match event {
        NodeEvent::NewPeer(peer) => {
            handle_add_peer(shared, state, peer);
        }
        NodeEvent::DonePeer(peer) => handle_done_peer(shared, state, &peer),
        NodeEvent::BanPeer(host) => handle_ban_peer(shared, state, host),
        NodeEvent::RelayInventory(msg) => handle_relay_inv(state, &msg),
        NodeEvent::Broadcast(msg) => handle_broadcast(state, msg),
        NodeEvent::PeerHeightUpdate(msg) => handle_update_peer_heights(state, &msg),
        NodeEvent::Query(query) => handle_query(shared, state, query),
    }
}

// =============================================================================
// Peer lifecycle
// =============================================================================

/// Register a peer that finished its handshake, returning whether it was kept
fn handle_add_peer(shared: &Shared, state: &mut PeerState, peer: Arc<ServerPeer>) -> bool {
    if !peer.is_connected() {
        return false;
    }

    let config = &shared.config;
    if !config.agent_allowed(&peer.user_agent()) {
        log::debug!(
            "Rejecting peer {} with undesired user agent {}",
            peer,
            peer.user_agent()
        );
        peer.disconnect();
        return false;
    }

    if shared.is_shutting_down() {
        log::info!("New peer {} ignored - server is shutting down", peer);
        peer.disconnect();
        return false;
    }

    let host = peer.host();
    if let Some(ban_end) = state.banned.get(&host).copied() {
        let now = Instant::now();
        if now < ban_end {
            log::debug!(
                "Peer {} is banned for another {:?} - disconnecting",
                host,
                ban_end - now
            );
            peer.disconnect();
            return false;
        }
        log::info!("Peer {} is no longer banned", host);
        state.banned.remove(&host);
    }

    if state.count() >= config.max_peers {
        log::info!(
            "Max peers reached [{}] - disconnecting peer {}",
            config.max_peers,
            peer
        );
        peer.disconnect();
        return false;
    }

    log::debug!("New peer {}", peer);
    if !peer.is_inbound() {
        state.add_outbound_group(&peer);
    }
    state.list_for(&peer).insert(peer.id(), peer.clone());

    let backend = &shared.backend;
    if peer.verack_received() && peer.version_known() {
        backend.addr_manager.connected(&peer.na());
    }

    backend.sync_manager.new_peer(&peer.info());

    // Outbound peers learn about us and tell us about others
    if !config.network.is_simnet() && !peer.is_inbound() {
        if !config.disable_listen && backend.sync_manager.is_current() {
            if let Some(local) = backend.addr_manager.best_local_address(&peer.na()) {
                if is_routable(&local) {
                    peer.push_addr_msg(&[local]);
                }
            }
        }

        if backend.addr_manager.need_more_addresses()
            && peer.protocol_version() >= NET_ADDRESS_TIME_VERSION
        {
            peer.queue_message(Message::GetAddr, None);
        }

        backend.addr_manager.good(&peer.na());
    }

    true
}

fn handle_done_peer(shared: &Shared, state: &mut PeerState, peer: &ServerPeer) {
    // The connection manager hears about every disconnect, even for peers
    // that never made it into the registry
    let removed = state.removed.remove(&peer.id());
    if let Some(req) = peer.conn_req() {
        let conn_manager = &shared.backend.conn_manager;
        if removed {
            log::trace!("Not redialing removed peer {}", peer);
        } else if peer.is_persistent() {
            conn_manager.disconnect(req.id);
        } else {
            conn_manager.remove(req.id);
            conn_manager.new_conn_req();
        }
    }

    if state.list_for(peer).remove(&peer.id()).is_some() {
        if !peer.is_inbound() {
            state.remove_outbound_group(peer);
        }
        log::debug!("Removed peer {}", peer);
    }

    // Mirrors the `connected` report made when the peer was added
    if peer.verack_received() && peer.version_known() {
        shared.backend.addr_manager.disconnected(&peer.na());
    }
}

fn handle_ban_peer(shared: &Shared, state: &mut PeerState, host: String) {
    let duration = shared.config.ban_duration;
    log::info!("Banned peer {} for {:?}", host, duration);
    state.banned.insert(host, Instant::now() + duration);
}

// =============================================================================
// Relay
// =============================================================================

fn handle_relay_inv(state: &PeerState, msg: &RelayMessage) {
    for peer in state.for_all_peers() {
        if !peer.is_connected() {
            continue;
        }

        if msg.inv.inv_type == InvType::Block && peer.prefers_headers() {
            match &msg.data {
                RelayData::Header(header) => {
                    peer.queue_message(Message::Headers(vec![*header]), None);
                }
                RelayData::Tx(_) => {
                    log::warn!("Underlying data for headers is not a block header");
                }
            }
            continue;
        }

        if msg.inv.inv_type == InvType::Tx {
            if peer.relay_tx_disabled() {
                continue;
            }

            let RelayData::Tx(desc) = &msg.data else {
                log::warn!("Underlying data for tx inv relay is not a transaction descriptor");
                continue;
            };

            let fee_filter = peer.fee_filter();
            if fee_filter > 0 && desc.fee_per_kb < fee_filter {
                continue;
            }

            if !peer.filter_matches(&desc.tx).unwrap_or(true) {
                continue;
            }
        }

        peer.queue_inventory(msg.inv);
    }
}

fn handle_broadcast(state: &PeerState, msg: BroadcastMessage) {
    for peer in state.for_all_peers() {
        if !peer.is_connected() || msg.exclude.contains(&peer.id()) {
            continue;
        }
        peer.queue_message(msg.message.clone(), None);
    }
}

fn handle_update_peer_heights(state: &PeerState, msg: &UpdatePeerHeights) {
    for peer in state.for_all_peers() {
        // The origin already knows its own height
        if Some(peer.id()) == msg.origin {
            continue;
        }

        if peer.last_announced_block() == Some(msg.new_hash) {
            peer.update_last_block_height(msg.new_height);
            peer.update_last_announced_block(None);
        }
    }
}

// =============================================================================
// Queries
// =============================================================================

fn parse_addr(addr: &str, default_port: u16) -> Result<SocketAddr, NodeError> {
    if let Ok(addr) = addr.parse::<SocketAddr>() {
        return Ok(addr);
    }
    addr.trim_matches(|c| c == '[' || c == ']')
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| NodeError::InvalidAddress(addr.to_string()))
}

fn handle_query(shared: &Shared, state: &mut PeerState, query: Query) {
    match query {
        Query::ConnectedCount(reply) => {
            let _ = reply.send(state.count());
        }
        Query::OutboundGroupCount { key, reply } => {
            let _ = reply.send(state.outbound_group_count(&key));
        }
        Query::Peers(reply) => {
            let peers = state
                .for_all_peers()
                .filter(|peer| peer.is_connected())
                .map(|peer| peer.info())
                .collect();
            let _ = reply.send(peers);
        }
        Query::PersistentPeers(reply) => {
            let peers = state.persistent.values().map(|peer| peer.info()).collect();
            let _ = reply.send(peers);
        }
        Query::ConnectNode {
            addr,
            permanent,
            reply,
        } => {
            let _ = reply.send(connect_node(shared, state, &addr, permanent));
        }
        Query::RemoveNode { cmp, reply } => {
            let result = match disconnect_peer(&mut state.persistent, cmp.as_ref()) {
                Some(peer) => {
                    state.remove_outbound_group(&peer);
                    if let Some(req) = peer.conn_req() {
                        shared.backend.conn_manager.remove(req.id);
                    }
                    state.removed.insert(peer.id());
                    Ok(())
                }
                None => Err(NodeError::PeerNotFound),
            };
            let _ = reply.send(result);
        }
        Query::DisconnectNode { cmp, reply } => {
            let _ = reply.send(disconnect_node(state, cmp.as_ref()));
        }
    }
}

fn connect_node(
    shared: &Shared,
    state: &PeerState,
    addr: &str,
    permanent: bool,
) -> Result<(), NodeError> {
    if state.count() >= shared.config.max_peers {
        return Err(NodeError::MaxPeers);
    }

    if state
        .persistent
        .values()
        .any(|peer| peer.addr().to_string() == addr)
    {
        return Err(if permanent {
            NodeError::PeerAlreadyConnected
        } else {
            NodeError::PeerIsPermanent
        });
    }

    let net_addr = parse_addr(addr, shared.config.network.default_port())?;
    shared.backend.conn_manager.connect(net_addr, permanent);
    Ok(())
}

fn disconnect_node(
    state: &mut PeerState,
    cmp: &dyn Fn(&ServerPeer) -> bool,
) -> Result<(), NodeError> {
    if disconnect_peer(&mut state.inbound, cmp).is_some() {
        return Ok(());
    }

    // Several outbound connections may share an address
    let mut found = false;
    while let Some(peer) = disconnect_peer(&mut state.outbound, cmp) {
        state.remove_outbound_group(&peer);
        found = true;
    }

    if found {
        Ok(())
    } else {
        Err(NodeError::PeerNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addr() {
        assert_eq!(
            parse_addr("1.2.3.4:8333", 18444).unwrap(),
            "1.2.3.4:8333".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_addr("1.2.3.4", 18444).unwrap(),
            "1.2.3.4:18444".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_addr("[::1]", 8333).unwrap(),
            "[::1]:8333".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(
            parse_addr("not an address", 8333),
            Err(NodeError::InvalidAddress(_))
        ));
    }
}
