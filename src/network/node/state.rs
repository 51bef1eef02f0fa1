//! Registry of connected peers, owned by the orchestrator task

use crate::network::addrman::group_key;
use crate::network::peer::ServerPeer;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;

pub(crate) type PeerMap = HashMap<u64, Arc<ServerPeer>>;

/// Connected peers split by category, plus bans and outbound diversity
#[derive(Default)]
pub struct PeerState {
    pub(crate) inbound: PeerMap,
    pub(crate) outbound: PeerMap,
    pub(crate) persistent: PeerMap,
    /// Host to ban expiry
    pub(crate) banned: HashMap<String, Instant>,
    /// Outbound connections per network group
    pub(crate) outbound_groups: HashMap<String, usize>,
    /// Persistent peers dropped by an administrative remove whose done
    /// event has not arrived yet; they must not be redialed
    pub(crate) removed: HashSet<u64>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered peers
    pub fn count(&self) -> usize {
        self.inbound.len() + self.outbound.len() + self.persistent.len()
    }

    pub(crate) fn for_all_peers(&self) -> impl Iterator<Item = &Arc<ServerPeer>> {
        self.inbound
            .values()
            .chain(self.outbound.values())
            .chain(self.persistent.values())
    }

    /// The map a peer belongs in
    pub(crate) fn list_for(&mut self, peer: &ServerPeer) -> &mut PeerMap {
        if peer.is_persistent() {
            &mut self.persistent
        } else if peer.is_inbound() {
            &mut self.inbound
        } else {
            &mut self.outbound
        }
    }

    pub fn outbound_group_count(&self, key: &str) -> usize {
        self.outbound_groups.get(key).copied().unwrap_or(0)
    }

    pub(crate) fn add_outbound_group(&mut self, peer: &ServerPeer) {
        *self.outbound_groups.entry(group_key(&peer.na())).or_insert(0) += 1;
    }

    pub(crate) fn remove_outbound_group(&mut self, peer: &ServerPeer) {
        let key = group_key(&peer.na());
        if let Some(count) = self.outbound_groups.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.outbound_groups.remove(&key);
            }
        }
    }
}

/// Remove and disconnect the first peer in `list` matching `cmp`
pub(crate) fn disconnect_peer(
    list: &mut PeerMap,
    cmp: &dyn Fn(&ServerPeer) -> bool,
) -> Option<Arc<ServerPeer>> {
    let id = list
        .iter()
        .find(|(_, peer)| cmp(peer))
        .map(|(id, _)| *id)?;
    let peer = list.remove(&id)?;
    peer.disconnect();
    Some(peer)
}
