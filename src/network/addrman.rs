//! Address Manager (AddrMan) for peer discovery
//!
//! Bitcoin-style address manager that maintains:
//! - New addresses: Recently heard but not yet connected
//! - Tried addresses: Successfully connected peers
//!
//! Also provides the address classification used for outbound connection
//! diversity (`group_key`) and for deciding what is worth relaying
//! (`is_routable`).

use crate::network::message::{NetAddress, NetHost, ServiceFlags, MAX_ADDR_PER_MSG};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

// =============================================================================
// Constants
// =============================================================================

/// Number of buckets for new addresses
const NEW_BUCKET_COUNT: usize = 256;

/// Number of entries per new bucket
const NEW_BUCKET_SIZE: usize = 64;

/// Number of buckets for tried addresses
const TRIED_BUCKET_COUNT: usize = 64;

/// Number of entries per tried bucket
const TRIED_BUCKET_SIZE: usize = 64;

/// Below this many known addresses, peers are asked for more
const NEED_ADDRESS_THRESHOLD: usize = 1000;

/// Upper bound on addresses handed out from the cache
const GET_ADDR_MAX: usize = 2500;

/// Percentage of known addresses handed out from the cache
const GET_ADDR_PERCENT: usize = 23;

// =============================================================================
// Address classification
// =============================================================================

fn ipv4_in(ip: Ipv4Addr, net: [u8; 4], prefix: u32) -> bool {
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    (u32::from(ip) & mask) == (u32::from(Ipv4Addr::from(net)) & mask)
}

fn is_6to4(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] == 0x2002
}

fn is_teredo(ip: &Ipv6Addr) -> bool {
    let s = ip.segments();
    s[0] == 0x2001 && s[1] == 0
}

fn is_he_net(ip: &Ipv6Addr) -> bool {
    let s = ip.segments();
    s[0] == 0x2001 && s[1] == 0x0470
}

fn ipv4_routable(ip: Ipv4Addr) -> bool {
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ipv4_in(ip, [100, 64, 0, 0], 10)
        || ipv4_in(ip, [198, 18, 0, 0], 15))
}

fn ipv6_routable(ip: &Ipv6Addr) -> bool {
    let s = ip.segments();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || (s[0] & 0xfe00) == 0xfc00
        || (s[0] & 0xffc0) == 0xfe80
        || (s[0] == 0x2001 && s[1] == 0x0db8))
}

/// Whether an address is publicly reachable and worth relaying
pub fn is_routable(addr: &NetAddress) -> bool {
    match addr.host {
        NetHost::Ipv4(ip) => ipv4_routable(ip),
        NetHost::Ipv6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => ipv4_routable(v4),
            None => ipv6_routable(&ip),
        },
        NetHost::TorV3(_) => true,
    }
}

fn ipv4_group(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    Ipv4Addr::new(o[0], o[1], 0, 0).to_string()
}

/// Network group of an address, used to spread outbound connections
///
/// IPv4 addresses (including those tunnelled over 6to4 and Teredo) group
/// by /16, Hurricane Electric IPv6 by /36, other IPv6 by /32 and onion
/// services by the top four bits of their key.
pub fn group_key(addr: &NetAddress) -> String {
    if !is_routable(addr) {
        return match addr.host {
            NetHost::Ipv4(ip) if ip.is_loopback() => "local".to_string(),
            NetHost::Ipv6(ip) if ip.is_loopback() => "local".to_string(),
            _ => "unroutable".to_string(),
        };
    }
    match addr.host {
        NetHost::Ipv4(ip) => ipv4_group(ip),
        NetHost::Ipv6(ip) => {
            if let Some(v4) = ip.to_ipv4_mapped() {
                return ipv4_group(v4);
            }
            let s = ip.segments();
            if is_6to4(&ip) {
                let [a, b] = s[1].to_be_bytes();
                return ipv4_group(Ipv4Addr::new(a, b, 0, 0));
            }
            if is_teredo(&ip) {
                let [a, b] = (s[6] ^ 0xffff).to_be_bytes();
                return ipv4_group(Ipv4Addr::new(a, b, 0, 0));
            }
            if is_he_net(&ip) {
                return Ipv6Addr::new(s[0], s[1], s[2] & 0xf000, 0, 0, 0, 0, 0).to_string();
            }
            Ipv6Addr::new(s[0], s[1], 0, 0, 0, 0, 0, 0).to_string()
        }
        NetHost::TorV3(key) => format!("tor:{}", key[0] >> 4),
    }
}

// =============================================================================
// Address Entry
// =============================================================================

/// Extended address entry with metadata
#[derive(Debug, Clone)]
pub struct AddrEntry {
    /// The network address
    pub addr: NetAddress,
    /// Source peer that told us about this address
    pub source: Option<String>,
    /// Number of connection attempts
    pub attempts: u32,
    /// Number of successful connections
    pub successes: u32,
    /// Last successful connection time
    pub last_success: Option<Instant>,
    /// Last connection attempt time
    pub last_attempt: Option<Instant>,
    /// Is this address in the tried table?
    pub in_tried: bool,
    /// Reference count (how many sources reported this)
    pub ref_count: u32,
}

impl AddrEntry {
    pub fn new(addr: NetAddress, source: Option<String>) -> Self {
        Self {
            addr,
            source,
            attempts: 0,
            successes: 0,
            last_success: None,
            last_attempt: None,
            in_tried: false,
            ref_count: 1,
        }
    }

    /// Too many failed attempts without a single success
    pub fn is_terrible(&self) -> bool {
        self.last_attempt.is_some() && self.successes == 0 && self.attempts >= 3
    }

    /// Weight used by `select` (higher = more likely)
    pub fn get_chance(&self) -> f64 {
        let mut chance = 1.0;
        if self.attempts > 0 && self.successes == 0 {
            chance *= 0.5_f64.powi(self.attempts as i32);
        }
        if self.successes > 0 {
            chance *= 2.0;
        }
        chance.max(0.001)
    }

    pub fn attempt(&mut self) {
        self.attempts += 1;
        self.last_attempt = Some(Instant::now());
    }

    pub fn good(&mut self) {
        self.successes += 1;
        self.last_success = Some(Instant::now());
        self.attempts = 0;
    }
}

// =============================================================================
// Address Manager
// =============================================================================

/// Bitcoin-style address manager for peer discovery
#[derive(Debug)]
pub struct AddrManager {
    /// Map from address key to entry
    by_addr: HashMap<String, AddrEntry>,

    /// New table buckets (recently heard addresses)
    new_table: Vec<Vec<String>>,

    /// Tried table buckets (successfully connected addresses)
    tried_table: Vec<Vec<String>>,

    /// Addresses we're currently connected to
    connected: HashSet<String>,

    /// Our own externally reachable addresses
    local_addrs: Vec<NetAddress>,

    /// Random key for bucket assignment
    key: u64,
}

impl AddrManager {
    /// Create a new address manager
    pub fn new() -> Self {
        Self {
            by_addr: HashMap::new(),
            new_table: vec![Vec::with_capacity(NEW_BUCKET_SIZE); NEW_BUCKET_COUNT],
            tried_table: vec![Vec::with_capacity(TRIED_BUCKET_SIZE); TRIED_BUCKET_COUNT],
            connected: HashSet::new(),
            local_addrs: Vec::new(),
            key: rand::thread_rng().gen(),
        }
    }

    /// Get number of addresses
    pub fn size(&self) -> usize {
        self.by_addr.len()
    }

    /// Get number of new addresses
    pub fn new_count(&self) -> usize {
        self.by_addr.values().filter(|e| !e.in_tried).count()
    }

    /// Get number of tried addresses
    pub fn tried_count(&self) -> usize {
        self.by_addr.values().filter(|e| e.in_tried).count()
    }

    /// Add a new address
    pub fn add(&mut self, addr: NetAddress, source: Option<String>) -> bool {
        if !is_routable(&addr) {
            return false;
        }

        let key = addr.key();
        if self.connected.contains(&key) {
            return false;
        }

        if let Some(entry) = self.by_addr.get_mut(&key) {
            entry.ref_count += 1;
            if addr.timestamp > entry.addr.timestamp {
                entry.addr.timestamp = addr.timestamp;
            }
            entry.addr.services |= addr.services;
            return false;
        }

        let bucket = self.get_new_bucket(&key, source.as_deref().unwrap_or(""));
        self.by_addr.insert(key.clone(), AddrEntry::new(addr, source));
        if self.new_table[bucket].len() < NEW_BUCKET_SIZE {
            self.new_table[bucket].push(key);
        }

        true
    }

    /// Add multiple addresses (from an addr message)
    pub fn add_many(&mut self, addrs: Vec<NetAddress>, source: Option<String>) -> usize {
        let mut added = 0;
        for addr in addrs.into_iter().take(MAX_ADDR_PER_MSG) {
            if self.add(addr, source.clone()) {
                added += 1;
            }
        }
        added
    }

    /// Mark address as good (successful connection)
    pub fn good(&mut self, addr: &NetAddress) {
        let key = addr.key();
        if let Some(entry) = self.by_addr.get_mut(&key) {
            entry.good();
            entry.addr.timestamp = Utc::now();
            if !entry.in_tried {
                self.make_tried(&key);
            }
        }
    }

    /// Mark address as attempted
    pub fn attempt(&mut self, addr: &NetAddress) {
        if let Some(entry) = self.by_addr.get_mut(&addr.key()) {
            entry.attempt();
        }
    }

    /// Mark address as connected
    pub fn connected(&mut self, addr: &NetAddress) {
        let key = addr.key();
        if let Some(entry) = self.by_addr.get_mut(&key) {
            entry.addr.timestamp = Utc::now();
        }
        self.connected.insert(key);
    }

    /// Mark address as disconnected
    pub fn disconnected(&mut self, addr: &NetAddress) {
        self.connected.remove(&addr.key());
    }

    /// Record the services a peer advertised in its version message
    pub fn set_services(&mut self, addr: &NetAddress, services: ServiceFlags) {
        if let Some(entry) = self.by_addr.get_mut(&addr.key()) {
            entry.addr.services = services;
        }
    }

    /// Whether peers should be asked for more addresses
    pub fn need_more_addresses(&self) -> bool {
        self.size() < NEED_ADDRESS_THRESHOLD
    }

    /// Select an address to connect to
    pub fn select(&self, new_only: bool) -> Option<NetAddress> {
        let mut rng = rand::thread_rng();

        let use_new = if new_only {
            true
        } else {
            match (self.new_count(), self.tried_count()) {
                (_, 0) => true,
                (0, _) => false,
                _ => rng.gen::<bool>(),
            }
        };

        let eligible: Vec<_> = self
            .by_addr
            .iter()
            .filter(|(k, e)| {
                !self.connected.contains(*k) && !e.is_terrible() && (use_new == !e.in_tried)
            })
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let total_weight: f64 = eligible.iter().map(|(_, e)| e.get_chance()).sum();
        let mut target = rng.gen::<f64>() * total_weight;

        for (_, entry) in &eligible {
            target -= entry.get_chance();
            if target <= 0.0 {
                return Some(entry.addr);
            }
        }

        eligible.first().map(|(_, e)| e.addr)
    }

    /// A random sample of known addresses for answering getaddr
    pub fn address_cache(&self) -> Vec<NetAddress> {
        let mut addrs: Vec<NetAddress> = self
            .by_addr
            .values()
            .filter(|e| !e.is_terrible())
            .map(|e| e.addr)
            .collect();

        let count = (addrs.len() * GET_ADDR_PERCENT / 100)
            .max(addrs.len().min(MAX_ADDR_PER_MSG))
            .min(GET_ADDR_MAX);

        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(count);
        addrs
    }

    /// Register an address we are reachable at
    pub fn add_local(&mut self, addr: NetAddress) {
        if !self.local_addrs.iter().any(|a| a.key() == addr.key()) {
            self.local_addrs.push(addr);
        }
    }

    /// The local address most likely reachable from `remote`
    ///
    /// Prefers an address of the same family as the remote peer.
    pub fn best_local_address(&self, remote: &NetAddress) -> Option<NetAddress> {
        let same_family = |a: &&NetAddress| {
            matches!(
                (a.host, remote.host),
                (NetHost::Ipv4(_), NetHost::Ipv4(_))
                    | (NetHost::Ipv6(_), NetHost::Ipv6(_))
                    | (NetHost::TorV3(_), NetHost::TorV3(_))
            )
        };
        self.local_addrs
            .iter()
            .find(same_family)
            .or_else(|| self.local_addrs.first())
            .map(|a| NetAddress {
                timestamp: Utc::now(),
                ..*a
            })
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    fn get_new_bucket(&self, addr: &str, source: &str) -> usize {
        (self.hash_addr(addr, source) as usize) % NEW_BUCKET_COUNT
    }

    fn get_tried_bucket(&self, addr: &str) -> usize {
        (self.hash_addr(addr, "") as usize) % TRIED_BUCKET_COUNT
    }

    fn hash_addr(&self, addr: &str, source: &str) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.key.hash(&mut hasher);
        addr.hash(&mut hasher);
        source.hash(&mut hasher);
        hasher.finish()
    }

    /// Move address from new to tried table
    fn make_tried(&mut self, addr: &str) {
        let already_tried = self.by_addr.get(addr).map(|e| e.in_tried).unwrap_or(true);
        if already_tried {
            return;
        }

        for bucket in &mut self.new_table {
            bucket.retain(|a| a != addr);
        }

        let bucket = self.get_tried_bucket(addr);
        if self.tried_table[bucket].len() < TRIED_BUCKET_SIZE {
            self.tried_table[bucket].push(addr.to_string());
        }

        if let Some(entry) = self.by_addr.get_mut(addr) {
            entry.in_tried = true;
        }
    }
}

impl Default for AddrManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> NetAddress {
        NetAddress::new(
            NetHost::Ipv4(Ipv4Addr::new(a, b, c, d)),
            8333,
            ServiceFlags::NETWORK,
        )
    }

    #[test]
    fn test_add_address() {
        let mut mgr = AddrManager::new();

        let addr = v4(8, 8, 8, 8);
        assert!(mgr.add(addr, None));
        assert!(!mgr.add(addr, None));

        assert_eq!(mgr.size(), 1);
        assert_eq!(mgr.new_count(), 1);
        assert_eq!(mgr.tried_count(), 0);
    }

    #[test]
    fn test_unroutable_rejected() {
        let mut mgr = AddrManager::new();
        assert!(!mgr.add(v4(127, 0, 0, 1), None));
        assert!(!mgr.add(v4(192, 168, 1, 7), None));
        assert!(!mgr.add(v4(100, 64, 3, 3), None));
        assert_eq!(mgr.size(), 0);
    }

    #[test]
    fn test_good_moves_to_tried() {
        let mut mgr = AddrManager::new();
        let addr = v4(8, 8, 8, 8);
        mgr.add(addr, None);

        mgr.good(&addr);

        assert_eq!(mgr.new_count(), 0);
        assert_eq!(mgr.tried_count(), 1);
    }

    #[test]
    fn test_select_skips_connected() {
        let mut mgr = AddrManager::new();
        let addr = v4(1, 1, 1, 1);
        mgr.add(addr, None);
        assert!(mgr.select(false).is_some());

        mgr.connected(&addr);
        assert!(mgr.select(false).is_none());
    }

    #[test]
    fn test_address_cache_sample() {
        let mut mgr = AddrManager::new();
        for i in 1..10 {
            mgr.add(v4(8, 8, 8, i), None);
        }
        assert_eq!(mgr.address_cache().len(), 9);
        assert!(mgr.need_more_addresses());
    }

    #[test]
    fn test_group_key_ipv4_by_16() {
        assert_eq!(group_key(&v4(8, 8, 4, 4)), "8.8.0.0");
        assert_eq!(group_key(&v4(8, 8, 4, 4)), group_key(&v4(8, 8, 200, 1)));
        assert_ne!(group_key(&v4(8, 8, 4, 4)), group_key(&v4(8, 9, 4, 4)));
        assert_eq!(group_key(&v4(127, 0, 0, 1)), "local");
        assert_eq!(group_key(&v4(10, 0, 0, 1)), "unroutable");
    }

    #[test]
    fn test_group_key_ipv6() {
        let six_to_four = NetAddress::new(
            NetHost::Ipv6("2002:0c22:3844::1".parse().unwrap()),
            8333,
            ServiceFlags::NETWORK,
        );
        assert_eq!(group_key(&six_to_four), "12.34.0.0");

        let plain = NetAddress::new(
            NetHost::Ipv6("2a01:4f8:1:2::3".parse().unwrap()),
            8333,
            ServiceFlags::NETWORK,
        );
        assert_eq!(group_key(&plain), "2a01:4f8::");
    }

    #[test]
    fn test_best_local_address_prefers_family() {
        let mut mgr = AddrManager::new();
        let v6 = NetAddress::new(
            NetHost::Ipv6("2a01:4f8::1".parse().unwrap()),
            8333,
            ServiceFlags::NETWORK,
        );
        mgr.add_local(v6);
        mgr.add_local(v4(5, 6, 7, 8));

        let best = mgr.best_local_address(&v4(9, 9, 9, 9)).unwrap();
        assert_eq!(best.key(), "5.6.7.8:8333");
    }
}
