//! Thread-safe address manager backend

use crate::backend::AddressManager;
use crate::network::addrman::AddrManager;
use crate::network::message::{NetAddress, ServiceFlags};
use parking_lot::Mutex;

/// [`AddrManager`] shared between peers
#[derive(Debug, Default)]
pub struct MemAddrManager {
    inner: Mutex<AddrManager>,
}

impl MemAddrManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address this node is reachable at
    pub fn add_local(&self, addr: NetAddress) {
        self.inner.lock().add_local(addr);
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }
}

impl AddressManager for MemAddrManager {
    fn address_cache(&self) -> Vec<NetAddress> {
        self.inner.lock().address_cache()
    }

    fn add_addresses(&self, addrs: Vec<NetAddress>, source: &NetAddress) {
        let added = self.inner.lock().add_many(addrs, Some(source.key()));
        if added > 0 {
            log::trace!("Added {} addresses from {}", added, source);
        }
    }

    fn best_local_address(&self, remote: &NetAddress) -> Option<NetAddress> {
        self.inner.lock().best_local_address(remote)
    }

    fn need_more_addresses(&self) -> bool {
        self.inner.lock().need_more_addresses()
    }

    fn get_address(&self) -> Option<NetAddress> {
        self.inner.lock().select(false)
    }

    fn attempt(&self, addr: &NetAddress) {
        self.inner.lock().attempt(addr);
    }

    fn good(&self, addr: &NetAddress) {
        self.inner.lock().good(addr);
    }

    fn connected(&self, addr: &NetAddress) {
        self.inner.lock().connected(addr);
    }

    fn disconnected(&self, addr: &NetAddress) {
        self.inner.lock().disconnected(addr);
    }

    fn set_services(&self, addr: &NetAddress, services: ServiceFlags) {
        self.inner.lock().set_services(addr, services);
    }
}
