//! Outbound connection manager
//!
//! Dials TCP connections on behalf of the node, keeps permanent peers
//! connected by redialing them with a growing delay, and tops up ordinary
//! outbound connections from the address manager.

use crate::backend::{AddressManager, ConnManager, ConnReq};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Give up on a dial after this long
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Base delay before redialing a permanent peer; grows with each failure
pub const RETRY_DURATION: Duration = Duration::from_secs(5);

pub const MAX_RETRY_DURATION: Duration = Duration::from_secs(5 * 60);

/// Ordinary outbound connections to keep open
pub const DEFAULT_TARGET_OUTBOUND: usize = 8;

/// A dialed connection ready to be handed to the node
pub type Connected = (ConnReq, TcpStream);

struct Request {
    req: ConnReq,
    retries: u32,
}

struct Inner {
    next_id: AtomicU64,
    requests: Mutex<HashMap<u64, Request>>,
    addr_manager: Arc<dyn AddressManager>,
    connected: mpsc::UnboundedSender<Connected>,
    target_outbound: usize,
    quit: CancellationToken,
}

/// [`ConnManager`] dialing plain TCP connections
#[derive(Clone)]
pub struct TcpConnManager {
    inner: Arc<Inner>,
}

impl TcpConnManager {
    pub fn new(
        addr_manager: Arc<dyn AddressManager>,
        target_outbound: usize,
        quit: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Connected>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                requests: Mutex::new(HashMap::new()),
                addr_manager,
                connected: tx,
                target_outbound,
                quit,
            }),
        };
        (manager, rx)
    }

    /// Open the initial set of outbound connections
    pub fn start(&self) {
        for _ in 0..self.inner.target_outbound {
            self.new_conn_req();
        }
    }

    /// Requests that are dialing or connected
    pub fn pending(&self) -> usize {
        self.inner.requests.lock().len()
    }

    fn outbound_count(&self) -> usize {
        self.inner
            .requests
            .lock()
            .values()
            .filter(|r| !r.req.permanent)
            .count()
    }

    fn is_requested(&self, addr: &SocketAddr) -> bool {
        self.inner
            .requests
            .lock()
            .values()
            .any(|r| r.req.addr == *addr)
    }

    fn dial(&self, req: ConnReq, delay: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            let quit = manager.inner.quit.clone();
            if !delay.is_zero() {
                tokio::select! {
                    _ = quit.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            }
            if !manager.inner.requests.lock().contains_key(&req.id) {
                log::trace!("Connection request {} was removed before dialing", req.id);
                return;
            }

            log::debug!("Attempting to connect to {} (req {})", req.addr, req.id);
            let dialed = tokio::select! {
                _ = quit.cancelled() => return,
                result = timeout(CONNECT_TIMEOUT, TcpStream::connect(req.addr)) => result,
            };

            match dialed {
                Ok(Ok(stream)) => {
                    log::info!("Connected to {}", req.addr);
                    if let Some(request) = manager.inner.requests.lock().get_mut(&req.id) {
                        request.retries = 0;
                    }
                    if manager.inner.connected.send((req, stream)).is_err() {
                        log::trace!("Node stopped, dropping connection to {}", req.addr);
                    }
                }
                Ok(Err(e)) => {
                    log::debug!("Failed to connect to {}: {}", req.addr, e);
                    manager.handle_failure(req);
                }
                Err(_) => {
                    log::debug!("Timed out connecting to {}", req.addr);
                    manager.handle_failure(req);
                }
            }
        });
    }

    fn handle_failure(&self, req: ConnReq) {
        if req.permanent {
            self.retry(req.id);
        } else {
            self.remove(req.id);
            self.new_conn_req();
        }
    }

    /// Redial a permanent request after a delay that grows with each retry
    fn retry(&self, id: u64) {
        let (req, delay) = {
            let mut requests = self.inner.requests.lock();
            let Some(request) = requests.get_mut(&id) else {
                return;
            };
            request.retries += 1;
            let delay = (RETRY_DURATION * request.retries).min(MAX_RETRY_DURATION);
            (request.req, delay)
        };
        log::debug!("Retrying connection to {} in {:?}", req.addr, delay);
        self.dial(req, delay);
    }
}

impl ConnManager for TcpConnManager {
    fn connect(&self, addr: SocketAddr, permanent: bool) {
        if self.inner.quit.is_cancelled() {
            return;
        }
        let req = ConnReq {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            addr,
            permanent,
        };
        self.inner
            .requests
            .lock()
            .insert(req.id, Request { req, retries: 0 });
        self.dial(req, Duration::ZERO);
    }

    fn disconnect(&self, id: u64) {
        let permanent = self
            .inner
            .requests
            .lock()
            .get(&id)
            .map_or(false, |r| r.req.permanent);
        if permanent && !self.inner.quit.is_cancelled() {
            self.retry(id);
        } else {
            self.remove(id);
        }
    }

    fn remove(&self, id: u64) {
        if let Some(request) = self.inner.requests.lock().remove(&id) {
            log::trace!("Removed connection request {} to {}", id, request.req.addr);
        }
    }

    fn new_conn_req(&self) {
        if self.inner.quit.is_cancelled() || self.outbound_count() >= self.inner.target_outbound {
            return;
        }

        let Some(na) = self.inner.addr_manager.get_address() else {
            log::trace!("No addresses available for a new outbound connection");
            return;
        };
        let Some(ip) = na.ip() else {
            return;
        };
        let addr = SocketAddr::new(ip, na.port);
        if self.is_requested(&addr) {
            return;
        }
        self.inner.addr_manager.attempt(&na);
        self.connect(addr, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemAddrManager;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_delivers_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (manager, mut connected) =
            TcpConnManager::new(Arc::new(MemAddrManager::new()), 0, CancellationToken::new());

        manager.connect(addr, true);
        let (req, _stream) = tokio::time::timeout(Duration::from_secs(5), connected.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.addr, addr);
        assert!(req.permanent);
        assert_eq!(manager.pending(), 1);

        manager.remove(req.id);
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn test_permanent_peer_redialed_after_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (manager, mut connected) =
            TcpConnManager::new(Arc::new(MemAddrManager::new()), 0, CancellationToken::new());

        manager.connect(addr, true);
        let (first, _stream) = connected.recv().await.unwrap();

        tokio::time::pause();
        manager.disconnect(first.id);
        tokio::time::advance(RETRY_DURATION).await;
        tokio::time::resume();

        let (second, _stream) = tokio::time::timeout(Duration::from_secs(5), connected.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_transient_disconnect_forgets_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (manager, mut connected) =
            TcpConnManager::new(Arc::new(MemAddrManager::new()), 0, CancellationToken::new());

        manager.connect(addr, false);
        let (req, _stream) = connected.recv().await.unwrap();
        manager.disconnect(req.id);
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn test_no_dial_after_quit() {
        let quit = CancellationToken::new();
        let (manager, _connected) =
            TcpConnManager::new(Arc::new(MemAddrManager::new()), 8, quit.clone());
        quit.cancel();

        manager.connect("127.0.0.1:1".parse().unwrap(), true);
        manager.new_conn_req();
        assert_eq!(manager.pending(), 0);
    }
}
