//! P2P node configuration

use crate::network::message::NetHost;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default maximum number of connected peers
pub const DEFAULT_MAX_PEERS: usize = 125;

/// Default time a misbehaving host stays banned
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default ban score at which a peer is disconnected and banned
pub const DEFAULT_BAN_THRESHOLD: u32 = 100;

/// Default interval between inventory flushes
pub const DEFAULT_TRICKLE_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid whitelist entry: {0}")]
    InvalidWhitelist(String),
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
}

/// Network the node participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
    /// Private simulation network; addresses are never learned or served
    Simnet,
}

impl Network {
    /// Message start bytes
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
            Network::Simnet => [0x16, 0x1c, 0x14, 0x12],
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
            Network::Simnet => 18555,
        }
    }

    pub fn is_simnet(&self) -> bool {
        matches!(self, Network::Simnet)
    }
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" | "testnet3" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            "simnet" => Ok(Network::Simnet),
            other => Err(ConfigError::UnknownNetwork(other.to_string())),
        }
    }
}

/// P2P Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: Network,
    /// Maximum number of inbound plus outbound peers
    pub max_peers: usize,
    pub ban_duration: Duration,
    pub ban_threshold: u32,
    /// Never score or ban peers
    pub disable_banning: bool,
    /// Peers from these subnets are never scored
    pub whitelists: Vec<IpNet>,
    /// Peers whose user agent contains any of these are rejected
    pub agent_blacklist: Vec<String>,
    /// When non-empty, only peers whose user agent contains one of these
    /// are admitted
    pub agent_whitelist: Vec<String>,
    /// Do not accept or relay transactions
    pub blocks_only: bool,
    pub disable_listen: bool,
    /// Do not advertise or serve bloom filtering
    pub no_peer_bloom_filters: bool,
    /// Do not serve committed filters
    pub no_cfilters: bool,
    pub trickle_interval: Duration,
    pub user_agent_comments: Vec<String>,
    /// Addresses to accept connections on
    pub listeners: Vec<SocketAddr>,
    /// Permanent peers; when set, no other outbound connections are made
    pub connect_peers: Vec<SocketAddr>,
    /// Additional permanent peers
    pub add_peers: Vec<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            max_peers: DEFAULT_MAX_PEERS,
            ban_duration: DEFAULT_BAN_DURATION,
            ban_threshold: DEFAULT_BAN_THRESHOLD,
            disable_banning: false,
            whitelists: Vec::new(),
            agent_blacklist: Vec::new(),
            agent_whitelist: Vec::new(),
            blocks_only: false,
            disable_listen: false,
            no_peer_bloom_filters: false,
            no_cfilters: false,
            trickle_interval: DEFAULT_TRICKLE_INTERVAL,
            user_agent_comments: Vec::new(),
            listeners: Vec::new(),
            connect_peers: Vec::new(),
            add_peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Parse whitelist entries; a bare IP is treated as a single-host subnet
    pub fn parse_whitelists(entries: &[String]) -> Result<Vec<IpNet>, ConfigError> {
        entries
            .iter()
            .map(|entry| {
                if let Ok(net) = entry.parse::<IpNet>() {
                    return Ok(net);
                }
                entry
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .map_err(|_| ConfigError::InvalidWhitelist(entry.clone()))
            })
            .collect()
    }

    /// Whether a peer host falls in a whitelisted subnet
    pub fn is_whitelisted(&self, host: &NetHost) -> bool {
        let ip = match host {
            NetHost::Ipv4(ip) => IpAddr::V4(*ip),
            NetHost::Ipv6(ip) => IpAddr::V6(*ip),
            NetHost::TorV3(_) => return false,
        };
        self.whitelists.iter().any(|net| net.contains(&ip))
    }

    /// Services this node advertises
    pub fn services(&self) -> crate::network::message::ServiceFlags {
        use crate::network::message::ServiceFlags;

        let mut services = ServiceFlags::NETWORK | ServiceFlags::WITNESS;
        if !self.no_peer_bloom_filters {
            services |= ServiceFlags::BLOOM;
        }
        if !self.no_cfilters {
            services |= ServiceFlags::CF;
        }
        services
    }

    /// User agent advertised in version messages
    pub fn user_agent(&self) -> String {
        let version = env!("CARGO_PKG_VERSION");
        if self.user_agent_comments.is_empty() {
            format!("/p2pnode:{}/", version)
        } else {
            format!(
                "/p2pnode:{}({})/",
                version,
                self.user_agent_comments.join("; ")
            )
        }
    }

    /// Whether a user agent passes the blacklist and whitelist
    pub fn agent_allowed(&self, user_agent: &str) -> bool {
        if self
            .agent_blacklist
            .iter()
            .any(|banned| user_agent.contains(banned.as_str()))
        {
            return false;
        }
        self.agent_whitelist.is_empty()
            || self
                .agent_whitelist
                .iter()
                .any(|allowed| user_agent.contains(allowed.as_str()))
    }
}
