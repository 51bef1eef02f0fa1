//! p2pnode: standalone peer-to-peer node
//!
//! Runs the networking core over in-memory chain and mempool backends.

use clap::Parser;
use p2p_node::backend::{
    Accepted, Backend, ConnManager, LocalSync, MemAddrManager, MemChain, MemPool,
};
use p2p_node::network::config::{
    DEFAULT_BAN_DURATION, DEFAULT_BAN_THRESHOLD, DEFAULT_MAX_PEERS, DEFAULT_TRICKLE_INTERVAL,
};
use p2p_node::network::connmgr::{Connected, DEFAULT_TARGET_OUTBOUND};
use p2p_node::network::message::NetAddress;
use p2p_node::network::{InvVect, Network, Node, NodeConfig, RelayData, Server, TcpConnManager};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "p2pnode")]
#[command(version)]
#[command(about = "Peer-to-peer networking core of a full node", long_about = None)]
struct Cli {
    /// Network to join (mainnet, testnet, regtest, simnet)
    #[arg(long, default_value = "mainnet")]
    network: Network,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    debuglevel: String,

    /// Interfaces to listen on; defaults to all interfaces on the network port
    #[arg(long)]
    listen: Vec<SocketAddr>,

    /// Do not accept inbound connections
    #[arg(long)]
    nolisten: bool,

    /// Connect only to these peers
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Additional peers to keep connected
    #[arg(long)]
    addpeer: Vec<SocketAddr>,

    /// Address this node is reachable at, advertised to peers
    #[arg(long)]
    externalip: Vec<SocketAddr>,

    #[arg(long, default_value_t = DEFAULT_MAX_PEERS)]
    maxpeers: usize,

    /// Ordinary outbound connections to maintain
    #[arg(long, default_value_t = DEFAULT_TARGET_OUTBOUND)]
    targetoutbound: usize,

    /// How long to ban misbehaving peers, in seconds
    #[arg(long, default_value_t = DEFAULT_BAN_DURATION.as_secs())]
    banduration: u64,

    #[arg(long, default_value_t = DEFAULT_BAN_THRESHOLD)]
    banthreshold: u32,

    #[arg(long)]
    nobanning: bool,

    /// Subnets or addresses that are never banned
    #[arg(long)]
    whitelist: Vec<String>,

    /// Reject peers whose user agent contains this
    #[arg(long)]
    agentblacklist: Vec<String>,

    /// Only accept peers whose user agent contains this
    #[arg(long)]
    agentwhitelist: Vec<String>,

    /// Do not accept or relay loose transactions
    #[arg(long)]
    blocksonly: bool,

    #[arg(long)]
    nopeerbloomfilters: bool,

    #[arg(long)]
    nocfilters: bool,

    /// Inventory trickle interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_TRICKLE_INTERVAL.as_millis() as u64)]
    trickleinterval: u64,

    /// Comment appended to the user agent
    #[arg(long)]
    uacomment: Vec<String>,

    /// Shut down after this many seconds
    #[arg(long)]
    shutdownafter: Option<u64>,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig, Box<dyn std::error::Error>> {
        Ok(NodeConfig {
            network: self.network,
            max_peers: self.maxpeers,
            ban_duration: Duration::from_secs(self.banduration),
            ban_threshold: self.banthreshold,
            disable_banning: self.nobanning,
            whitelists: NodeConfig::parse_whitelists(&self.whitelist)?,
            agent_blacklist: self.agentblacklist.clone(),
            agent_whitelist: self.agentwhitelist.clone(),
            blocks_only: self.blocksonly,
            disable_listen: self.nolisten,
            no_peer_bloom_filters: self.nopeerbloomfilters,
            no_cfilters: self.nocfilters,
            trickle_interval: Duration::from_millis(self.trickleinterval),
            user_agent_comments: self.uacomment.clone(),
            listeners: self.listen.clone(),
            connect_peers: self.connect.clone(),
            add_peers: self.addpeer.clone(),
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logger
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.debuglevel.as_str()),
    )
    .init();

    let config = cli.node_config()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, &cli))
}

async fn run(config: NodeConfig, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let chain = Arc::new(MemChain::with_height(0));
    let pool = Arc::new(MemPool::new());
    let addrs = Arc::new(MemAddrManager::new());
    for addr in &cli.externalip {
        addrs.add_local(NetAddress::from_socket_addr(*addr, config.services()));
    }

    let (sync, accepted) = LocalSync::new(chain.clone(), pool.clone());
    let conn_quit = CancellationToken::new();
    let (conn, connected) = TcpConnManager::new(addrs.clone(), cli.targetoutbound, conn_quit.clone());

    let node = Node::new(
        config.clone(),
        Backend {
            chain,
            tx_pool: pool,
            addr_manager: addrs,
            conn_manager: Arc::new(conn.clone()),
            sync_manager: Arc::new(sync),
        },
    );
    node.start()?;

    if !config.disable_listen {
        let listeners = if config.listeners.is_empty() {
            vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                config.network.default_port(),
            )]
        } else {
            config.listeners.clone()
        };
        for addr in listeners {
            let server = Server::bind(addr).await?;
            tokio::spawn(server.run(node.clone(), node.quit_token()));
        }
    }

    tokio::spawn(forward_connections(node.clone(), connected));
    tokio::spawn(relay_accepted(node.clone(), accepted));

    // Explicit connect peers replace automatic outbound connections
    if config.connect_peers.is_empty() {
        for addr in &config.add_peers {
            conn.connect(*addr, true);
        }
        conn.start();
    } else {
        for addr in &config.connect_peers {
            conn.connect(*addr, true);
        }
    }

    if let Some(secs) = cli.shutdownafter {
        node.schedule_shutdown(Duration::from_secs(secs));
    }

    let quit = node.quit_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received interrupt, shutting down");
            node.stop();
        }
        _ = quit.cancelled() => {}
    }

    conn_quit.cancel();
    node.wait_for_shutdown().await;
    log::info!("Shutdown complete");
    Ok(())
}

/// Hand dialed connections to the node
async fn forward_connections(node: Node, mut connected: mpsc::UnboundedReceiver<Connected>) {
    while let Some((req, stream)) = connected.recv().await {
        node.outbound_peer_connected(req, stream);
    }
}

/// Relay what the sync manager accepted and keep peer heights current
async fn relay_accepted(node: Node, mut accepted: mpsc::UnboundedReceiver<Accepted>) {
    while let Some(item) = accepted.recv().await {
        match item {
            Accepted::Tx(desc) => node.announce_new_transactions(&[desc]),
            Accepted::Block {
                hash,
                height,
                header,
                txids,
                origin,
            } => {
                for txid in txids {
                    node.transaction_confirmed(txid);
                }
                node.relay_inventory(InvVect::block(hash), RelayData::Header(header));
                node.update_peer_heights(hash, height, Some(origin));
            }
        }
    }
}
