use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::Result;
use btc_net::{
    Config, HandshakeResponder, InventoryRelay, Network, PeerAddress, PoolMaintainer, Reactor,
    ServiceFlags,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

const BTC_SEED: &str = "seed.bitcoin.sipa.be";

/// Bitcoin p2p node.
#[derive(Parser, Debug, Clone)]
#[command(name = "btc-net")]
#[command(version)]
struct Cli {
    /// Network to join (mainnet, testnet, regtest).
    #[arg(long, default_value = "mainnet")]
    network: Network,

    /// P2P listen address, defaults to the network's port on all interfaces.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Do not accept inbound connections.
    #[arg(long)]
    no_listen: bool,

    /// Comma-separated list of peers to dial at startup.
    #[arg(long, value_delimiter = ',')]
    connect: Vec<SocketAddr>,

    /// Resolve the DNS seed and add its addresses to the pool.
    #[arg(long)]
    dns_seed: bool,

    /// Number of connections to keep.
    #[arg(long, default_value_t = 50)]
    target_connections: usize,

    /// Reject frames whose checksum does not match.
    #[arg(long)]
    verify_checksums: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::for_network(self.network);
        if self.no_listen {
            config.listen = None;
        } else if let Some(listen) = self.listen {
            config.listen = Some(listen);
        }
        config.target_connections = self.target_connections;
        config.verify_checksums = self.verify_checksums;
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.config();
    let mut reactor = Reactor::new(&config)?;
    let handle = reactor.handle();

    let pool = PoolMaintainer::new(&config);
    for addr in &cli.connect {
        pool.add_address(PeerAddress::from_socket_addr(*addr, ServiceFlags::NODE_NETWORK));
    }
    if cli.dns_seed {
        tracing::info!("Getting seed from {}", BTC_SEED);
        match (BTC_SEED, config.network.default_port()).to_socket_addrs() {
            Ok(addrs) => addrs.for_each(|addr| {
                pool.add_address(PeerAddress::from_socket_addr(addr, ServiceFlags::NODE_NETWORK));
            }),
            Err(err) => tracing::warn!("Failed to resolve {}: {}", BTC_SEED, err),
        }
    }

    let relay = InventoryRelay::new(&config);

    reactor.add_listener(HandshakeResponder::new(&config));
    reactor.add_listener(pool.clone());
    reactor.add_listener(relay.clone());

    handle.schedule(pool.maintenance_task(handle.clone()))?;
    handle.schedule(PoolMaintainer::getaddr_task(
        handle.clone(),
        config.getaddr_interval,
    ))?;
    handle.schedule(relay.announce_task(handle.clone()))?;

    // dial the first peer now instead of after a full connect interval
    pool.maintain(&handle)?;

    reactor.run()?;
    Ok(())
}
