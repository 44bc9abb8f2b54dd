use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::{
    address::ServiceFlags,
    frame::{Codec, MAX_PAYLOAD_SIZE},
    message::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION},
    network::Network,
};

/// Settings for a reactor and the listeners that run on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub network: Network,

    /// Address to accept inbound connections on, `None` for outbound only.
    pub listen: Option<SocketAddr>,

    /// Version advertised in our `version` message.
    pub protocol_version: u32,

    /// Received `version` messages below this are a decode error.
    pub min_protocol_version: u32,

    pub user_agent: String,

    pub services: ServiceFlags,

    /// Reject received frames whose checksum does not match the payload.
    pub verify_checksums: bool,

    pub max_payload_size: u32,

    /// Readiness events fetched per poll.
    pub event_capacity: usize,

    /// Number of connections the pool maintainer tries to keep.
    pub target_connections: usize,

    /// Cap of the address pool; the oldest address is evicted first.
    pub max_known_addresses: usize,

    /// Minimum gap between two outbound connection attempts.
    pub connect_interval: Duration,

    /// Period of the `getaddr` broadcast.
    pub getaddr_interval: Duration,

    /// Number of transactions and blocks the relay remembers.
    pub relay_memory: usize,

    /// Minimum gap between two inventory announcements.
    pub relay_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let network = Network::default();

        Self {
            network,
            listen: Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                network.default_port(),
            )),
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            user_agent: format!("/btc-net:{}/", env!("CARGO_PKG_VERSION")),
            services: ServiceFlags::NODE_NETWORK,
            verify_checksums: false,
            max_payload_size: MAX_PAYLOAD_SIZE,
            event_capacity: 1024,
            target_connections: 50,
            max_known_addresses: 1000,
            connect_interval: Duration::from_secs(10),
            getaddr_interval: Duration::from_secs(5 * 60),
            relay_memory: 1000,
            relay_interval: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Default settings for `network`, listening on its default port.
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            listen: Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                network.default_port(),
            )),
            ..Self::default()
        }
    }

    pub fn codec(&self) -> Codec {
        Codec {
            network: self.network,
            min_protocol_version: self.min_protocol_version,
            verify_checksums: self.verify_checksums,
            max_payload_size: self.max_payload_size,
        }
    }
}
