use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{
    encode::{Decodable, Encodable},
    errors::Result,
    wire::{ReadWireExt, WriteWireExt},
};

/// Size of an address record on the wire.
pub const ADDRESS_SIZE: usize = 26;

/// IPv4-mapped IPv6 prefix that precedes the 4 address bytes.
const IPV4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// ServiceFlags represents the service flags of a node
/// https://developer.bitcoin.org/reference/p2p_networking.html#version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ServiceFlags(u64);

impl ServiceFlags {
    /// This node is not a full node. It may not be able to provide any data except for the transactions it originates.
    pub const UNNAMED: ServiceFlags = ServiceFlags(0);

    /// This is a full node and can be asked for full blocks. It should implement all protocol features available in its self-reported protocol version
    pub const NODE_NETWORK: ServiceFlags = ServiceFlags(0x1);

    /// This is a full node capable of responding to the getutxo protocol request. This is not supported by any currently-maintained Bitcoin node.
    pub const NODE_GETUTXO: ServiceFlags = ServiceFlags(0x2);

    /// This is a full node capable and willing to handle bloom-filtered connections.
    pub const NODE_BLOOM: ServiceFlags = ServiceFlags(0x4);

    /// This is a full node that can be asked for blocks and transactions including witness data.
    pub const NODE_WITNESS: ServiceFlags = ServiceFlags(0x8);

    /// This is the same as NODE_NETWORK but the node has at least the last 288 blocks (last 2 days).
    pub const NODE_NETWORK_LIMITED: ServiceFlags = ServiceFlags(0x0400);

    /// Gets the integer representation of this ServiceFlags
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// Gets the ServiceFlags from an integer representation
    pub fn from_u64(n: u64) -> Self {
        ServiceFlags(n)
    }

    pub fn contains(self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl From<u64> for ServiceFlags {
    fn from(n: u64) -> Self {
        ServiceFlags(n)
    }
}

impl std::ops::BitOr for ServiceFlags {
    type Output = ServiceFlags;

    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

/// A network endpoint as carried by `addr` and `version` messages.
///
/// Two addresses are equal when ip and port match; services and last-seen
/// time do not take part in equality, ordering or hashing, so a set of
/// addresses holds one entry per endpoint.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddress {
    ip: Ipv4Addr,
    port: u16,
    services: ServiceFlags,
    last_seen: u32,
}

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16, services: ServiceFlags) -> Self {
        Self {
            ip,
            port,
            services,
            last_seen: 0,
        }
    }

    /// Builds an address record for a socket address. IPv6 endpoints that are
    /// not IPv4-mapped cannot be carried in the 4 byte field and become
    /// `0.0.0.0`.
    pub fn from_socket_addr(addr: SocketAddr, services: ServiceFlags) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        Self::new(ip, addr.port(), services)
    }

    pub fn unspecified() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, 0, ServiceFlags::UNNAMED)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn services(&self) -> ServiceFlags {
        self.services
    }

    /// Last time the address was seen, in protocol epoch seconds.
    pub fn last_seen(&self) -> u32 {
        self.last_seen
    }

    pub fn set_last_seen(&mut self, last_seen: u32) {
        self.last_seen = last_seen;
    }

    pub fn with_last_seen(mut self, last_seen: u32) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl PartialOrd for PeerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ip, self.port).cmp(&(other.ip, other.port))
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}[services={}]", self.ip, self.port, self.services.to_u64())
    }
}

impl Encodable for PeerAddress {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64_le(self.services.to_u64())?;
        writer.write_all(&IPV4_MAPPED_PREFIX)?;
        writer.write_all(&self.ip.octets())?;
        // the port is the one big-endian field of the protocol
        writer.write_u16::<BigEndian>(self.port)?;
        Ok(())
    }
}

impl Decodable for PeerAddress {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let services = ServiceFlags::from_u64(reader.read_u64_le()?);
        let _reserved: [u8; 12] = reader.read_array()?;
        let ip = Ipv4Addr::from(reader.read_array::<4>()?);
        let port = reader.read_u16::<BigEndian>()?;

        Ok(Self::new(ip, port, services))
    }
}
