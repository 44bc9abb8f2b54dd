use std::io::{Read, Write};
use std::time::SystemTime;

use super::{
    address::{PeerAddress, ServiceFlags},
    encode::{Decodable, Encodable},
    errors::Result,
    hash::Hash256,
    wire::{ReadWireExt, WriteWireExt},
};

/// Most addresses a single `addr` message may carry.
pub const MAX_ADDRESSES: u64 = 1000;

/// Most items a single `inv` or `getdata` message may carry.
pub const MAX_INV_ITEMS: u64 = 50_000;

/// VersionPayload represents the payload of a version message
/// https://developer.bitcoin.org/reference/p2p_networking.html#version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    /// The highest protocol version understood by the transmitting node.
    pub version: u32,

    /// The services supported by the transmitting node encoded as a bitfield.
    pub services: ServiceFlags,

    /// The current Unix epoch time according to the transmitting node's clock.
    pub timestamp: i64,

    /// First address record of the payload.
    pub my_address: PeerAddress,

    /// Second address record of the payload.
    pub your_address: PeerAddress,

    /// A random nonce which can help a node detect a connection to itself.
    pub nonce: u64,

    /// Client version string, e.g. `/Satoshi:0.3.17/`.
    pub user_agent: String,

    /// The height of the transmitting node's best block chain.
    pub start_height: u32,
}

impl VersionPayload {
    pub fn build(
        version: u32,
        services: ServiceFlags,
        my_address: PeerAddress,
        your_address: PeerAddress,
        nonce: u64,
        user_agent: &str,
        start_height: u32,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();

        VersionPayload {
            version,
            services,
            timestamp,
            my_address,
            your_address,
            nonce,
            user_agent: user_agent.to_string(),
            start_height,
        }
    }
}

impl Encodable for VersionPayload {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32_le(self.version)?;
        writer.write_u64_le(self.services.to_u64())?;
        writer.write_i64_le(self.timestamp)?;
        self.my_address.encode(writer)?;
        self.your_address.encode(writer)?;
        writer.write_u64_le(self.nonce)?;
        writer.write_var_string(&self.user_agent)?;
        writer.write_u32_le(self.start_height)
    }
}

impl Decodable for VersionPayload {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(VersionPayload {
            version: reader.read_u32_le()?,
            services: ServiceFlags::from_u64(reader.read_u64_le()?),
            timestamp: reader.read_i64_le()?,
            my_address: PeerAddress::decode(reader)?,
            your_address: PeerAddress::decode(reader)?,
            nonce: reader.read_u64_le()?,
            user_agent: reader.read_var_string()?,
            start_height: reader.read_u32_le()?,
        })
    }
}

/// Writes an `addr` payload: a count, then a last-seen timestamp and an
/// address record per entry.
pub fn write_addresses<W: Write + ?Sized>(writer: &mut W, addresses: &[PeerAddress]) -> Result<()> {
    writer.write_var_int(addresses.len() as u64)?;
    for address in addresses {
        writer.write_u32_le(address.last_seen())?;
        address.encode(writer)?;
    }
    Ok(())
}

pub fn read_addresses<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<PeerAddress>> {
    let count = reader.read_count(MAX_ADDRESSES)?;
    let mut addresses = Vec::with_capacity(count);
    for _ in 0..count {
        let last_seen = reader.read_u32_le()?;
        addresses.push(PeerAddress::decode(reader)?.with_last_seen(last_seen));
    }
    Ok(addresses)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
    Other(u32),
}

impl From<u32> for InvType {
    fn from(n: u32) -> Self {
        match n {
            0 => InvType::Error,
            1 => InvType::Tx,
            2 => InvType::Block,
            n => InvType::Other(n),
        }
    }
}

impl From<InvType> for u32 {
    fn from(inv_type: InvType) -> Self {
        match inv_type {
            InvType::Error => 0,
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::Other(n) => n,
        }
    }
}

/// An inventory item, the (type, hash) pair announcing a transaction or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    pub inv_type: InvType,
    pub hash: Hash256,
}

impl InventoryItem {
    pub fn new(inv_type: InvType, hash: Hash256) -> Self {
        Self { inv_type, hash }
    }
}

impl Encodable for InventoryItem {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32_le(self.inv_type.into())?;
        Ok(writer.write_all(self.hash.as_bytes())?)
    }
}

impl Decodable for InventoryItem {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(InventoryItem {
            inv_type: InvType::from(reader.read_u32_le()?),
            hash: Hash256(reader.read_array()?),
        })
    }
}

pub fn read_inventory<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<InventoryItem>> {
    let count = reader.read_count(MAX_INV_ITEMS)?;
    (0..count).map(|_| InventoryItem::decode(reader)).collect()
}
