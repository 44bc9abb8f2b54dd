use std::io::{Read, Write};

use super::{
    encode::{serialize, Decodable, Encodable},
    errors::Result,
    hash::Hash256,
    transaction::Transaction,
    wire::{ReadWireExt, WriteWireExt},
};

/// Serialized size of a block header.
pub const HEADER_SIZE: usize = 80;

/// Upper bound on the transaction count of a `block` message.
const MAX_BLOCK_TRANSACTIONS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    /// Compact difficulty target.
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Double SHA-256 of the 80 byte header.
    pub fn hash(&self) -> Result<Hash256> {
        Ok(Hash256::of(&serialize(self)?))
    }
}

impl Encodable for BlockHeader {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32_le(self.version)?;
        writer.write_all(self.previous_hash.as_bytes())?;
        writer.write_all(self.merkle_root.as_bytes())?;
        writer.write_u32_le(self.timestamp)?;
        writer.write_u32_le(self.bits)?;
        writer.write_u32_le(self.nonce)
    }
}

impl Decodable for BlockHeader {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(BlockHeader {
            version: reader.read_u32_le()?,
            previous_hash: Hash256(reader.read_array()?),
            merkle_root: Hash256(reader.read_array()?),
            timestamp: reader.read_u32_le()?,
            bits: reader.read_u32_le()?,
            nonce: reader.read_u32_le()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Result<Hash256> {
        self.header.hash()
    }
}

impl Encodable for Block {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        self.header.encode(writer)?;
        self.transactions.encode(writer)
    }
}

impl Decodable for Block {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let header = BlockHeader::decode(reader)?;
        let count = reader.read_count(MAX_BLOCK_TRANSACTIONS)?;
        let transactions = (0..count)
            .map(|_| Transaction::decode(reader))
            .collect::<Result<Vec<_>>>()?;

        Ok(Block {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::deserialize;
    use crate::transaction::tests::sample_transaction;

    /// The mainnet genesis block header.
    fn genesis_header() -> BlockHeader {
        let mut merkle_root =
            hex::decode("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
                .unwrap();
        merkle_root.reverse();

        BlockHeader {
            version: 1,
            previous_hash: Hash256::default(),
            merkle_root: Hash256(merkle_root.try_into().unwrap()),
            timestamp: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        }
    }

    #[test]
    fn test_genesis_hash() {
        let header = genesis_header();
        assert_eq!(serialize(&header).unwrap().len(), HEADER_SIZE);
        assert_eq!(
            header.hash().unwrap().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_block_round_trip() {
        let block = Block {
            header: genesis_header(),
            transactions: vec![sample_transaction(), sample_transaction()],
        };
        let bytes = serialize(&block).unwrap();
        assert_eq!(bytes[HEADER_SIZE], 2);

        let decoded = deserialize::<Block>(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash().unwrap(), block.header.hash().unwrap());
    }

    #[test]
    fn test_truncated_header_is_error() {
        let bytes = serialize(&genesis_header()).unwrap();
        assert!(deserialize::<BlockHeader>(&bytes[..HEADER_SIZE - 1]).is_err());
    }
}
