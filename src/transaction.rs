use std::io::{Read, Write};

use super::{
    encode::{serialize, Decodable, Encodable},
    errors::Result,
    hash::Hash256,
    wire::{ReadWireExt, WriteWireExt},
};

/// Upper bound for input and output counts; a 32 MiB payload cannot hold
/// more than this many 41 byte inputs.
const MAX_TX_ENTRIES: u64 = 1_000_000;

/// Reference to an output of a previous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxOut {
    /// Amount in satoshis.
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// A transaction as relayed by `tx` messages and embedded in blocks.
/// Scripts are carried as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Double SHA-256 of the serialized transaction.
    pub fn txid(&self) -> Result<Hash256> {
        Ok(Hash256::of(&serialize(self)?))
    }
}

impl Encodable for TxIn {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(self.previous_output.hash.as_bytes())?;
        writer.write_u32_le(self.previous_output.index)?;
        writer.write_var_bytes(&self.script_sig)?;
        writer.write_u32_le(self.sequence)
    }
}

impl Decodable for TxIn {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(TxIn {
            previous_output: OutPoint {
                hash: Hash256(reader.read_array()?),
                index: reader.read_u32_le()?,
            },
            script_sig: reader.read_var_bytes()?,
            sequence: reader.read_u32_le()?,
        })
    }
}

impl Encodable for TxOut {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64_le(self.value)?;
        writer.write_var_bytes(&self.script_pubkey)
    }
}

impl Decodable for TxOut {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(TxOut {
            value: reader.read_u64_le()?,
            script_pubkey: reader.read_var_bytes()?,
        })
    }
}

impl Encodable for Transaction {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32_le(self.version)?;
        self.inputs.encode(writer)?;
        self.outputs.encode(writer)?;
        writer.write_u32_le(self.lock_time)
    }
}

impl Decodable for Transaction {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u32_le()?;

        let input_count = reader.read_count(MAX_TX_ENTRIES)?;
        let inputs = (0..input_count)
            .map(|_| TxIn::decode(reader))
            .collect::<Result<Vec<_>>>()?;

        let output_count = reader.read_count(MAX_TX_ENTRIES)?;
        let outputs = (0..output_count)
            .map(|_| TxOut::decode(reader))
            .collect::<Result<Vec<_>>>()?;

        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time: reader.read_u32_le()?,
        })
    }
}
