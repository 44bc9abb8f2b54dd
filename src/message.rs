use std::io::Write;

use super::{
    address::PeerAddress,
    block::Block,
    command::Command,
    encode::{deserialize, Decodable, Encodable},
    errors::{BTCNetError, Result},
    payload::{read_addresses, read_inventory, write_addresses, InventoryItem, VersionPayload},
    transaction::Transaction,
    wire::{ReadWireExt, WriteWireExt},
};

/// The protocol version this crate speaks by default.
pub const PROTOCOL_VERSION: u32 = 31700;

/// Lowest protocol version accepted in a received `version` message by default.
pub const MIN_PROTOCOL_VERSION: u32 = 20900;

/// The closed set of messages exchanged with peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    VerAck,
    /// Older protocol versions send an empty ping, newer ones a nonce.
    Ping(Option<u64>),
    Pong(u64),
    Addr(Vec<PeerAddress>),
    Inventory(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    GetAddr,
    Transaction(Transaction),
    Block(Block),
    /// A message whose command is not understood. Kept verbatim and never
    /// re-encoded.
    Unknown { command: String, payload: Vec<u8> },
}

/// Settings a payload decoder may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    pub min_protocol_version: u32,
}

impl Default for DecodeContext {
    fn default() -> Self {
        Self {
            min_protocol_version: MIN_PROTOCOL_VERSION,
        }
    }
}

type DecodeFn = fn(&[u8], &DecodeContext) -> Result<Message>;

/// Payload decoders keyed by command name. Adding a message is one entry here.
const DECODERS: [(Command, DecodeFn); 10] = [
    (Command::Version, decode_version),
    (Command::VerAck, decode_verack),
    (Command::Ping, decode_ping),
    (Command::Pong, decode_pong),
    (Command::Addr, decode_addr),
    (Command::Inv, decode_inv),
    (Command::GetData, decode_getdata),
    (Command::GetAddr, decode_getaddr),
    (Command::Tx, decode_tx),
    (Command::Block, decode_block),
];

fn decode_version(mut bytes: &[u8], context: &DecodeContext) -> Result<Message> {
    let payload = VersionPayload::decode(&mut bytes)?;
    if payload.version < context.min_protocol_version {
        return Err(BTCNetError::UnsupportedVersion {
            version: payload.version,
            min: context.min_protocol_version,
        });
    }
    Ok(Message::Version(payload))
}

fn decode_verack(_: &[u8], _: &DecodeContext) -> Result<Message> {
    Ok(Message::VerAck)
}

fn decode_ping(mut bytes: &[u8], _: &DecodeContext) -> Result<Message> {
    if bytes.is_empty() {
        return Ok(Message::Ping(None));
    }
    Ok(Message::Ping(Some(bytes.read_u64_le()?)))
}

fn decode_pong(mut bytes: &[u8], _: &DecodeContext) -> Result<Message> {
    Ok(Message::Pong(bytes.read_u64_le()?))
}

fn decode_addr(mut bytes: &[u8], _: &DecodeContext) -> Result<Message> {
    Ok(Message::Addr(read_addresses(&mut bytes)?))
}

fn decode_inv(mut bytes: &[u8], _: &DecodeContext) -> Result<Message> {
    Ok(Message::Inventory(read_inventory(&mut bytes)?))
}

fn decode_getdata(mut bytes: &[u8], _: &DecodeContext) -> Result<Message> {
    Ok(Message::GetData(read_inventory(&mut bytes)?))
}

fn decode_getaddr(_: &[u8], _: &DecodeContext) -> Result<Message> {
    Ok(Message::GetAddr)
}

fn decode_tx(bytes: &[u8], _: &DecodeContext) -> Result<Message> {
    Ok(Message::Transaction(deserialize(bytes)?))
}

fn decode_block(bytes: &[u8], _: &DecodeContext) -> Result<Message> {
    Ok(Message::Block(deserialize(bytes)?))
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::VerAck => Command::VerAck,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::Addr(_) => Command::Addr,
            Message::Inventory(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::GetAddr => Command::GetAddr,
            Message::Transaction(_) => Command::Tx,
            Message::Block(_) => Command::Block,
            Message::Unknown { command, .. } => Command::Unknown(command.clone()),
        }
    }

    /// Decodes a payload of known length. Unrecognized commands become
    /// [`Message::Unknown`] with the raw payload.
    pub fn decode(command: &str, payload: &[u8], context: &DecodeContext) -> Result<Self> {
        let decoder = DECODERS
            .iter()
            .find(|(known, _)| known.name().eq_ignore_ascii_case(command))
            .map(|(_, decoder)| decoder);

        match decoder {
            Some(decoder) => decoder(payload, context),
            None => Ok(Message::Unknown {
                command: command.to_string(),
                payload: payload.to_vec(),
            }),
        }
    }

    /// Serializes the payload. Fails for [`Message::Unknown`].
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        self.encode(&mut buffer)?;
        Ok(buffer)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Message::Unknown { .. })
    }
}

impl Encodable for Message {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        match self {
            Message::Version(payload) => payload.encode(writer),
            Message::VerAck | Message::GetAddr | Message::Ping(None) => Ok(()),
            Message::Ping(Some(nonce)) | Message::Pong(nonce) => writer.write_u64_le(*nonce),
            Message::Addr(addresses) => write_addresses(writer, addresses),
            Message::Inventory(items) | Message::GetData(items) => items.encode(writer),
            Message::Transaction(tx) => tx.encode(writer),
            Message::Block(block) => block.encode(writer),
            Message::Unknown { command, .. } => Err(BTCNetError::EncodeUnknown(command.clone())),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Version(payload) => write!(f, "version[proto={}]", payload.version),
            Message::Addr(addresses) => write!(f, "addr[count={}]", addresses.len()),
            Message::Inventory(items) => write!(f, "inv[count={}]", items.len()),
            Message::GetData(items) => write!(f, "getdata[count={}]", items.len()),
            Message::Unknown { command, payload } => {
                write!(f, "{}[unknown, {} bytes]", command, payload.len())
            }
            message => write!(f, "{}", message.command()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ServiceFlags;
    use crate::block::BlockHeader;
    use crate::hash::Hash256;
    use crate::payload::InvType;
    use crate::transaction::tests::sample_transaction;
    use quickcheck::{Arbitrary, TestResult};
    use quickcheck_macros::quickcheck;
    use std::net::Ipv4Addr;

    impl Arbitrary for Message {
        fn arbitrary(g: &mut quickcheck::Gen) -> Message {
            match u8::arbitrary(g) % 10 {
                0 => {
                    let mut payload = VersionPayload::arbitrary(g);
                    payload.version = payload.version.max(MIN_PROTOCOL_VERSION);
                    Message::Version(payload)
                }
                1 => Message::VerAck,
                2 => Message::Ping(Option::<u64>::arbitrary(g)),
                3 => Message::Pong(u64::arbitrary(g)),
                4 => Message::Addr(Vec::<PeerAddress>::arbitrary(g)),
                5 => Message::Inventory(Vec::<InventoryItem>::arbitrary(g)),
                6 => Message::GetData(Vec::<InventoryItem>::arbitrary(g)),
                7 => Message::GetAddr,
                8 => Message::Transaction(Transaction::arbitrary(g)),
                9 => Message::Block(Block {
                    header: BlockHeader {
                        version: u32::arbitrary(g),
                        timestamp: u32::arbitrary(g),
                        nonce: u32::arbitrary(g),
                        ..Default::default()
                    },
                    transactions: vec![Transaction::arbitrary(g)],
                }),
                _ => unreachable!(),
            }
        }
    }

    /// Address equality only looks at the endpoint; this also compares what
    /// travels with it. Addresses inside `version` carry no timestamp.
    fn same_address_fields(decoded: &Message, message: &Message) -> bool {
        match (decoded, message) {
            (Message::Addr(decoded), Message::Addr(addresses)) => decoded
                .iter()
                .zip(addresses)
                .all(|(a, b)| a.services() == b.services() && a.last_seen() == b.last_seen()),
            (Message::Version(decoded), Message::Version(payload)) => {
                decoded.my_address.services() == payload.my_address.services()
                    && decoded.your_address.services() == payload.your_address.services()
            }
            _ => true,
        }
    }

    #[quickcheck]
    fn message_round_trip(message: Message) -> TestResult {
        let payload = message.to_payload().unwrap();
        let command = message.command();
        let decoded = Message::decode(command.name(), &payload, &DecodeContext::default()).unwrap();
        TestResult::from_bool(decoded == message && same_address_fields(&decoded, &message))
    }

    #[test]
    fn test_unknown_command_is_kept_verbatim() {
        let message = Message::decode("checkorder", &[1, 2, 3], &DecodeContext::default()).unwrap();
        assert_eq!(
            message,
            Message::Unknown {
                command: "checkorder".to_string(),
                payload: vec![1, 2, 3]
            }
        );
        assert_eq!(message.command(), Command::Unknown("checkorder".to_string()));
    }

    #[test]
    fn test_encoding_unknown_fails() {
        let message = Message::Unknown {
            command: "checkorder".to_string(),
            payload: vec![1, 2, 3],
        };
        assert!(matches!(
            message.to_payload(),
            Err(BTCNetError::EncodeUnknown(command)) if command == "checkorder"
        ));
    }

    #[test]
    fn test_version_below_floor_is_rejected() {
        let payload = VersionPayload::build(
            209,
            ServiceFlags::NODE_NETWORK,
            PeerAddress::unspecified(),
            PeerAddress::unspecified(),
            1,
            "",
            0,
        );
        let bytes = Message::Version(payload).to_payload().unwrap();

        assert!(matches!(
            Message::decode("version", &bytes, &DecodeContext::default()),
            Err(BTCNetError::UnsupportedVersion { version: 209, min: 20900 })
        ));

        let lenient = DecodeContext {
            min_protocol_version: 0,
        };
        assert!(Message::decode("version", &bytes, &lenient).is_ok());
    }

    #[test]
    fn test_version_ignores_trailing_relay_flag() {
        let payload = VersionPayload::build(
            70015,
            ServiceFlags::NODE_NETWORK,
            PeerAddress::new(Ipv4Addr::new(1, 2, 3, 4), 8333, ServiceFlags::NODE_NETWORK),
            PeerAddress::unspecified(),
            42,
            "/Satoshi:25.0.0/",
            820000,
        );
        let mut bytes = Message::Version(payload.clone()).to_payload().unwrap();
        bytes.push(1);

        let decoded = Message::decode("version", &bytes, &DecodeContext::default()).unwrap();
        assert_eq!(decoded, Message::Version(payload));
    }

    #[test]
    fn test_empty_payload_messages() {
        for message in [Message::VerAck, Message::GetAddr, Message::Ping(None)] {
            assert!(message.to_payload().unwrap().is_empty());
        }
        assert_eq!(
            Message::decode("ping", &[], &DecodeContext::default()).unwrap(),
            Message::Ping(None)
        );
    }

    #[test]
    fn test_truncated_inventory_is_error() {
        let items = vec![InventoryItem::new(InvType::Tx, Hash256([7; 32]))];
        let bytes = Message::Inventory(items).to_payload().unwrap();
        assert!(matches!(
            Message::decode("inv", &bytes[..bytes.len() - 1], &DecodeContext::default()),
            Err(BTCNetError::Truncated)
        ));
    }

    #[test]
    fn test_command_lookup_ignores_case() {
        let bytes = Message::Transaction(sample_transaction()).to_payload().unwrap();
        let decoded = Message::decode("TX", &bytes, &DecodeContext::default()).unwrap();
        assert_eq!(decoded, Message::Transaction(sample_transaction()));
    }
}
