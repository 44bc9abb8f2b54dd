// #![warn(unused_crate_dependencies)]
// #![deny(unused_must_use, rust_2018_idioms)]

//! Bitcoin p2p network engine
//!
//! This crate provides the Bitcoin wire codec, resumable message framing and a
//! non-blocking reactor multiplexing many peer connections, with listeners for
//! the handshake, address pool and inventory relay.

mod address;
mod block;
mod command;
mod config;
mod connection;
mod encode;
mod errors;
mod event;
mod frame;
mod handshake;
mod hash;
mod message;
mod network;
mod payload;
mod pool;
mod reactor;
mod relay;
mod scheduler;
mod transaction;
mod wire;

pub use address::{PeerAddress, ServiceFlags, ADDRESS_SIZE};
pub use block::{Block, BlockHeader};
pub use command::Command;
pub use config::Config;
pub use connection::{Connection, ConnectionState, Inbound, Outbox, ReadOutcome};
pub use encode::{deserialize, serialize, Decodable, Encodable};
pub use errors::{BTCNetError, Result};
pub use event::{Event, EventKind, Listener};
pub use frame::{Codec, FrameDecoder, RawFrame, CHECKSUMMED_HEADER_SIZE, HEADER_SIZE};
pub use handshake::HandshakeResponder;
pub use hash::{checksum, double_sha256, Hash256};
pub use message::{DecodeContext, Message, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use mio::Token;
pub use network::Network;
pub use payload::{InvType, InventoryItem, VersionPayload};
pub use pool::PoolMaintainer;
pub use reactor::{Handle, Reactor};
pub use relay::InventoryRelay;
pub use scheduler::{DeferredTask, Scheduler};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};
pub use wire::{ReadWireExt, WriteWireExt};
