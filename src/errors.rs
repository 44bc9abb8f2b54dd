use mio::Token;
use thiserror::Error;

use super::network::Network;

pub type Result<T> = std::result::Result<T, BTCNetError>;

///! BTCNetError represents an error in the wire codec or in the reactor
#[derive(Debug, Error)]
pub enum BTCNetError {
    #[error("Unknown network")]
    UnknownNetwork,

    #[error("Stream desynchronized: expected magic {expected:02x?}, got {got:02x?}")]
    Desync { expected: [u8; 4], got: [u8; 4] },

    #[error("Peer speaks {got:?}, expected {expected:?}")]
    WrongNetwork { expected: Network, got: Network },

    #[error("Failed to read or write buffer")]
    BufferIOError(std::io::Error),

    #[error("Truncated input, fewer bytes available than declared")]
    Truncated,

    #[error("Payload of {size} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("Invalid checksum: expected {expected:02x?}, got {got:02x?}")]
    InvalidChecksum { expected: [u8; 4], got: [u8; 4] },

    #[error("Invalid command {0:?}")]
    InvalidCommand(String),

    #[error("Failed to decode command")]
    DecodeCommandError(#[from] std::string::FromUtf8Error),

    #[error("Unsupported protocol version {version}, minimum is {min}")]
    UnsupportedVersion { version: u32, min: u32 },

    #[error("Variable length integer {0} needs the 8 byte form")]
    VarIntTooLarge(u64),

    #[error("Count of {count} exceeds the limit of {max}")]
    OversizedCount { count: u64, max: u64 },

    #[error("Refusing to encode unknown message {0:?}")]
    EncodeUnknown(String),

    #[error("Connection {0:?} is not registered")]
    UnknownConnection(Token),
}

impl From<std::io::Error> for BTCNetError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => BTCNetError::Truncated,
            _ => BTCNetError::BufferIOError(err),
        }
    }
}
