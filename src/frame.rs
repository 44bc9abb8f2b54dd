//! Frame envelope around a message payload.
//!
//! ```text
//! offset  size  field
//! 0       4     magic
//! 4       12    command, zero padded
//! 16      4     payload length, little-endian
//! [20     4     checksum, only once the connection is open]
//! 20/24   N     payload
//! ```

use std::io::Write;

use super::{
    command::{Command, COMMAND_SIZE},
    errors::{BTCNetError, Result},
    hash::checksum,
    message::{DecodeContext, Message, MIN_PROTOCOL_VERSION},
    network::Network,
    wire::{ReadWireExt, WriteWireExt},
};

const MAGIC_SIZE: usize = 4;
const PAYLOAD_LEN_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 4;

/// Header size before the handshake completes.
pub const HEADER_SIZE: usize = MAGIC_SIZE + COMMAND_SIZE + PAYLOAD_LEN_SIZE;

/// Header size once checksums are exchanged.
pub const CHECKSUMMED_HEADER_SIZE: usize = HEADER_SIZE + CHECKSUM_SIZE;

// 32 MB
pub const MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

const HEADER_COMMAND_RANGE: std::ops::Range<usize> = MAGIC_SIZE..MAGIC_SIZE + COMMAND_SIZE;
const HEADER_PAYLOAD_LEN_RANGE: std::ops::Range<usize> = HEADER_COMMAND_RANGE.end..HEADER_SIZE;
const HEADER_CHECKSUM_RANGE: std::ops::Range<usize> = HEADER_SIZE..CHECKSUMMED_HEADER_SIZE;

// Initial capacity of a payload buffer, so a header announcing a large
// payload does not allocate before the bytes arrive.
const PAYLOAD_PREALLOC: usize = 64 * 1024;

fn header_size(checksummed: bool) -> usize {
    if checksummed {
        CHECKSUMMED_HEADER_SIZE
    } else {
        HEADER_SIZE
    }
}

/// Network and limits shared by every connection of a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    pub network: Network,
    pub min_protocol_version: u32,
    pub verify_checksums: bool,
    pub max_payload_size: u32,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Network::MainNet)
    }
}

impl Codec {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            verify_checksums: false,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn context(&self) -> DecodeContext {
        DecodeContext {
            min_protocol_version: self.min_protocol_version,
        }
    }

    /// Encodes `message` into a complete frame. The checksum field is only
    /// written when `checksummed` is set.
    pub fn encode(&self, message: &Message, checksummed: bool) -> Result<Vec<u8>> {
        let payload = message.to_payload()?;
        let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if size > self.max_payload_size {
            return Err(BTCNetError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            });
        }

        let mut buffer = Vec::with_capacity(header_size(checksummed) + payload.len());

        // start string char[4]
        buffer.write_all(&self.network.magic())?;

        // command name char[12]
        buffer.write_all(&message.command().to_bytes()?)?;

        // payload length uint32 (4 bytes)
        buffer.write_u32_le(size)?;

        // checksum char[4]
        if checksummed {
            buffer.write_all(&checksum(&payload))?;
        }

        // payload char[..] (variable length)
        buffer.write_all(&payload)?;

        Ok(buffer)
    }

    /// Turns a reassembled frame into a message, verifying the checksum first
    /// when verification is enabled.
    pub fn decode(&self, frame: RawFrame) -> Result<Message> {
        if self.verify_checksums {
            if let Some(expected) = frame.checksum {
                let got = checksum(&frame.payload);
                if got != expected {
                    return Err(BTCNetError::InvalidChecksum { expected, got });
                }
            }
        }

        Message::decode(frame.command.name(), &frame.payload, &self.context())
    }

    fn check_magic(&self, magic: &[u8]) -> Result<()> {
        let expected = self.network.magic();
        if magic == expected {
            return Ok(());
        }

        match Network::from_magic(magic) {
            Ok(got) => Err(BTCNetError::WrongNetwork {
                expected: self.network,
                got,
            }),
            Err(_) => {
                let mut got = [0u8; MAGIC_SIZE];
                got.copy_from_slice(magic);
                Err(BTCNetError::Desync { expected, got })
            }
        }
    }
}

/// A complete frame whose payload has not been decoded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Command,
    pub checksum: Option<[u8; CHECKSUM_SIZE]>,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
enum DecodeState {
    ReadingHeader {
        header: [u8; CHECKSUMMED_HEADER_SIZE],
        filled: usize,
    },
    ReadingPayload {
        command: Command,
        checksum: Option<[u8; CHECKSUM_SIZE]>,
        payload: Vec<u8>,
        expected: usize,
    },
}

impl Default for DecodeState {
    fn default() -> Self {
        DecodeState::ReadingHeader {
            header: [0u8; CHECKSUMMED_HEADER_SIZE],
            filled: 0,
        }
    }
}

/// Reassembles frames from a byte stream delivered in arbitrary pieces.
///
/// At most one partially read frame is held. Bytes already consumed are never
/// read again; the decoder simply resumes filling the header or the payload.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: DecodeState,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes bytes from the front of `input` and returns the first frame
    /// they complete, if any. Bytes after that frame are left in `input`.
    ///
    /// `checksummed` is read when the header reaches its 20th byte, so a
    /// connection that opens between two frames gets the right header size
    /// for the next one.
    ///
    /// After an error the decoder is reset and the stream is unusable.
    pub fn decode(
        &mut self,
        codec: &Codec,
        input: &mut &[u8],
        checksummed: bool,
    ) -> Result<Option<RawFrame>> {
        loop {
            self.state = match std::mem::take(&mut self.state) {
                DecodeState::ReadingHeader { mut header, filled } => {
                    let needed = header_size(checksummed).max(filled);
                    let filled = filled + fill(&mut header[filled..needed], input);

                    if filled >= MAGIC_SIZE {
                        codec.check_magic(&header[..MAGIC_SIZE])?;
                    }
                    if filled < needed {
                        self.state = DecodeState::ReadingHeader { header, filled };
                        return Ok(None);
                    }

                    parse_header(codec, &header[..needed])?
                }
                DecodeState::ReadingPayload {
                    command,
                    checksum,
                    mut payload,
                    expected,
                } => {
                    let source: &[u8] = *input;
                    let take = (expected - payload.len()).min(source.len());
                    let (head, tail) = source.split_at(take);
                    payload.extend_from_slice(head);
                    *input = tail;

                    if payload.len() < expected {
                        self.state = DecodeState::ReadingPayload {
                            command,
                            checksum,
                            payload,
                            expected,
                        };
                        return Ok(None);
                    }

                    tracing::trace!("reassembled {} frame of {} bytes", command, expected);
                    return Ok(Some(RawFrame {
                        command,
                        checksum,
                        payload,
                    }));
                }
            }
        }
    }

    /// Whether a frame is partially read.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::ReadingHeader { filled: 0, .. })
    }
}

fn fill(dest: &mut [u8], input: &mut &[u8]) -> usize {
    let source: &[u8] = *input;
    let n = dest.len().min(source.len());
    let (head, tail) = source.split_at(n);
    dest[..n].copy_from_slice(head);
    *input = tail;
    n
}

fn parse_header(codec: &Codec, header: &[u8]) -> Result<DecodeState> {
    let command = Command::from_bytes(&header[HEADER_COMMAND_RANGE])?;

    let size = (&header[HEADER_PAYLOAD_LEN_RANGE]).read_u32_le()?;
    if size > codec.max_payload_size {
        return Err(BTCNetError::PayloadTooLarge {
            size,
            max: codec.max_payload_size,
        });
    }

    let checksum = if header.len() == CHECKSUMMED_HEADER_SIZE {
        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&header[HEADER_CHECKSUM_RANGE]);
        Some(checksum)
    } else {
        None
    };

    let expected = size as usize;
    Ok(DecodeState::ReadingPayload {
        command,
        checksum,
        payload: Vec::with_capacity(expected.min(PAYLOAD_PREALLOC)),
        expected,
    })
}
