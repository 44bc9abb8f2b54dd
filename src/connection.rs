use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    errors::{BTCNetError, Result},
    frame::{Codec, FrameDecoder},
    message::Message,
};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Queue of messages waiting to be written to one connection. Producers may
/// live on any thread; only the reactor pops.
pub type Outbox = Arc<Mutex<VecDeque<Message>>>;

/// Locks `mutex`, recovering the guard if a holder panicked. Every structure
/// guarded this way is left consistent between operations.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handshake state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No `verack` sent or received yet, frames carry no checksum.
    #[default]
    Handshaking,
    Open,
    /// Terminal.
    ShutDown,
}

impl ConnectionState {
    pub fn requires_checksum(self) -> bool {
        !matches!(self, ConnectionState::Handshaking)
    }

    /// The state after a `verack` was sent or received.
    pub fn on_verack(self) -> Self {
        match self {
            ConnectionState::Handshaking => ConnectionState::Open,
            state => state,
        }
    }
}

/// How a read pass ended.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The transport has no more bytes for now.
    Pending,
    /// The peer closed the stream.
    Closed,
    Failed(BTCNetError),
}

/// Messages completed by a read pass, in arrival order.
#[derive(Debug)]
pub struct Inbound {
    pub messages: Vec<Message>,
    pub outcome: ReadOutcome,
}

/// One peer connection over a non-blocking transport.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnectionState,
    decoder: FrameDecoder,
    outbox: Outbox,
    write_buf: Vec<u8>,
    written: usize,
    in_flight: Option<Message>,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnectionState::default(),
            decoder: FrameDecoder::new(),
            outbox: Outbox::default(),
            write_buf: Vec::new(),
            written: 0,
            in_flight: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn outbox(&self) -> Outbox {
        Arc::clone(&self.outbox)
    }

    /// Queues a message from the reactor thread itself.
    pub fn enqueue(&self, message: Message) {
        lock(&self.outbox).push_back(message);
    }

    /// Whether a frame is half written or messages are queued.
    pub fn has_pending_writes(&self) -> bool {
        self.written < self.write_buf.len() || !lock(&self.outbox).is_empty()
    }

    /// Reads until the transport would block, decoding every complete frame.
    /// A partial frame stays in the decoder for the next pass.
    pub fn read_messages(&mut self, codec: &Codec) -> Inbound {
        let mut messages = Vec::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let n = match self.stream.read(&mut buf) {
                Ok(0) => {
                    return Inbound {
                        messages,
                        outcome: ReadOutcome::Closed,
                    }
                }
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Inbound {
                        messages,
                        outcome: ReadOutcome::Pending,
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Inbound {
                        messages,
                        outcome: ReadOutcome::Failed(err.into()),
                    }
                }
            };

            let mut input = &buf[..n];
            while !input.is_empty() {
                let checksummed = self.state.requires_checksum();
                let frame = match self.decoder.decode(codec, &mut input, checksummed) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) => {
                        return Inbound {
                            messages,
                            outcome: ReadOutcome::Failed(err),
                        }
                    }
                };

                match codec.decode(frame) {
                    Ok(message) => {
                        tracing::trace!("{} <- {}", self.peer, message);
                        if message == Message::VerAck {
                            self.state = self.state.on_verack();
                        }
                        messages.push(message);
                    }
                    Err(err) => {
                        return Inbound {
                            messages,
                            outcome: ReadOutcome::Failed(err),
                        }
                    }
                }
            }
        }
    }

    /// Writes queued messages until the outbox is empty or the transport
    /// would block. Fully written messages are appended to `sent`.
    ///
    /// Returns whether everything queued was written. A message that cannot
    /// be encoded is dropped with a warning; only transport errors fail.
    pub fn flush(&mut self, codec: &Codec, sent: &mut Vec<Message>) -> Result<bool> {
        loop {
            if self.written == self.write_buf.len() {
                let next = lock(&self.outbox).pop_front();
                let Some(message) = next else {
                    return Ok(true);
                };

                match codec.encode(&message, self.state.requires_checksum()) {
                    Ok(bytes) => {
                        self.write_buf = bytes;
                        self.written = 0;
                    }
                    Err(err) => {
                        tracing::warn!("dropping {} for {}: {}", message, self.peer, err);
                        continue;
                    }
                }

                // the verack frame itself goes out without a checksum
                if message == Message::VerAck {
                    self.state = self.state.on_verack();
                }
                self.in_flight = Some(message);
            }

            match self.stream.write(&self.write_buf[self.written..]) {
                Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.written += n;
                    if self.written == self.write_buf.len() {
                        self.write_buf.clear();
                        self.written = 0;
                        if let Some(message) = self.in_flight.take() {
                            tracing::trace!("{} -> {}", self.peer, message);
                            sent.push(message);
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Moves to the terminal state and drops everything still queued.
    pub fn shutdown(&mut self) {
        self.state = ConnectionState::ShutDown;
        lock(&self.outbox).clear();
        self.write_buf.clear();
        self.written = 0;
        self.in_flight = None;
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("decoder", &self.decoder)
            .finish()
    }
}
