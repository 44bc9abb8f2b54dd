use std::net::SocketAddr;

use mio::Token;

use super::{message::Message, reactor::Handle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An inbound connection was accepted.
    Accepted,
    /// An outbound connection completed.
    Established,
    /// An outbound connection never completed.
    Failed,
    /// A connection that was accepted or established is gone.
    Disconnected,
    Version,
    VerAck,
    Ping,
    Pong,
    Addr,
    Inventory,
    GetData,
    GetAddr,
    Transaction,
    Block,
    Unknown,
}

impl EventKind {
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            EventKind::Accepted
                | EventKind::Established
                | EventKind::Failed
                | EventKind::Disconnected
        )
    }
}

impl From<&Message> for EventKind {
    fn from(message: &Message) -> Self {
        match message {
            Message::Version(_) => EventKind::Version,
            Message::VerAck => EventKind::VerAck,
            Message::Ping(_) => EventKind::Ping,
            Message::Pong(_) => EventKind::Pong,
            Message::Addr(_) => EventKind::Addr,
            Message::Inventory(_) => EventKind::Inventory,
            Message::GetData(_) => EventKind::GetData,
            Message::GetAddr => EventKind::GetAddr,
            Message::Transaction(_) => EventKind::Transaction,
            Message::Block(_) => EventKind::Block,
            Message::Unknown { .. } => EventKind::Unknown,
        }
    }
}

/// Something that happened on a connection.
///
/// `origin` identifies the connection only for routing replies through
/// [`Handle::send`]; the connection may already be gone when it is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub origin: Token,
    pub peer: SocketAddr,
    pub message: Option<Message>,
}

impl Event {
    pub fn lifecycle(kind: EventKind, origin: Token, peer: SocketAddr) -> Self {
        Self {
            kind,
            origin,
            peer,
            message: None,
        }
    }

    pub fn message(origin: Token, peer: SocketAddr, message: Message) -> Self {
        Self {
            kind: EventKind::from(&message),
            origin,
            peer,
            message: Some(message),
        }
    }
}

/// Receives events on the reactor thread. Implementations must not block;
/// errors and panics are logged by the reactor and do not reach other
/// listeners.
pub trait Listener: Send {
    fn on_event(&mut self, reactor: &Handle, event: &Event) -> anyhow::Result<()>;

    /// Called once `message` has been completely written to `origin`.
    fn on_sent(&mut self, _reactor: &Handle, _origin: Token, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_event_kind() {
        let peer = "10.0.0.1:8333".parse().unwrap();
        let event = Event::message(Token(7), peer, Message::Pong(1));
        assert_eq!(event.kind, EventKind::Pong);
        assert!(!event.kind.is_lifecycle());

        let event = Event::lifecycle(EventKind::Failed, Token(7), peer);
        assert!(event.kind.is_lifecycle());
        assert_eq!(event.message, None);
    }
}
