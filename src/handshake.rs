use std::collections::HashSet;
use std::net::SocketAddr;

use mio::Token;

use super::{
    address::{PeerAddress, ServiceFlags},
    config::Config,
    event::{Event, EventKind, Listener},
    message::Message,
    payload::VersionPayload,
    reactor::Handle,
};

/// Drives the `version` / `verack` exchange and answers pings.
///
/// Outbound connections get our `version` as soon as they are established.
/// On inbound connections a received `version` is answered with ours and a
/// `verack`, and the connection opens once that `verack` is encoded.
///
/// On outbound connections our `verack` waits for the peer's `version` and
/// `verack`. The peer's `verack` opens the connection, so ours goes out
/// checksummed, matching what the peer expects after sending its own.
#[derive(Debug)]
pub struct HandshakeResponder {
    protocol_version: u32,
    services: ServiceFlags,
    user_agent: String,
    local: Option<SocketAddr>,
    nonce: u64,
    version_sent: HashSet<Token>,
    outbound: HashSet<Token>,
    /// Outbound connections whose peer sent its `version`.
    versioned: HashSet<Token>,
    /// Outbound connections whose peer sent its `verack`.
    acked: HashSet<Token>,
}

impl HandshakeResponder {
    pub fn new(config: &Config) -> Self {
        Self {
            protocol_version: config.protocol_version,
            services: config.services,
            user_agent: config.user_agent.clone(),
            local: config.listen,
            nonce: rand::random(),
            version_sent: HashSet::new(),
            outbound: HashSet::new(),
            versioned: HashSet::new(),
            acked: HashSet::new(),
        }
    }

    /// Nonce carried by our `version` messages.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    fn version(&self, my_address: PeerAddress, your_address: PeerAddress) -> Message {
        Message::Version(VersionPayload::build(
            self.protocol_version,
            self.services,
            my_address,
            your_address,
            self.nonce,
            &self.user_agent,
            0,
        ))
    }

    fn send_version(
        &mut self,
        reactor: &Handle,
        origin: Token,
        my_address: PeerAddress,
        your_address: PeerAddress,
    ) -> anyhow::Result<()> {
        if self.version_sent.insert(origin) {
            reactor.send(origin, self.version(my_address, your_address))?;
        }
        Ok(())
    }

    /// Sends our `verack` on an outbound connection once the peer has sent
    /// both its `version` and its `verack`.
    fn acknowledge_outbound(&mut self, reactor: &Handle, origin: Token) -> anyhow::Result<()> {
        if self.versioned.contains(&origin) && self.acked.remove(&origin) {
            self.versioned.remove(&origin);
            reactor.send(origin, Message::VerAck)?;
        }
        Ok(())
    }

    fn local_address(&self) -> PeerAddress {
        match self.local {
            Some(addr) => PeerAddress::from_socket_addr(addr, self.services),
            None => PeerAddress::unspecified(),
        }
    }
}

impl Listener for HandshakeResponder {
    fn on_event(&mut self, reactor: &Handle, event: &Event) -> anyhow::Result<()> {
        match (event.kind, &event.message) {
            (EventKind::Established, _) => {
                self.outbound.insert(event.origin);
                let peer = PeerAddress::from_socket_addr(event.peer, ServiceFlags::UNNAMED);
                let local = self.local_address();
                self.send_version(reactor, event.origin, local, peer)?;
            }
            (_, Some(Message::Version(theirs))) => {
                if theirs.nonce == self.nonce {
                    tracing::warn!("{} is ourselves, disconnecting", event.peer);
                    reactor.disconnect(event.origin)?;
                    return Ok(());
                }

                tracing::debug!(
                    "{} speaks version {} ({})",
                    event.peer,
                    theirs.version,
                    theirs.user_agent
                );

                // their view of the two ends, swapped
                self.send_version(
                    reactor,
                    event.origin,
                    theirs.your_address,
                    theirs.my_address,
                )?;

                if self.outbound.contains(&event.origin) {
                    self.versioned.insert(event.origin);
                    self.acknowledge_outbound(reactor, event.origin)?;
                } else {
                    reactor.send(event.origin, Message::VerAck)?;
                }
            }
            (_, Some(Message::VerAck)) => {
                if self.outbound.contains(&event.origin) {
                    self.acked.insert(event.origin);
                    self.acknowledge_outbound(reactor, event.origin)?;
                }
            }
            (_, Some(Message::Ping(Some(nonce)))) => {
                reactor.send(event.origin, Message::Pong(*nonce))?;
            }
            (EventKind::Disconnected | EventKind::Failed, _) => {
                self.version_sent.remove(&event.origin);
                self.outbound.remove(&event.origin);
                self.versioned.remove(&event.origin);
                self.acked.remove(&event.origin);
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{lock, Outbox};
    use crate::reactor::Reactor;
    use std::net::Ipv4Addr;

    fn setup() -> (Reactor, Handle, HandshakeResponder) {
        let config = Config {
            listen: None,
            ..Config::default()
        };
        let reactor = Reactor::new(&config).unwrap();
        let handle = reactor.handle();
        (reactor, handle, HandshakeResponder::new(&config))
    }

    fn drain(outbox: &Outbox) -> Vec<Message> {
        lock(outbox).drain(..).collect()
    }

    fn their_version(nonce: u64) -> Message {
        Message::Version(VersionPayload::build(
            31800,
            ServiceFlags::NODE_NETWORK,
            PeerAddress::new(Ipv4Addr::new(10, 0, 0, 2), 8333, ServiceFlags::NODE_NETWORK),
            PeerAddress::new(Ipv4Addr::new(10, 0, 0, 1), 40000, ServiceFlags::UNNAMED),
            nonce,
            "/Satoshi:0.3.18/",
            100,
        ))
    }

    #[test]
    fn test_inbound_handshake() {
        let (_reactor, handle, mut responder) = setup();
        let origin = Token(3);
        let outbox = handle.attach(origin);
        let peer = "10.0.0.2:8333".parse().unwrap();

        responder
            .on_event(&handle, &Event::lifecycle(EventKind::Accepted, origin, peer))
            .unwrap();
        assert!(drain(&outbox).is_empty());

        responder
            .on_event(&handle, &Event::message(origin, peer, their_version(1)))
            .unwrap();
        let sent = drain(&outbox);
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            Message::Version(ours) => {
                assert_eq!(ours.nonce, responder.nonce());
                assert_eq!(ours.version, 31700);
                assert_eq!(ours.my_address.ip(), Ipv4Addr::new(10, 0, 0, 1));
                assert_eq!(ours.your_address.ip(), Ipv4Addr::new(10, 0, 0, 2));
            }
            other => panic!("expected version, got {}", other),
        }
        assert_eq!(sent[1], Message::VerAck);
    }

    #[test]
    fn test_outbound_verack_waits_for_theirs() {
        let (_reactor, handle, mut responder) = setup();
        let origin = Token(4);
        let outbox = handle.attach(origin);
        let peer = "10.0.0.2:8333".parse().unwrap();

        responder
            .on_event(&handle, &Event::lifecycle(EventKind::Established, origin, peer))
            .unwrap();
        let sent = drain(&outbox);
        assert!(matches!(sent.as_slice(), [Message::Version(_)]));

        // no second version, and no verack before theirs
        responder
            .on_event(&handle, &Event::message(origin, peer, their_version(1)))
            .unwrap();
        assert!(drain(&outbox).is_empty());

        responder
            .on_event(&handle, &Event::message(origin, peer, Message::VerAck))
            .unwrap();
        assert_eq!(drain(&outbox), vec![Message::VerAck]);

        // a repeated verack is not answered again
        responder
            .on_event(&handle, &Event::message(origin, peer, Message::VerAck))
            .unwrap();
        assert!(drain(&outbox).is_empty());
    }

    #[test]
    fn test_outbound_verack_before_version() {
        let (_reactor, handle, mut responder) = setup();
        let origin = Token(4);
        let outbox = handle.attach(origin);
        let peer = "10.0.0.2:8333".parse().unwrap();

        responder
            .on_event(&handle, &Event::lifecycle(EventKind::Established, origin, peer))
            .unwrap();
        drain(&outbox);

        responder
            .on_event(&handle, &Event::message(origin, peer, Message::VerAck))
            .unwrap();
        assert!(drain(&outbox).is_empty());

        responder
            .on_event(&handle, &Event::message(origin, peer, their_version(1)))
            .unwrap();
        assert_eq!(drain(&outbox), vec![Message::VerAck]);
    }

    #[test]
    fn test_inbound_verack_is_not_answered() {
        let (_reactor, handle, mut responder) = setup();
        let origin = Token(3);
        let outbox = handle.attach(origin);
        let peer = "10.0.0.2:8333".parse().unwrap();

        responder
            .on_event(&handle, &Event::message(origin, peer, their_version(1)))
            .unwrap();
        drain(&outbox);

        responder
            .on_event(&handle, &Event::message(origin, peer, Message::VerAck))
            .unwrap();
        assert!(drain(&outbox).is_empty());
    }

    #[test]
    fn test_connection_to_self_is_dropped() {
        let (_reactor, handle, mut responder) = setup();
        let origin = Token(5);
        let outbox = handle.attach(origin);
        let peer = "127.0.0.1:8333".parse().unwrap();
        let nonce = responder.nonce();

        responder
            .on_event(&handle, &Event::message(origin, peer, their_version(nonce)))
            .unwrap();
        assert!(drain(&outbox).is_empty());
    }

    #[test]
    fn test_ping_gets_pong() {
        let (_reactor, handle, mut responder) = setup();
        let origin = Token(6);
        let outbox = handle.attach(origin);
        let peer = "10.0.0.2:8333".parse().unwrap();

        responder
            .on_event(&handle, &Event::message(origin, peer, Message::Ping(Some(77))))
            .unwrap();
        responder
            .on_event(&handle, &Event::message(origin, peer, Message::Ping(None)))
            .unwrap();
        assert_eq!(drain(&outbox), vec![Message::Pong(77)]);
    }
}
