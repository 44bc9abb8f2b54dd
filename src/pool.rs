use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use mio::Token;

use super::{
    address::PeerAddress,
    config::Config,
    connection::lock,
    event::{Event, EventKind, Listener},
    message::Message,
    payload::MAX_ADDRESSES,
    reactor::Handle,
    scheduler::DeferredTask,
};

/// Addresses in insertion order, one entry per endpoint, oldest evicted
/// above the cap.
#[derive(Debug)]
struct AddressBook {
    order: VecDeque<PeerAddress>,
    index: HashSet<PeerAddress>,
    capacity: usize,
}

impl AddressBook {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            index: HashSet::new(),
            capacity,
        }
    }

    /// Returns whether the address was new, and the address evicted to make
    /// room for it.
    fn insert(&mut self, address: PeerAddress) -> (bool, Option<PeerAddress>) {
        if self.capacity == 0 || !self.index.insert(address) {
            return (false, None);
        }

        self.order.push_back(address);
        let mut evicted = None;
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        (true, evicted)
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn iter(&self) -> impl Iterator<Item = &PeerAddress> {
        self.order.iter()
    }
}

#[derive(Debug)]
struct Pool {
    addresses: AddressBook,
    connected: HashMap<Token, SocketAddr>,
    connecting: HashMap<Token, SocketAddr>,
    /// Dialed addresses still in the book, never dialed again.
    attempted: HashSet<SocketAddr>,
    target: usize,
    connect_interval: Duration,
    last_attempt: Option<Instant>,
}

impl Pool {
    fn remember(&mut self, address: PeerAddress) -> bool {
        let (added, evicted) = self.addresses.insert(address);
        if let Some(evicted) = evicted {
            self.attempted.remove(&evicted.socket_addr());
        }
        added
    }

    fn is_busy(&self, addr: &SocketAddr) -> bool {
        self.attempted.contains(addr)
            || self.connected.values().any(|peer| peer == addr)
            || self.connecting.values().any(|peer| peer == addr)
    }

    fn next_candidate(&self) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .map(PeerAddress::socket_addr)
            .find(|addr| !addr.ip().is_unspecified() && addr.port() != 0 && !self.is_busy(addr))
    }

    /// Opens at most one outbound connection per interval while below the
    /// target.
    fn maintain(&mut self, reactor: &Handle, now: Instant) -> anyhow::Result<()> {
        if self.connected.len() + self.connecting.len() >= self.target {
            return Ok(());
        }
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) < self.connect_interval {
                return Ok(());
            }
        }

        let Some(addr) = self.next_candidate() else {
            return Ok(());
        };

        self.last_attempt = Some(now);
        self.attempted.insert(addr);
        let token = reactor.connect(addr)?;
        self.connecting.insert(token, addr);
        tracing::debug!(
            "pool: {} connected, dialing {}",
            self.connected.len(),
            addr
        );
        Ok(())
    }

    fn known(&self) -> Vec<PeerAddress> {
        let now = unix_time();
        self.addresses
            .iter()
            .take(MAX_ADDRESSES as usize)
            .map(|address| {
                if address.last_seen() == 0 {
                    address.with_last_seen(now)
                } else {
                    *address
                }
            })
            .collect()
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or_default()
}

/// Keeps the node connected to a target number of peers.
///
/// Harvests `addr` messages into a bounded address book, answers `getaddr`,
/// asks every peer that completes the handshake for addresses and dials
/// known addresses while below the target. Cloning shares the state, so a
/// clone can be handed to [`PoolMaintainer::maintenance_task`] while another
/// is registered as a listener.
#[derive(Debug, Clone)]
pub struct PoolMaintainer {
    pool: Arc<Mutex<Pool>>,
}

impl PoolMaintainer {
    pub fn new(config: &Config) -> Self {
        Self {
            pool: Arc::new(Mutex::new(Pool {
                addresses: AddressBook::new(config.max_known_addresses),
                connected: HashMap::new(),
                connecting: HashMap::new(),
                attempted: HashSet::new(),
                target: config.target_connections,
                connect_interval: config.connect_interval,
                last_attempt: None,
            })),
        }
    }

    /// Adds an address to dial, e.g. a seed.
    pub fn add_address(&self, address: PeerAddress) -> bool {
        lock(&self.pool).remember(address)
    }

    pub fn known_addresses(&self) -> Vec<PeerAddress> {
        lock(&self.pool).addresses.iter().copied().collect()
    }

    pub fn connected(&self) -> Vec<SocketAddr> {
        lock(&self.pool).connected.values().copied().collect()
    }

    /// Dials a known address if below target, at most once per connect
    /// interval.
    pub fn maintain(&self, reactor: &Handle) -> anyhow::Result<()> {
        lock(&self.pool).maintain(reactor, Instant::now())
    }

    /// A repeating task calling [`PoolMaintainer::maintain`], so the pool
    /// keeps dialing when no events arrive.
    pub fn maintenance_task(&self, reactor: Handle) -> DeferredTask {
        let interval = lock(&self.pool).connect_interval;
        let maintainer = self.clone();
        DeferredTask::repeating(interval, move || maintainer.maintain(&reactor))
    }

    /// A repeating task asking every connected peer for addresses.
    pub fn getaddr_task(reactor: Handle, interval: Duration) -> DeferredTask {
        DeferredTask::repeating(interval, move || {
            let peers = reactor.broadcast(&Message::GetAddr, None)?;
            tracing::debug!("asked {} peers for addresses", peers);
            Ok(())
        })
    }
}

impl Listener for PoolMaintainer {
    fn on_event(&mut self, reactor: &Handle, event: &Event) -> anyhow::Result<()> {
        let mut pool = lock(&self.pool);

        match (event.kind, &event.message) {
            (EventKind::Accepted | EventKind::Established, _) => {
                pool.connecting.remove(&event.origin);
                pool.connected.insert(event.origin, event.peer);
            }
            (EventKind::Failed | EventKind::Disconnected, _) => {
                pool.connecting.remove(&event.origin);
                pool.connected.remove(&event.origin);
            }
            (_, Some(Message::VerAck)) => {
                reactor.send(event.origin, Message::GetAddr)?;
            }
            (_, Some(Message::Addr(addresses))) => {
                let added = addresses
                    .iter()
                    .filter(|address| pool.remember(**address))
                    .count();
                tracing::debug!(
                    "{} new of {} addresses from {}, {} known",
                    added,
                    addresses.len(),
                    event.peer,
                    pool.addresses.len()
                );
            }
            (_, Some(Message::GetAddr)) => {
                let known = pool.known();
                if !known.is_empty() {
                    reactor.send(event.origin, Message::Addr(known))?;
                }
            }
            _ => {}
        }

        pool.maintain(reactor, Instant::now())
    }
}
