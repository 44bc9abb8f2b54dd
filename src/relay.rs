use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::Token;

use super::{
    config::Config,
    connection::lock,
    event::{Event, Listener},
    message::Message,
    payload::{InvType, InventoryItem, MAX_INV_ITEMS},
    reactor::Handle,
    scheduler::DeferredTask,
};

#[derive(Debug)]
struct Relay {
    /// Remembered transactions and blocks, oldest first.
    order: VecDeque<InventoryItem>,
    store: HashMap<InventoryItem, Message>,
    capacity: usize,
    /// Items waiting to be announced, with the connection they came from.
    unannounced: Vec<(InventoryItem, Token)>,
    interval: Duration,
    last_announce: Option<Instant>,
}

impl Relay {
    fn knows(&self, item: &InventoryItem) -> bool {
        self.store.contains_key(item)
    }

    /// Stores `message` under `item`. Returns false if it was already known.
    fn remember(&mut self, item: InventoryItem, message: Message, origin: Token) -> bool {
        if self.capacity == 0 || self.knows(&item) {
            return false;
        }

        self.store.insert(item, message);
        self.order.push_back(item);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.store.remove(&evicted);
            }
        }
        self.unannounced.push((item, origin));
        true
    }

    /// Broadcasts pending items, grouped by origin and never back to it, at
    /// most once per interval. An `inv` carries at most `MAX_INV_ITEMS`.
    fn announce(&mut self, reactor: &Handle, now: Instant) -> anyhow::Result<()> {
        if self.unannounced.is_empty() {
            return Ok(());
        }
        if let Some(last) = self.last_announce {
            if now.saturating_duration_since(last) < self.interval {
                return Ok(());
            }
        }

        let mut by_origin: HashMap<Token, Vec<InventoryItem>> = HashMap::new();
        for (item, origin) in self.unannounced.drain(..) {
            by_origin.entry(origin).or_default().push(item);
        }
        self.last_announce = Some(now);

        for (origin, items) in by_origin {
            for chunk in items.chunks(MAX_INV_ITEMS as usize) {
                let peers = reactor.broadcast(&Message::Inventory(chunk.to_vec()), Some(origin))?;
                tracing::debug!("announced {} items to {} peers", chunk.len(), peers);
            }
        }
        Ok(())
    }
}

/// Relays transactions and blocks between peers.
///
/// Unknown announced items are requested with `getdata`; received items are
/// remembered (bounded, oldest evicted) and announced to every other peer;
/// `getdata` requests are served from memory.
#[derive(Debug, Clone)]
pub struct InventoryRelay {
    relay: Arc<Mutex<Relay>>,
}

impl InventoryRelay {
    pub fn new(config: &Config) -> Self {
        Self {
            relay: Arc::new(Mutex::new(Relay {
                order: VecDeque::new(),
                store: HashMap::new(),
                capacity: config.relay_memory,
                unannounced: Vec::new(),
                interval: config.relay_interval,
                last_announce: None,
            })),
        }
    }

    pub fn knows(&self, item: &InventoryItem) -> bool {
        lock(&self.relay).knows(item)
    }

    /// Announces pending items if the relay interval has passed.
    pub fn announce(&self, reactor: &Handle) -> anyhow::Result<()> {
        lock(&self.relay).announce(reactor, Instant::now())
    }

    /// A repeating task flushing announcements held back by the interval.
    pub fn announce_task(&self, reactor: Handle) -> DeferredTask {
        let interval = lock(&self.relay).interval;
        let relay = self.clone();
        DeferredTask::repeating(interval, move || relay.announce(&reactor))
    }
}

impl Listener for InventoryRelay {
    fn on_event(&mut self, reactor: &Handle, event: &Event) -> anyhow::Result<()> {
        let mut relay = lock(&self.relay);

        match &event.message {
            Some(Message::Inventory(items)) => {
                let wanted = items
                    .iter()
                    .filter(|item| matches!(item.inv_type, InvType::Tx | InvType::Block))
                    .filter(|item| !relay.knows(item))
                    .copied()
                    .collect::<Vec<_>>();
                if !wanted.is_empty() {
                    reactor.send(event.origin, Message::GetData(wanted))?;
                }
            }
            Some(Message::GetData(items)) => {
                let mut served = HashSet::new();
                for item in items {
                    if !served.insert(*item) {
                        continue;
                    }
                    if let Some(message) = relay.store.get(item) {
                        reactor.send(event.origin, message.clone())?;
                    }
                }
            }
            Some(message @ Message::Transaction(tx)) => {
                let item = InventoryItem::new(InvType::Tx, tx.txid()?);
                relay.remember(item, message.clone(), event.origin);
            }
            Some(message @ Message::Block(block)) => {
                let item = InventoryItem::new(InvType::Block, block.hash()?);
                relay.remember(item, message.clone(), event.origin);
            }
            _ => {}
        }

        relay.announce(reactor, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbox;
    use crate::hash::Hash256;
    use crate::reactor::Reactor;
    use crate::transaction::tests::sample_transaction;
    use std::net::SocketAddr;

    fn config() -> Config {
        Config {
            listen: None,
            ..Config::default()
        }
    }

    fn drain(outbox: &Outbox) -> Vec<Message> {
        lock(outbox).drain(..).collect()
    }

    fn peer() -> SocketAddr {
        "10.0.0.9:8333".parse().unwrap()
    }

    #[test]
    fn test_unknown_inventory_is_requested() {
        let reactor = Reactor::new(&config()).unwrap();
        let handle = reactor.handle();
        let mut relay = InventoryRelay::new(&config());
        let outbox = handle.attach(Token(3));

        let tx = sample_transaction();
        let known = InventoryItem::new(InvType::Tx, tx.txid().unwrap());
        relay
            .on_event(&handle, &Event::message(Token(3), peer(), Message::Transaction(tx)))
            .unwrap();
        assert!(relay.knows(&known));

        let unknown = InventoryItem::new(InvType::Block, Hash256([9; 32]));
        let other = InventoryItem::new(InvType::Other(4), Hash256([8; 32]));
        relay
            .on_event(
                &handle,
                &Event::message(Token(3), peer(), Message::Inventory(vec![known, unknown, other])),
            )
            .unwrap();
        assert_eq!(drain(&outbox), vec![Message::GetData(vec![unknown])]);
    }

    #[test]
    fn test_new_items_are_announced_except_to_origin() {
        let reactor = Reactor::new(&config()).unwrap();
        let handle = reactor.handle();
        let mut relay = InventoryRelay::new(&config());
        let origin = handle.attach(Token(3));
        let other = handle.attach(Token(4));

        let tx = sample_transaction();
        let item = InventoryItem::new(InvType::Tx, tx.txid().unwrap());
        relay
            .on_event(
                &handle,
                &Event::message(Token(3), peer(), Message::Transaction(tx.clone())),
            )
            .unwrap();

        assert!(drain(&origin).is_empty());
        assert_eq!(drain(&other), vec![Message::Inventory(vec![item])]);

        // the same transaction again is not announced twice
        relay
            .on_event(&handle, &Event::message(Token(4), peer(), Message::Transaction(tx)))
            .unwrap();
        assert!(drain(&origin).is_empty());
    }

    #[test]
    fn test_getdata_is_served_from_memory() {
        let reactor = Reactor::new(&config()).unwrap();
        let handle = reactor.handle();
        let mut relay = InventoryRelay::new(&config());
        let outbox = handle.attach(Token(5));

        let tx = sample_transaction();
        let item = InventoryItem::new(InvType::Tx, tx.txid().unwrap());
        relay
            .on_event(
                &handle,
                &Event::message(Token(3), peer(), Message::Transaction(tx.clone())),
            )
            .unwrap();
        drain(&outbox);

        let missing = InventoryItem::new(InvType::Block, Hash256([1; 32]));
        relay
            .on_event(
                &handle,
                &Event::message(Token(5), peer(), Message::GetData(vec![item, item, missing])),
            )
            .unwrap();
        assert_eq!(drain(&outbox), vec![Message::Transaction(tx)]);
    }

    #[test]
    fn test_announcements_are_throttled() {
        let reactor = Reactor::new(&config()).unwrap();
        let handle = reactor.handle();
        let relay = InventoryRelay::new(&config());
        let outbox = handle.attach(Token(4));

        let first = InventoryItem::new(InvType::Tx, Hash256([1; 32]));
        let second = InventoryItem::new(InvType::Tx, Hash256([2; 32]));
        let start = Instant::now();

        let mut state = lock(&relay.relay);
        state.remember(first, Message::GetAddr, Token(3));
        state.announce(&handle, start).unwrap();
        assert_eq!(drain(&outbox), vec![Message::Inventory(vec![first])]);

        state.remember(second, Message::GetAddr, Token(3));
        state.announce(&handle, start + Duration::from_secs(1)).unwrap();
        assert!(drain(&outbox).is_empty());

        state.announce(&handle, start + Duration::from_secs(16)).unwrap();
        assert_eq!(drain(&outbox), vec![Message::Inventory(vec![second])]);
    }

    #[test]
    fn test_large_announcements_are_split() {
        let reactor = Reactor::new(&config()).unwrap();
        let handle = reactor.handle();
        let relay = InventoryRelay::new(&config());
        let outbox = handle.attach(Token(4));

        let total = MAX_INV_ITEMS as usize + 10;
        let mut state = lock(&relay.relay);
        state.unannounced = (0..total)
            .map(|n| {
                let mut hash = [0u8; 32];
                hash[..8].copy_from_slice(&(n as u64).to_le_bytes());
                (InventoryItem::new(InvType::Tx, Hash256(hash)), Token(3))
            })
            .collect();
        state.announce(&handle, Instant::now()).unwrap();

        let sizes = drain(&outbox)
            .iter()
            .map(|message| match message {
                Message::Inventory(items) => items.len(),
                other => panic!("expected inv, got {}", other),
            })
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![MAX_INV_ITEMS as usize, 10]);
    }

    #[test]
    fn test_memory_is_bounded() {
        let relay = InventoryRelay::new(&Config {
            relay_memory: 2,
            ..config()
        });
        let items = (1..=3)
            .map(|n| InventoryItem::new(InvType::Tx, Hash256([n; 32])))
            .collect::<Vec<_>>();

        let mut state = lock(&relay.relay);
        for item in &items {
            assert!(state.remember(*item, Message::GetAddr, Token(3)));
        }
        assert!(!state.knows(&items[0]));
        assert!(state.knows(&items[2]));
        assert_eq!(state.store.len(), 2);
    }
}
