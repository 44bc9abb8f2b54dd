//! Single-threaded readiness loop multiplexing every peer connection, plus a
//! [`Handle`] other threads use to talk to it.
//!
//! A handle never touches reactor state directly. Each call appends a change
//! request to a shared queue and wakes the poll; the reactor applies pending
//! requests at the top of its next iteration.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use super::{
    config::Config,
    connection::{lock, Connection, Outbox, ReadOutcome},
    errors::{BTCNetError, Result},
    event::{Event, EventKind, Listener},
    frame::Codec,
    message::Message,
    scheduler::{DeferredTask, Scheduler},
};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

enum ChangeRequest {
    /// Watch a freshly opened outbound stream for connect completion.
    Connect {
        token: Token,
        stream: TcpStream,
        addr: SocketAddr,
    },
    /// Opening the outbound stream failed immediately.
    ConnectFailed {
        token: Token,
        addr: SocketAddr,
        error: std::io::Error,
    },
    /// Messages were queued; watch for write readiness.
    Writable(Token),
    Close(Token),
    Schedule(DeferredTask),
}

#[derive(Default)]
struct Pending {
    changes: Vec<ChangeRequest>,
    /// Deadline the reactor sleeps towards, `None` when nothing is scheduled.
    soonest: Option<Instant>,
}

struct Shared {
    waker: Waker,
    pending: Mutex<Pending>,
    /// Outboxes of every accepted or established connection.
    registry: Mutex<HashMap<Token, Outbox>>,
    next_token: AtomicUsize,
    shutdown: AtomicBool,
}

/// Thread-safe entry point to a running [`Reactor`].
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Queues `message` for the connection `token`.
    pub fn send(&self, token: Token, message: Message) -> Result<()> {
        if let Message::Unknown { command, .. } = &message {
            return Err(BTCNetError::EncodeUnknown(command.clone()));
        }

        let outbox = lock(&self.shared.registry)
            .get(&token)
            .cloned()
            .ok_or(BTCNetError::UnknownConnection(token))?;
        lock(&outbox).push_back(message);

        self.request(ChangeRequest::Writable(token))
    }

    /// Sends `message` to every registered connection except `excluded`.
    /// Returns the number of connections it was queued for.
    pub fn broadcast(&self, message: &Message, excluded: Option<Token>) -> Result<usize> {
        if let Message::Unknown { command, .. } = message {
            return Err(BTCNetError::EncodeUnknown(command.clone()));
        }

        let targets = lock(&self.shared.registry)
            .iter()
            .filter(|(token, _)| Some(**token) != excluded)
            .map(|(token, outbox)| (*token, Arc::clone(outbox)))
            .collect::<Vec<_>>();

        if targets.is_empty() {
            return Ok(0);
        }

        let mut pending = lock(&self.shared.pending);
        for (token, outbox) in &targets {
            lock(outbox).push_back(message.clone());
            pending.changes.push(ChangeRequest::Writable(*token));
        }
        drop(pending);

        self.shared.waker.wake()?;
        Ok(targets.len())
    }

    /// Opens an outbound connection. The outcome arrives later as an
    /// [`EventKind::Established`] or [`EventKind::Failed`] event for the
    /// returned token.
    pub fn connect(&self, addr: SocketAddr) -> Result<Token> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("connecting to {} as {:?}", addr, token);

        let change = match TcpStream::connect(addr) {
            Ok(stream) => ChangeRequest::Connect {
                token,
                stream,
                addr,
            },
            Err(error) => ChangeRequest::ConnectFailed { token, addr, error },
        };
        self.request(change)?;
        Ok(token)
    }

    /// Adds a task to the reactor's scheduler, waking the reactor if the task
    /// is due before the deadline it currently sleeps towards.
    pub fn schedule(&self, task: DeferredTask) -> Result<()> {
        let mut pending = lock(&self.shared.pending);
        let next_run = task.next_run();
        let sooner = pending.soonest.map_or(true, |soonest| next_run < soonest);
        pending.changes.push(ChangeRequest::Schedule(task));
        if sooner {
            pending.soonest = Some(next_run);
        }
        drop(pending);

        if sooner {
            self.shared.waker.wake()?;
        }
        Ok(())
    }

    pub fn disconnect(&self, token: Token) -> Result<()> {
        self.request(ChangeRequest::Close(token))
    }

    /// Stops [`Reactor::run`] at its next iteration.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::Release);
        Ok(self.shared.waker.wake()?)
    }

    pub fn is_connected(&self, token: Token) -> bool {
        lock(&self.shared.registry).contains_key(&token)
    }

    pub fn connections(&self) -> Vec<Token> {
        lock(&self.shared.registry).keys().copied().collect()
    }

    fn request(&self, change: ChangeRequest) -> Result<()> {
        lock(&self.shared.pending).changes.push(change);
        Ok(self.shared.waker.wake()?)
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("connections", &lock(&self.shared.registry).len())
            .finish()
    }
}

struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

/// The event loop. Owns the poll, every connection and the scheduler.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    connections: HashMap<Token, Connection<TcpStream>>,
    connecting: HashMap<Token, (TcpStream, SocketAddr)>,
    scheduler: Scheduler,
    listeners: Vec<Box<dyn Listener>>,
    codec: Codec,
    shared: Arc<Shared>,
}

impl Reactor {
    pub fn new(config: &Config) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let listener = match config.listen {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr)?;
                poll.registry()
                    .register(&mut listener, LISTENER, Interest::READABLE)?;
                tracing::info!("listening on {}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            listener,
            connections: HashMap::new(),
            connecting: HashMap::new(),
            scheduler: Scheduler::new(),
            listeners: Vec::new(),
            codec: config.codec(),
            shared: Arc::new(Shared {
                waker,
                pending: Mutex::new(Pending::default()),
                registry: Mutex::new(HashMap::new()),
                next_token: AtomicUsize::new(FIRST_CONNECTION),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Listeners see events in the order they were added.
    pub fn add_listener<L: Listener + 'static>(&mut self, listener: L) {
        self.listeners.push(Box::new(listener));
    }

    /// Runs until [`Handle::shutdown`] is called, then closes every
    /// connection.
    pub fn run(&mut self) -> Result<()> {
        while !self.shared.shutdown.load(Ordering::Acquire) {
            self.turn()?;
        }

        tracing::info!("reactor shutting down");
        let tokens = self.connections.keys().copied().collect::<Vec<_>>();
        for token in tokens {
            self.disconnect(token, "shutdown");
        }
        for (token, (mut stream, _)) in self.connecting.drain() {
            if let Err(err) = self.poll.registry().deregister(&mut stream) {
                tracing::debug!("deregistering {:?}: {}", token, err);
            }
        }
        Ok(())
    }

    /// One iteration: apply pending changes, run due tasks, wait for
    /// readiness and handle it. Only a failing poll is an error.
    pub fn turn(&mut self) -> Result<()> {
        self.apply_changes();
        self.scheduler.run_due(Instant::now());

        let timeout = self.next_timeout();
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }

        let ready = self
            .events
            .iter()
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
            })
            .collect::<Vec<_>>();

        for readiness in ready {
            match readiness.token {
                LISTENER => self.accept(),
                WAKER => {}
                token if self.connecting.contains_key(&token) => self.finish_connect(token),
                token => {
                    if readiness.readable {
                        self.read(token);
                    }
                    if readiness.writable {
                        self.write(token);
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_changes(&mut self) {
        let changes = std::mem::take(&mut lock(&self.shared.pending).changes);

        for change in changes {
            match change {
                ChangeRequest::Connect {
                    token,
                    mut stream,
                    addr,
                } => {
                    match self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::WRITABLE)
                    {
                        Ok(()) => {
                            self.connecting.insert(token, (stream, addr));
                        }
                        Err(err) => self.connect_failed(token, addr, err.into()),
                    }
                }
                ChangeRequest::ConnectFailed { token, addr, error } => {
                    self.connect_failed(token, addr, error.into())
                }
                ChangeRequest::Writable(token) => self.watch_writes(token),
                ChangeRequest::Close(token) => {
                    if let Some((mut stream, addr)) = self.connecting.remove(&token) {
                        if let Err(err) = self.poll.registry().deregister(&mut stream) {
                            tracing::debug!("deregistering {:?}: {}", token, err);
                        }
                        self.publish(Event::lifecycle(EventKind::Failed, token, addr));
                    } else {
                        self.disconnect(token, "closed locally");
                    }
                }
                ChangeRequest::Schedule(task) => {
                    self.scheduler.schedule(task);
                }
            }
        }
    }

    /// Takes in tasks scheduled while the pass ran and publishes the deadline
    /// the poll is about to sleep towards, under one lock so a concurrent
    /// [`Handle::schedule`] either lands in the scheduler or sees the final
    /// deadline.
    fn next_timeout(&mut self) -> Option<Duration> {
        let mut pending = lock(&self.shared.pending);

        let changes = std::mem::take(&mut pending.changes);
        for change in changes {
            match change {
                ChangeRequest::Schedule(task) => {
                    self.scheduler.schedule(task);
                }
                other => pending.changes.push(other),
            }
        }

        pending.soonest = self.scheduler.soonest();
        self.scheduler.next_delay(Instant::now())
    }

    fn watch_writes(&mut self, token: Token) {
        let Some(connection) = self.connections.get_mut(&token) else {
            tracing::trace!("write interest for gone connection {:?}", token);
            return;
        };

        if let Err(err) = self.poll.registry().reregister(
            connection.stream_mut(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            // the transport closed under us
            tracing::debug!("reregistering {:?}: {}", token, err);
            self.disconnect(token, "reregister failed");
        }
    }

    fn accept(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((mut stream, peer)) => {
                    let token = self.next_token();
                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        tracing::warn!("registering {}: {}", peer, err);
                        continue;
                    }

                    tracing::info!("accepted {} as {:?}", peer, token);
                    self.add_connection(token, stream, peer);
                    self.publish(Event::lifecycle(EventKind::Accepted, token, peer));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!("accept failed: {}", err);
                    return;
                }
            }
        }
    }

    fn finish_connect(&mut self, token: Token) {
        let Some((mut stream, addr)) = self.connecting.remove(&token) else {
            return;
        };

        let error = match stream.take_error() {
            Ok(Some(err)) | Err(err) => Some(err),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => None,
                Err(err)
                    if err.kind() == ErrorKind::NotConnected
                        || err.kind() == ErrorKind::WouldBlock =>
                {
                    // spurious wakeup, still connecting
                    self.connecting.insert(token, (stream, addr));
                    return;
                }
                Err(err) => Some(err),
            },
        };

        if let Some(err) = error {
            if let Err(err) = self.poll.registry().deregister(&mut stream) {
                tracing::debug!("deregistering {:?}: {}", token, err);
            }
            self.connect_failed(token, addr, err.into());
            return;
        }

        if let Err(err) = self
            .poll
            .registry()
            .reregister(&mut stream, token, Interest::READABLE)
        {
            self.connect_failed(token, addr, err.into());
            return;
        }

        tracing::info!("connected to {} as {:?}", addr, token);
        self.add_connection(token, stream, addr);
        self.publish(Event::lifecycle(EventKind::Established, token, addr));
    }

    fn connect_failed(&mut self, token: Token, addr: SocketAddr, err: BTCNetError) {
        tracing::info!("connecting to {} failed: {}", addr, err);
        self.publish(Event::lifecycle(EventKind::Failed, token, addr));
    }

    fn add_connection(&mut self, token: Token, stream: TcpStream, peer: SocketAddr) {
        let connection = Connection::new(stream, peer);
        lock(&self.shared.registry).insert(token, connection.outbox());
        self.connections.insert(token, connection);
    }

    fn read(&mut self, token: Token) {
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };

        let peer = connection.peer();
        let inbound = connection.read_messages(&self.codec);

        for message in inbound.messages {
            tracing::debug!("received {} from {}", message, peer);
            self.publish(Event::message(token, peer, message));
        }

        match inbound.outcome {
            ReadOutcome::Pending => {}
            ReadOutcome::Closed => self.disconnect(token, "closed by peer"),
            ReadOutcome::Failed(err) => {
                tracing::warn!("dropping {}: {}", peer, err);
                self.disconnect(token, "read failed");
            }
        }
    }

    fn write(&mut self, token: Token) {
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };

        let mut sent = Vec::new();
        let flushed = connection.flush(&self.codec, &mut sent);

        let flushed = match flushed {
            // nothing left, stop watching for writes; a later send asks again
            Ok(true) => self
                .poll
                .registry()
                .reregister(connection.stream_mut(), token, Interest::READABLE)
                .map_err(BTCNetError::from),
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        };

        for message in &sent {
            self.publish_sent(token, message);
        }

        if let Err(err) = flushed {
            tracing::warn!("write to {:?} failed: {}", token, err);
            self.disconnect(token, "write failed");
        }
    }

    /// Drops a connection from every map, moves it to its terminal state and
    /// tells the listeners.
    fn disconnect(&mut self, token: Token, reason: &str) {
        let Some(mut connection) = self.connections.remove(&token) else {
            return;
        };

        lock(&self.shared.registry).remove(&token);
        if let Err(err) = self.poll.registry().deregister(connection.stream_mut()) {
            tracing::debug!("deregistering {:?}: {}", token, err);
        }
        connection.shutdown();

        let peer = connection.peer();
        tracing::info!("disconnected {} ({})", peer, reason);
        self.publish(Event::lifecycle(EventKind::Disconnected, token, peer));
    }

    fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn publish(&mut self, event: Event) {
        let handle = self.handle();
        for listener in self.listeners.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(&handle, &event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!("listener failed on {:?}: {:#}", event.kind, err),
                Err(_) => tracing::error!("listener panicked on {:?}", event.kind),
            }
        }
    }

    fn publish_sent(&mut self, token: Token, message: &Message) {
        let handle = self.handle();
        for listener in self.listeners.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_sent(&handle, token, message))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!("listener failed after sending {}: {:#}", message, err),
                Err(_) => tracing::error!("listener panicked after sending {}", message),
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connections.len())
            .field("connecting", &self.connecting.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[cfg(test)]
impl Handle {
    /// Registers a bare outbox under `token`, standing in for a connection.
    pub(crate) fn attach(&self, token: Token) -> Outbox {
        let outbox = Outbox::default();
        lock(&self.shared.registry).insert(token, Arc::clone(&outbox));
        outbox
    }
}
