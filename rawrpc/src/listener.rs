//! The listening side: accept loop, connection table, lifecycle.
//!
//! ```text
//!                 +-----------+
//!   accept  ----->| rawrpc-a  |  one permit per live connection
//!                 +-----+-----+
//!                       | round robin
//!          +------------+------------+
//!          V            V            V
//!     +---------+  +---------+  +---------+
//!     |rawrpc-r0|  |rawrpc-r1|  |   ...   |  read, frame, handle
//!     +----+----+  +----+----+  +----+----+
//!          |            |            |
//!          +------------+------------+
//!                       | packages, FIFO
//!                 +-----V-----+
//!                 | rawrpc-s  |  the only writer of every socket
//!                 +-----------+
//! ```
//!
//! `stop()` refuses new accepts, closes every connection, discards queued
//! packages and releases the pools. A stopped listener cannot be restarted;
//! create a new one on the same address instead.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;
use crate::connection::{CloseKind, Connection, ConnectionInfo};
use crate::error::{Error, Result};
use crate::frame::FrameDecoder;
use crate::macros::{debug, error, info, warn};
use crate::poll::{Entry, Port, Worker};
use crate::pool::{self, Pool, PoolStats};
use crate::semaphore::{Permit, Semaphore};
use crate::send_queue::{self, Package, SendQueue};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

// pause after a failed accept, which is usually fd exhaustion
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped = 0,
    Starting = 1,
    Accepting = 2,
    Stopping = 3,
}

impl ListenerState {
    fn from_u8(n: u8) -> Self {
        match n {
            1 => Self::Starting,
            2 => Self::Accepting,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Lifecycle and traffic notifications.
///
/// Called synchronously on the I/O threads, so implementations must return
/// quickly. All methods default to doing nothing.
#[allow(unused_variables)]
pub trait Observer: Send + Sync {
    fn server_starting(&self) {}
    fn server_started(&self, addr: SocketAddr) {}
    fn server_stopping(&self) {}
    fn server_stopped(&self) {}

    fn connection_created(&self, info: &ConnectionInfo) {}
    /// Setup of an accepted connection failed.
    fn connection_aborted(&self, info: &ConnectionInfo) {}
    fn connection_closed(&self, info: &ConnectionInfo) {}

    fn message_received(&self, conn: &Connection, body: &[u8]) {}
    fn message_sending(&self, conn: &Connection, len: usize) {}
    fn message_sent(&self, conn: &Connection, len: usize) {}
    /// A queued message was discarded: its connection closed or the
    /// listener stopped before it was written.
    fn message_dropped(&self, conn: &Connection, len: usize) {}
}

/// Consumer of inbound frame bodies.
///
/// Runs on a receive worker. An error closes the connection.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, conn: &Arc<Connection>, body: &[u8]) -> Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Arc<Connection>, &[u8]) -> Result<()> + Send + Sync + 'static,
{
    fn on_message(&self, conn: &Arc<Connection>, body: &[u8]) -> Result<()> {
        self(conn, body)
    }
}

/// State reachable from every listener thread and connection.
pub(crate) struct Shared {
    pub(crate) config: Config,
    state: AtomicU8,
    shutdown: AtomicBool,
    next_id: AtomicU64,
    // the accept thread holds a permit while it waits for a client
    accept_reserved: AtomicBool,
    pub(crate) connections: DashMap<u64, Arc<Connection>>,
    permits: Semaphore,
    pub(crate) recv_pool: Pool<Vec<u8>>,
    pub(crate) send_pool: Pool<Vec<u8>>,
    pub(crate) queue: SendQueue,
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    pub(crate) handler: Box<dyn MessageHandler>,
}

impl Shared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ListenerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn notify<F: Fn(&dyn Observer)>(&self, f: F) {
        for o in self.observers.read().iter() {
            f(o.as_ref());
        }
    }

    pub(crate) fn message_dropped(&self, package: &Package) {
        let len = package.payload.len();
        debug!("connection {}: dropped {} bytes", package.connection.id(), len);
        self.notify(|o| o.message_dropped(&package.connection, len));
    }

    pub(crate) fn connection_finished(&self, conn: &Connection, kind: CloseKind) {
        let info = conn.info();
        match kind {
            CloseKind::Closed => self.notify(|o| o.connection_closed(&info)),
            CloseKind::Aborted => self.notify(|o| o.connection_aborted(&info)),
        }
    }

    fn setup_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        permit: Permit,
        port: &Port,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("connection {}: set_nodelay: {}", id, e);
        }
        let conn = Arc::new(Connection::new(
            id,
            peer,
            stream,
            Arc::downgrade(self),
            self.config.write_timeout,
        ));

        // a free permit means a free buffer: both are released by the
        // same entry drop, buffer first
        let Some(buf) = self.recv_pool.try_rent() else {
            warn!("connection {}: no receive buffer", id);
            conn.abort();
            return;
        };

        self.connections.insert(id, conn.clone());
        debug!("connection {} from {}", id, peer);
        self.notify(|o| o.connection_created(&conn.info()));

        let decoder = FrameDecoder::new(buf, self.config.max_frame_size);
        if let Err(entry) = port.hand_off(Entry::new(conn.clone(), decoder, permit)) {
            warn!("connection {}: receive worker gone", id);
            conn.abort();
            drop(entry);
        }
    }
}

struct Running {
    accept: thread::JoinHandle<()>,
    accept_waker: Arc<Waker>,
    workers: Vec<Worker>,
    sender: thread::JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct Listener {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Listener {
    pub fn new<H: MessageHandler>(config: Config, handler: H) -> Self {
        let shared = Shared {
            config,
            state: AtomicU8::new(ListenerState::Stopped as u8),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            accept_reserved: AtomicBool::new(false),
            connections: DashMap::new(),
            permits: Semaphore::new(config.max_connections),
            recv_pool: pool::buffer_pool(config.max_connections, config.buffer_size),
            send_pool: pool::send_buffer_pool(config.max_connections, config.buffer_size),
            queue: SendQueue::new(),
            observers: RwLock::new(Vec::new()),
            handler: Box::new(handler),
        };
        Self {
            shared: Arc::new(shared),
            running: Mutex::new(None),
        }
    }

    pub fn observe(&self, observer: Arc<dyn Observer>) {
        self.shared.observers.write().push(observer);
    }

    /// Bind and start accepting. Returns the bound address.
    ///
    /// Only bind and listen failures are reported here; later accept
    /// failures are logged and the loop continues.
    pub fn start<A: ToSocketAddrs>(&self, addr: A) -> Result<SocketAddr> {
        let mut running = self.running.lock();
        if self.shared.is_shutdown() {
            return Err(Error::InvalidState("listener was stopped"));
        }
        if running.is_some() {
            return Err(Error::InvalidState("listener already started"));
        }

        self.shared.set_state(ListenerState::Starting);
        self.shared.notify(|o| o.server_starting());

        match self.launch(addr) {
            Ok(r) => {
                let addr = r.local_addr;
                *running = Some(r);
                self.shared.set_state(ListenerState::Accepting);
                info!("listening on {}", addr);
                self.shared.notify(|o| o.server_started(addr));
                Ok(addr)
            }
            Err(e) => {
                self.shared.set_state(ListenerState::Stopped);
                Err(e)
            }
        }
    }

    fn launch<A: ToSocketAddrs>(&self, addr: A) -> Result<Running> {
        let config = &self.shared.config;
        let mut listener = bind(addr, config.listen_backlog)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        let accept_waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let mut workers = Vec::with_capacity(config.recv_workers);
        for i in 0..config.recv_workers {
            match Worker::spawn(i, self.shared.clone()) {
                Ok(w) => workers.push(w),
                Err(e) => {
                    self.abandon(workers, None);
                    return Err(e.into());
                }
            }
        }

        let sender = match send_queue::spawn_worker(self.shared.clone()) {
            Ok(s) => s,
            Err(e) => {
                self.abandon(workers, None);
                return Err(e.into());
            }
        };

        let ports: Vec<Port> = workers.iter().map(Worker::port).collect();
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(String::from("rawrpc-a"))
            .spawn(move || accept_loop(shared, listener, poll, ports));
        let accept = match spawned {
            Ok(a) => a,
            Err(e) => {
                self.abandon(workers, Some(sender));
                return Err(e.into());
            }
        };

        Ok(Running {
            accept,
            accept_waker,
            workers,
            sender,
            local_addr,
        })
    }

    // Tear down threads of a start that failed half way.
    fn abandon(&self, workers: Vec<Worker>, sender: Option<thread::JoinHandle<()>>) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.queue.close();
        for w in workers {
            w.join();
        }
        if let Some(s) = sender {
            let _ = s.join();
        }
    }

    /// Stop accepting, close all connections and drop queued packages.
    ///
    /// Blocks until every listener thread has exited. Does nothing if the
    /// listener is not running.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let shared = &self.shared;

        shared.shutdown.store(true, Ordering::Release);
        shared.queue.close();
        shared.set_state(ListenerState::Stopping);
        info!("listener on {} stopping", running.local_addr);
        shared.notify(|o| o.server_stopping());

        shared.permits.close();
        let _ = running.accept_waker.wake();
        if running.accept.join().is_err() {
            error!("accept thread panicked");
        }

        let conns: Vec<Arc<Connection>> = shared
            .connections
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for conn in conns {
            conn.close();
        }

        for w in running.workers {
            w.join();
        }
        if running.sender.join().is_err() {
            error!("send worker panicked");
        }

        shared.recv_pool.dispose();
        shared.send_pool.dispose();

        shared.set_state(ListenerState::Stopped);
        info!("listener on {} stopped", running.local_addr);
        shared.notify(|o| o.server_stopped());
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.shared.connections.get(&id).map(|e| e.value().clone())
    }

    /// Ids of the live connections, ascending.
    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.shared.connections.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Queue `body` to connection `id`, length-prefixed on the wire.
    pub fn send(&self, id: u64, body: Vec<u8>) -> Result<()> {
        self.connection(id)
            .ok_or(Error::ConnectionClosed)?
            .send(body)
    }

    pub fn send_text(&self, id: u64, text: &str) -> Result<()> {
        self.connection(id)
            .ok_or(Error::ConnectionClosed)?
            .send_text(text)
    }

    pub fn queued_packages(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn recv_pool_stats(&self) -> PoolStats {
        self.shared.recv_pool.stats()
    }

    pub fn send_pool_stats(&self) -> PoolStats {
        self.shared.send_pool.stats()
    }

    /// Permits not held by a live connection.
    ///
    /// The accept thread takes a permit before it waits for the next
    /// client; that one is counted as available.
    pub fn available_permits(&self) -> usize {
        let reserved = self.shared.accept_reserved.load(Ordering::Acquire);
        self.shared.permits.available() + reserved as usize
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind<A: ToSocketAddrs>(addr: A, backlog: i32) -> Result<TcpListener> {
    let mut last_err = None;
    for addr in addr.to_socket_addrs()? {
        match bind_one(addr, backlog) {
            Ok(l) => return Ok(l),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "no address to bind"))
        .into())
}

fn bind_one(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut poll: Poll, ports: Vec<Port>) {
    let mut events = Events::with_capacity(16);
    let mut rri = 0;

    'outer: while !shared.is_shutdown() {
        // backpressure: the next accept waits for a free slot
        let Some(permit) = shared.permits.acquire() else {
            break;
        };
        shared.accept_reserved.store(true, Ordering::Release);

        let (stream, peer) = loop {
            if shared.is_shutdown() {
                break 'outer;
            }
            match listener.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if let Err(e) = poll.poll(&mut events, None) {
                        if e.kind() != ErrorKind::Interrupted {
                            error!("accept poll: {}", e);
                            break 'outer;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept: {}", e);
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        };

        shared.accept_reserved.store(false, Ordering::Release);
        let port = &ports[rri % ports.len()];
        rri += 1;
        shared.setup_connection(stream, peer, permit, port);
    }
    shared.accept_reserved.store(false, Ordering::Release);
    debug!("accept loop exits");
}
