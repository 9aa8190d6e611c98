//! Receive workers.
//!
//! Each worker owns a `mio::Poll` and a slab of connections. The accept
//! thread hands new connections over through a channel and wakes the worker
//! with its `Waker`. Sockets are registered edge-triggered, so a readable
//! event is followed by reads until `WouldBlock`.

use std::io::ErrorKind;
use std::sync::{mpsc, Arc};
use std::thread;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::connection::Connection;
use crate::frame::FrameDecoder;
use crate::listener::Shared;
use crate::macros::{debug, error, trace, warn};
use crate::pool::Pooled;
use crate::semaphore::Permit;

const WAKER: usize = usize::MAX;

/// A connection and its partial-frame buffer, owned by one worker.
///
/// The entry also holds the connection permit. Fields drop in order, so
/// the receive buffer is back in its pool before the permit lets the
/// accept thread take another connection.
pub(crate) struct Entry {
    conn: Arc<Connection>,
    decoder: FrameDecoder<Pooled<Vec<u8>>>,
    _permit: Permit,
}

impl Entry {
    pub(crate) fn new(
        conn: Arc<Connection>,
        decoder: FrameDecoder<Pooled<Vec<u8>>>,
        permit: Permit,
    ) -> Self {
        Self {
            conn,
            decoder,
            _permit: permit,
        }
    }

    // Read until WouldBlock and dispatch every complete frame.
    // Returns false once the connection is closed.
    fn pump(&mut self, shared: &Shared) -> bool {
        loop {
            if self.conn.is_closed() {
                return false;
            }

            let spare = match self.decoder.spare_mut() {
                Ok(spare) => spare,
                Err(e) => {
                    warn!("connection {}: {}", self.conn.id(), e);
                    self.conn.close();
                    return false;
                }
            };
            match self.conn.read(spare) {
                Ok(0) => {
                    debug!("connection {}: closed by peer", self.conn.id());
                    self.conn.close();
                    return false;
                }
                Ok(n) => self.decoder.filled(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("connection {}: read failed: {}", self.conn.id(), e);
                    self.conn.close();
                    return false;
                }
            }

            loop {
                match self.decoder.next_frame() {
                    Ok(Some(body)) => {
                        trace!("connection {}: frame of {} bytes", self.conn.id(), body.len());
                        shared.notify(|o| o.message_received(&self.conn, body));
                        if let Err(e) = shared.handler.on_message(&self.conn, body) {
                            warn!("connection {}: {}", self.conn.id(), e);
                            self.conn.close();
                            return false;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("connection {}: {}", self.conn.id(), e);
                        self.conn.close();
                        return false;
                    }
                }
            }
        }
    }
}

/// Sending side of a worker, held by the accept thread.
#[derive(Clone)]
pub(crate) struct Port {
    entry_tx: mpsc::Sender<Entry>,
    waker: Arc<Waker>,
}

impl Port {
    /// Hand a connection over. Gives the entry back if the worker is gone.
    pub(crate) fn hand_off(&self, entry: Entry) -> Result<(), Entry> {
        self.entry_tx.send(entry).map_err(|e| e.0)?;
        if let Err(e) = self.waker.wake() {
            error!("wake receive worker: {}", e);
        }
        Ok(())
    }
}

pub(crate) struct Worker {
    port: Port,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn(index: usize, shared: Arc<Shared>) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), Token(WAKER))?);
        let (entry_tx, entry_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("rawrpc-r{index}"))
            .spawn(move || worker_loop(poll, entry_rx, shared))?;

        Ok(Self {
            port: Port { entry_tx, waker },
            thread,
        })
    }

    pub(crate) fn port(&self) -> Port {
        self.port.clone()
    }

    /// Wake the worker and wait for it. The shutdown flag must be set.
    pub(crate) fn join(self) {
        let _ = self.port.waker.wake();
        if self.thread.join().is_err() {
            error!("receive worker panicked");
        }
    }
}

fn worker_loop(mut poll: Poll, entry_rx: mpsc::Receiver<Entry>, shared: Arc<Shared>) {
    let mut slab: Slab<Entry> = Slab::new();
    let mut events = Events::with_capacity(128);

    'outer: loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!("receive worker poll: {}", e);
            break;
        }

        for event in events.iter() {
            match event.token().0 {
                WAKER => {
                    if shared.is_shutdown() {
                        break 'outer;
                    }
                    while let Ok(entry) = entry_rx.try_recv() {
                        let fd = entry.conn.raw_fd();
                        let key = slab.vacant_key();
                        let registered = poll.registry().register(
                            &mut SourceFd(&fd),
                            Token(key),
                            Interest::READABLE,
                        );
                        if let Err(e) = registered {
                            warn!("connection {}: register: {}", entry.conn.id(), e);
                            entry.conn.abort();
                            continue;
                        }
                        slab.insert(entry);
                    }
                }
                token => {
                    let Some(entry) = slab.get_mut(token) else {
                        continue;
                    };
                    if !entry.pump(&shared) {
                        let fd = entry.conn.raw_fd();
                        let _ = poll.registry().deregister(&mut SourceFd(&fd));
                        slab.remove(token);
                    }
                }
            }
        }
    }

    // connections handed over but never registered
    while let Ok(entry) = entry_rx.try_recv() {
        entry.conn.close();
    }
    for (_, entry) in slab {
        entry.conn.close();
    }
}
