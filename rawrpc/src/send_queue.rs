//! The listener-wide outbound queue and its single worker.
//!
//! Every outbound message of every connection goes through this FIFO, and
//! one thread writes them in enqueue order, so each socket has exactly one
//! writer. Once closed the queue refuses new packages, and whatever is left
//! is dropped with a notification instead of being flushed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::connection::{Connection, WriteWaiter};
use crate::listener::Shared;
use crate::macros::{debug, warn};
use crate::pool::Pooled;

pub enum Payload {
    Owned(Vec<u8>),
    /// Goes back to the send pool once the package is dropped.
    Pooled(Pooled<Vec<u8>>),
}

impl Payload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Owned(v) => v,
            Payload::Pooled(p) => p,
        }
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        match self {
            Payload::Owned(v) => v,
            Payload::Pooled(p) => p,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

pub struct Package {
    pub connection: Arc<Connection>,
    pub payload: Payload,
    /// Prefix the payload with its length on the wire.
    pub need_head: bool,
}

#[derive(Default)]
pub(crate) struct SendQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Package>,
    closed: bool,
}

impl SendQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a package. Hands it back if the queue is closed.
    pub(crate) fn push(&self, package: Package) -> Result<(), Package> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(package);
        }
        state.items.push_back(package);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Wait for the next package. `None` once closed, even if packages remain.
    pub(crate) fn take(&self) -> Option<Package> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(package) = state.items.pop_front() {
                return Some(package);
            }
            self.ready.wait(&mut state);
        }
    }

    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub(crate) fn drain(&self) -> Vec<Package> {
        self.state.lock().items.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

pub(crate) fn spawn_worker(shared: Arc<Shared>) -> std::io::Result<thread::JoinHandle<()>> {
    let waiter = WriteWaiter::new()?;
    thread::Builder::new()
        .name(String::from("rawrpc-s"))
        .spawn(move || worker_loop(shared, waiter))
}

fn worker_loop(shared: Arc<Shared>, mut waiter: WriteWaiter) {
    while let Some(package) = shared.queue.take() {
        let conn = &package.connection;
        if conn.is_closed() {
            shared.message_dropped(&package);
            continue;
        }

        let len = package.payload.len();
        shared.notify(|o| o.message_sending(conn, len));
        match conn.write_package(&package, &mut waiter) {
            Ok(()) => shared.notify(|o| o.message_sent(conn, len)),
            Err(e) => {
                warn!("connection {}: write failed: {}", conn.id(), e);
                conn.close();
            }
        }
    }

    let rest = shared.queue.drain();
    if !rest.is_empty() {
        debug!("send queue: dropping {} packages on shutdown", rest.len());
    }
    for package in rest {
        shared.message_dropped(&package);
    }
}
