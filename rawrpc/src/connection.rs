//! One accepted socket.
//!
//! A `Connection` is shared between its receive worker (reads), the send
//! worker (writes) and the listener's table. Reads and writes go through
//! `&TcpStream`, so no lock guards the socket itself.
//!
//! Closing is idempotent: the first caller shuts the socket down, leaves
//! the table and raises the notification. The connection permit and the
//! receive buffer belong to the receive worker's entry and are released
//! together when the worker drops it. The descriptor is closed when the
//! last reference is dropped.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use crate::error::Error;
use crate::frame;
use crate::listener::Shared;
use crate::macros::{debug, trace};
use crate::pool::Pooled;
use crate::send_queue::{Package, Payload};

/// Identity of a connection, as passed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub time: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseKind {
    Closed,
    Aborted,
}

pub struct Connection {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    closed: AtomicBool,
    shared: Weak<Shared>,
    write_timeout: Duration,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        stream: TcpStream,
        shared: Weak<Shared>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            closed: AtomicBool::new(false),
            shared,
            write_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer: self.peer,
            time: SystemTime::now(),
        }
    }

    /// Queue `body` for sending. The length prefix is added on the wire.
    ///
    /// Bodies above the listener's `max_frame_size` are refused with
    /// `FrameTooLarge`.
    pub fn send(self: &Arc<Self>, body: Vec<u8>) -> Result<(), Error> {
        self.enqueue(Payload::Owned(body), true)
    }

    /// Queue UTF-8 text as one frame.
    pub fn send_text(self: &Arc<Self>, text: &str) -> Result<(), Error> {
        self.send(text.as_bytes().to_vec())
    }

    /// Queue a payload that already carries its length prefix.
    pub(crate) fn send_framed(self: &Arc<Self>, payload: Payload) -> Result<(), Error> {
        self.enqueue(payload, false)
    }

    fn enqueue(self: &Arc<Self>, payload: Payload, need_head: bool) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let shared = self.shared.upgrade().ok_or(Error::ChannelClosed)?;

        let body_len = if need_head {
            payload.len()
        } else {
            payload.len().saturating_sub(frame::HEAD_SIZE)
        };
        let max = shared.config.max_frame_size;
        if body_len > max {
            return Err(Error::FrameTooLarge(body_len, max));
        }

        let package = Package {
            connection: self.clone(),
            payload,
            need_head,
        };
        shared.queue.push(package).map_err(|package| {
            shared.message_dropped(&package);
            Error::ChannelClosed
        })
    }

    /// Rent an empty buffer from the listener's send pool.
    ///
    /// Returns `None` when the pool is exhausted or disposed; callers fall
    /// back to an owned buffer.
    pub fn rent_send_buffer(&self) -> Option<Pooled<Vec<u8>>> {
        self.shared.upgrade()?.send_pool.try_rent()
    }

    /// Close after an orderly end: peer disconnect, protocol error,
    /// write failure or shutdown.
    pub fn close(&self) -> bool {
        self.close_with(CloseKind::Closed)
    }

    /// Close a connection that failed during setup.
    pub(crate) fn abort(&self) -> bool {
        self.close_with(CloseKind::Aborted)
    }

    fn close_with(&self, kind: CloseKind) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("connection {} {:?}", self.id, kind);

        // wakes the receive worker, which then drops its entry
        let _ = self.stream.shutdown(Shutdown::Both);

        if let Some(shared) = self.shared.upgrade() {
            shared.connections.remove(&self.id);
            shared.connection_finished(self, kind);
        }
        true
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&self.stream).read(buf)
    }

    pub(crate) fn write_package(
        &self,
        package: &Package,
        waiter: &mut WriteWaiter,
    ) -> Result<(), Error> {
        let deadline = Instant::now() + self.write_timeout;
        let body = package.payload.as_slice();
        if package.need_head {
            let mut head = [0; frame::HEAD_SIZE];
            frame::build_head(body.len(), &mut head);
            self.write_all(&head, waiter, deadline)?;
        }
        self.write_all(body, waiter, deadline)?;
        trace!("connection {}: wrote {} bytes", self.id, body.len());
        Ok(())
    }

    fn write_all(
        &self,
        mut buf: &[u8],
        waiter: &mut WriteWaiter,
        deadline: Instant,
    ) -> Result<(), Error> {
        while !buf.is_empty() {
            match (&self.stream).write(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    waiter.wait(self.raw_fd(), deadline)?;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Blocks the send worker until a socket becomes writable.
///
/// The socket stays registered for reads with its receive worker, so it is
/// registered here by raw descriptor, only for the duration of one wait.
pub(crate) struct WriteWaiter {
    poll: Poll,
    events: Events,
}

impl WriteWaiter {
    pub(crate) fn new() -> std::io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1),
        })
    }

    fn wait(&mut self, fd: RawFd, deadline: Instant) -> Result<(), Error> {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::WriteTimeout);
        }

        let mut source = SourceFd(&fd);
        self.poll
            .registry()
            .register(&mut source, Token(0), Interest::WRITABLE)?;
        let polled = self.poll.poll(&mut self.events, Some(deadline - now));
        self.poll.registry().deregister(&mut source)?;

        match polled {
            Ok(()) if self.events.is_empty() => Err(Error::WriteTimeout),
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
