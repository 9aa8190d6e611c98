//! Raw-socket RPC over length-prefixed TCP frames, in synchronous mode.
//!
//! There is no HTTP and no async runtime here. A client connects with plain
//! TCP and sends frames of `[u32 little-endian length][body]`. Each body is
//! a call envelope: a service hash, a method ordinal and positional
//! arguments. The server answers with the single result value or a fault.
//!
//! # Threads
//!
//! One thread accepts, a few receive workers multiplex all connections with
//! `mio`, and one send worker writes every outbound message. So each socket
//! has exactly one writer, and messages for a connection leave in the order
//! they were queued.
//!
//! ```text
//!         /-----------------------\
//!        (      TCP connections    )
//!         \--^-----------------+--/
//!            |                 |
//!            |send             |recv
//!     +======+=====+  +========V=======+
//!     |    send    |  |    receive     |
//!     |   worker   |  |    workers     |
//!     +======^=====+  +========+=======+
//!            |                 | frame
//!            |        +========V=======+
//!            +--------+   dispatcher   |
//!              reply  +========+=======+
//!                              |
//!                     +========V=======+
//!                     |   your code    |
//!                     +================+
//! ```
//!
//! Connection count is bounded by a semaphore: when all permits are taken
//! the accept loop waits, and new clients queue in the listen backlog
//! instead of being refused. Receive and send buffers come from pools sized
//! to the same bound.
//!
//! # Ordinals
//!
//! Method names never travel on the wire. Both ends sort the methods of an
//! interface by `name|param type|param type...` and number them from 1.
//! The [`service!`] macro declares an interface once and derives the server
//! adapter and the client proxy from the same signature list, so they
//! cannot disagree.
//!
//! Integers are always `i64` on the wire. Arguments are coerced to the
//! declared types exactly: a float is not accepted where an integer is
//! declared.
//!
//! # Usage
//!
//! ```no_run
//! rawrpc::service! {
//!     pub trait Calculator {
//!         fn add(&self, a: i64, b: i64) -> i64;
//!     }
//!     server CalculatorServer;
//!     proxy CalculatorProxy;
//! }
//!
//! struct Calc;
//!
//! impl Calculator for Calc {
//!     fn add(&self, a: i64, b: i64) -> rawrpc::Response<i64> {
//!         Ok(a + b)
//!     }
//! }
//!
//! fn main() -> rawrpc::Result<()> {
//!     rawrpc::Server::new(rawrpc::Config::new())
//!         .add_service(CalculatorServer::new(Calc))
//!         .serve("127.0.0.1:7000")
//! }
//! ```
//!
//! And on the client side:
//!
//! ```no_run
//! # rawrpc::service! {
//! #     pub trait Calculator {
//! #         fn add(&self, a: i64, b: i64) -> i64;
//! #     }
//! #     server CalculatorServer;
//! #     proxy CalculatorProxy;
//! # }
//! # fn main() -> rawrpc::Result<()> {
//! let client = std::sync::Arc::new(rawrpc::Client::connect("127.0.0.1:7000")?);
//! let calc = CalculatorProxy::new(client);
//! assert_eq!(calc.add(3, 4)?, 7);
//! # Ok(())
//! # }
//! ```
//!
//! For anything other than RPC, a [`Listener`] takes any
//! [`MessageHandler`] and exposes the raw frames.

use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;

mod macros;
mod poll;
mod send_queue;

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod listener;
pub mod pool;
pub mod semaphore;
pub mod service;
pub mod status;
pub mod value;

pub use client::{Client, ClientConfig};
pub use config::Config;
pub use connection::{Connection, ConnectionInfo};
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use listener::{Listener, ListenerState, MessageHandler, Observer};
pub use service::Service;
pub use status::{Code, Status};
pub use value::{FromValue, IntoValue, Value};

/// Result of a server method.
pub type Response<T> = std::result::Result<T, Status>;

/// A listener with an RPC dispatcher installed.
pub struct Server {
    config: Config,
    dispatcher: Dispatcher,
    observers: Vec<std::sync::Arc<dyn Observer>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            dispatcher: Dispatcher::new().strict(config.strict),
            observers: Vec::new(),
        }
    }

    pub fn add_service<S: Service>(mut self, service: S) -> Self {
        self.dispatcher.add_service(service);
        self
    }

    pub fn observe(mut self, observer: std::sync::Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Start listening and return the running listener.
    ///
    /// Dropping the listener stops it.
    pub fn start<A: ToSocketAddrs>(self, addr: A) -> Result<Listener> {
        let listener = Listener::new(self.config, self.dispatcher);
        for o in self.observers {
            listener.observe(o);
        }
        listener.start(addr)?;
        Ok(listener)
    }

    /// Start listening and block the calling thread forever.
    pub fn serve<A: ToSocketAddrs>(self, addr: A) -> Result<()> {
        let _listener = self.start(addr)?;
        loop {
            thread::park();
        }
    }

    /// Like `start`, also returning the bound address.
    pub fn bind<A: ToSocketAddrs>(self, addr: A) -> Result<(Listener, SocketAddr)> {
        let listener = self.start(addr)?;
        let addr = listener
            .local_addr()
            .ok_or(Error::InvalidState("listener not running"))?;
        Ok((listener, addr))
    }
}
